//! Change classification: field deltas to typed change records

use crate::compare::{FieldDelta, ToggleTransition};
use crate::error::{Error, Result};
use crate::fields::{FieldKind, FieldValue, Fields};
use crate::model::{ComponentOptions, EntityRef, EntitySnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of change, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Remove,
    Create,
    Flavor,
    NodeCount,
    RatioConfig,
    ComponentToggle,
    Codes,
    Settings,
    AccessGrant,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Remove => "remove",
            Self::Create => "create",
            Self::Flavor => "flavor",
            Self::NodeCount => "node_count",
            Self::RatioConfig => "ratio_config",
            Self::ComponentToggle => "component_toggle",
            Self::Codes => "codes",
            Self::Settings => "settings",
            Self::AccessGrant => "access_grant",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Add,
    Remove,
    Modify,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Modify => "modify",
        })
    }
}

/// Kind-specific detail of a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangePayload {
    Entity(EntitySnapshot),
    Flavor {
        from: Option<String>,
        to: String,
    },
    NodeCount {
        field: String,
        from: u32,
        to: u32,
    },
    Ratio {
        field: String,
        value: Option<f64>,
    },
    Component {
        name: String,
        transition: ToggleTransition,
        options: Option<ComponentOptions>,
    },
    Codes {
        field: String,
        added: BTreeSet<String>,
        removed: BTreeSet<String>,
    },
    Settings {
        field: String,
        value: Option<FieldValue>,
    },
    Grant {
        group: String,
    },
}

/// One classified difference between the desired and observed trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity: EntityRef,
    pub kind: ChangeKind,
    pub direction: Direction,
    /// Node delta, number of codes touched, or zero
    pub magnitude: u32,
    pub payload: ChangePayload,
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.entity, self.kind, self.direction)?;
        if self.magnitude > 0 {
            write!(f, " {}", self.magnitude)?;
        }
        match &self.payload {
            ChangePayload::Flavor { to, .. } => write!(f, " -> {to}"),
            ChangePayload::Component {
                name, transition, ..
            } => write!(f, " {name} ({transition})"),
            ChangePayload::Ratio { field, value } => match value {
                Some(v) => write!(f, " {field}={v}"),
                None => write!(f, " {field} cleared"),
            },
            ChangePayload::Settings { field, .. } | ChangePayload::Codes { field, .. } => {
                write!(f, " {field}")
            }
            ChangePayload::Grant { group } => write!(f, " {group}"),
            ChangePayload::Entity(_) | ChangePayload::NodeCount { .. } => Ok(()),
        }
    }
}

fn unmapped(entity: &EntityRef, delta: &FieldDelta) -> Error {
    Error::Classification {
        entity: entity.to_string(),
        field: delta.field.clone(),
    }
}

/// Classify one field delta
///
/// Every delta maps to at least one record; a delta whose kind and values do
/// not line up is an error rather than a silent drop.
pub fn classify(entity: &EntityRef, delta: &FieldDelta) -> Result<Vec<ChangeRecord>> {
    let record = |kind, direction, magnitude, payload| ChangeRecord {
        entity: entity.clone(),
        kind,
        direction,
        magnitude,
        payload,
    };

    let records = match (delta.kind, &delta.old, &delta.new) {
        (FieldKind::Flavor, old, Some(FieldValue::Text(to))) => {
            let from = match old {
                Some(FieldValue::Text(from)) => Some(from.clone()),
                _ => None,
            };
            vec![record(
                ChangeKind::Flavor,
                Direction::Modify,
                0,
                ChangePayload::Flavor {
                    from,
                    to: to.clone(),
                },
            )]
        }
        (FieldKind::NodeCount, old, Some(FieldValue::Count(to))) => {
            let from = match old {
                Some(FieldValue::Count(from)) => *from,
                None => 0,
                Some(_) => return Err(unmapped(entity, delta)),
            };
            let direction = if *to > from {
                Direction::Add
            } else {
                Direction::Remove
            };
            vec![record(
                ChangeKind::NodeCount,
                direction,
                to.abs_diff(from),
                ChangePayload::NodeCount {
                    field: delta.field.clone(),
                    from,
                    to: *to,
                },
            )]
        }
        (FieldKind::Ratio, _, new @ (Some(FieldValue::Ratio(_)) | None)) => {
            let value = match new {
                Some(FieldValue::Ratio(v)) => Some(*v),
                _ => None,
            };
            let direction = if value.is_some() {
                Direction::Modify
            } else {
                Direction::Remove
            };
            vec![record(
                ChangeKind::RatioConfig,
                direction,
                0,
                ChangePayload::Ratio {
                    field: delta.field.clone(),
                    value,
                },
            )]
        }
        (FieldKind::Components, _, _) => {
            let Some(component) = &delta.component else {
                return Err(unmapped(entity, delta));
            };
            let direction = match component.transition {
                ToggleTransition::Enable => Direction::Add,
                ToggleTransition::Disable => Direction::Remove,
                ToggleTransition::Reconfigure => Direction::Modify,
            };
            vec![record(
                ChangeKind::ComponentToggle,
                direction,
                0,
                ChangePayload::Component {
                    name: component.name.clone(),
                    transition: component.transition,
                    options: component.options.clone(),
                },
            )]
        }
        (FieldKind::Codes, old, Some(FieldValue::Set(new))) => {
            let old = match old {
                Some(FieldValue::Set(old)) => old.clone(),
                None => BTreeSet::new(),
                Some(_) => return Err(unmapped(entity, delta)),
            };
            let added: BTreeSet<String> = new.difference(&old).cloned().collect();
            let removed: BTreeSet<String> = old.difference(new).cloned().collect();
            let touched = (added.len() + removed.len()) as u32;
            vec![record(
                ChangeKind::Codes,
                Direction::Modify,
                touched,
                ChangePayload::Codes {
                    field: delta.field.clone(),
                    added,
                    removed,
                },
            )]
        }
        (FieldKind::Settings, _, new) => vec![record(
            ChangeKind::Settings,
            Direction::Modify,
            0,
            ChangePayload::Settings {
                field: delta.field.clone(),
                value: new.clone(),
            },
        )],
        (FieldKind::AccessGroups, old, Some(FieldValue::Set(new))) => {
            let old = match old {
                Some(FieldValue::Set(old)) => old.clone(),
                None => BTreeSet::new(),
                Some(_) => return Err(unmapped(entity, delta)),
            };
            let granted = new.difference(&old).map(|g| (g, Direction::Add));
            let revoked = old.difference(new).map(|g| (g, Direction::Remove));
            granted
                .chain(revoked)
                .map(|(group, direction)| {
                    record(
                        ChangeKind::AccessGrant,
                        direction,
                        1,
                        ChangePayload::Grant {
                            group: group.clone(),
                        },
                    )
                })
                .collect()
        }
        _ => return Err(unmapped(entity, delta)),
    };

    Ok(records)
}

/// Classify every delta of one entity
pub fn classify_all(entity: &EntityRef, deltas: &[FieldDelta]) -> Result<Vec<ChangeRecord>> {
    let mut records = Vec::new();
    for delta in deltas {
        records.extend(classify(entity, delta)?);
    }
    Ok(records)
}

/// Records for fields of `entity` that are set to something other than the
/// blank value, restricted to fields the creation call does not cover.
pub fn synthetic_records<T: Fields>(
    entity_ref: &EntityRef,
    entity: &T,
    blank: &T,
    covered: &[&str],
) -> Result<Vec<ChangeRecord>> {
    let deltas: Vec<FieldDelta> = crate::compare::compare(entity, blank)
        .into_iter()
        .filter(|d| {
            let base = d.field.split('.').next().unwrap_or(&d.field);
            !covered.contains(&base)
        })
        .collect();
    let mut records = classify_all(entity_ref, &deltas)?;
    for record in &mut records {
        if record.direction == Direction::Modify {
            record.direction = Direction::Add;
        }
    }
    Ok(records)
}

/// Records that clear every declared ratio of an implicit entity
pub fn clearing_records<T: Fields>(entity_ref: &EntityRef, entity: &T) -> Vec<ChangeRecord> {
    entity
        .fields()
        .into_iter()
        .filter(|f| f.kind == FieldKind::Ratio && f.value.is_some())
        .map(|f| ChangeRecord {
            entity: entity_ref.clone(),
            kind: ChangeKind::RatioConfig,
            direction: Direction::Remove,
            magnitude: 0,
            payload: ChangePayload::Ratio {
                field: f.name.to_string(),
                value: None,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::compare;
    use crate::model::{EntityKind, Quota, Region, Role};

    fn r1() -> EntityRef {
        EntityRef::named(EntityKind::Region, "r1")
    }

    fn region(size: u32, flavor: &str) -> Region {
        Region {
            name: Some("r1".into()),
            flavor: flavor.into(),
            size,
            ..Default::default()
        }
    }

    #[test]
    fn test_node_count_add() {
        let deltas = compare(&region(4, "F1"), &region(2, "F1"));
        let records = classify_all(&r1(), &deltas).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::NodeCount);
        assert_eq!(records[0].direction, Direction::Add);
        assert_eq!(records[0].magnitude, 2);
    }

    #[test]
    fn test_node_count_delete() {
        let deltas = compare(&region(1, "F1"), &region(4, "F1"));
        let records = classify_all(&r1(), &deltas).unwrap();
        assert_eq!(records[0].direction, Direction::Remove);
        assert_eq!(records[0].magnitude, 3);
    }

    #[test]
    fn test_flavor_only() {
        let deltas = compare(&region(4, "F2"), &region(4, "F1"));
        let records = classify_all(&r1(), &deltas).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].payload,
            ChangePayload::Flavor {
                from: Some("F1".into()),
                to: "F2".into()
            }
        );
    }

    #[test]
    fn test_codes_are_set_compared() {
        let mut desired = region(2, "F1");
        desired.zones = vec!["z2".into(), "z1".into()];
        let mut observed = region(2, "F1");
        observed.zones = vec!["z1".into(), "z2".into()];
        assert!(classify_all(&r1(), &compare(&desired, &observed)).unwrap().is_empty());

        observed.zones = vec!["z1".into(), "z3".into()];
        let records = classify_all(&r1(), &compare(&desired, &observed)).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].payload {
            ChangePayload::Codes { added, removed, .. } => {
                assert!(added.contains("z2"));
                assert!(removed.contains("z3"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(records[0].magnitude, 2);
    }

    #[test]
    fn test_access_groups_split_per_group() {
        let desired = Role {
            name: "master".into(),
            flavor: "F1".into(),
            count: 3,
            access_groups: ["ops".to_string(), "dev".to_string()].into(),
        };
        let observed = Role {
            access_groups: ["ops".to_string(), "audit".to_string()].into(),
            ..desired.clone()
        };
        let entity = EntityRef::named(EntityKind::Role, "master");
        let records = classify_all(&entity, &compare(&desired, &observed)).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.kind == ChangeKind::AccessGrant));
        assert!(
            records
                .iter()
                .any(|r| r.direction == Direction::Add
                    && r.payload == ChangePayload::Grant { group: "dev".into() })
        );
        assert!(
            records
                .iter()
                .any(|r| r.direction == Direction::Remove
                    && r.payload == ChangePayload::Grant { group: "audit".into() })
        );
    }

    #[test]
    fn test_mismatched_value_is_classification_error() {
        let delta = FieldDelta {
            field: "size".into(),
            kind: FieldKind::NodeCount,
            old: None,
            new: Some(FieldValue::Text("four".into())),
            component: None,
        };
        let err = classify(&r1(), &delta).unwrap_err();
        assert!(matches!(err, Error::Classification { .. }));
    }

    #[test]
    fn test_synthetic_records_skip_covered_fields() {
        let mut region = region(12, "F1");
        region.labels.insert("tier".into(), "gold".into());
        region
            .components
            .insert("gpu".into(), crate::model::ComponentToggle::enabled());
        let records = synthetic_records(
            &r1(),
            &region,
            &Region::default(),
            &["flavor", "size", "zones"],
        )
        .unwrap();
        let kinds: Vec<ChangeKind> = records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Settings, ChangeKind::ComponentToggle]);
        assert!(records.iter().all(|r| r.direction == Direction::Add));
    }

    #[test]
    fn test_clearing_records_only_for_set_ratios() {
        let quota = Quota {
            principal: "svc".into(),
            produce_rate: Some(1024.0),
            consume_rate: None,
        };
        let entity = EntityRef::named(EntityKind::Quota, "svc");
        let records = clearing_records(&entity, &quota);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].payload,
            ChangePayload::Ratio {
                field: "produce_rate".into(),
                value: None
            }
        );
    }
}
