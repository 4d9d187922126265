//! Merge instructions: incremental updates of a caller's stored state
//!
//! Every action that succeeds yields a [`MergeInstruction`] saying which part
//! of the stored (observed) tree now matches the desired tree. Applying them
//! in order lets a caller keep its state current without re-reading the
//! backend after every call.

use crate::differ::Keyed;
use crate::error::{Error, Result};
use crate::executor::ApplyOutcome;
use crate::fields::{COMPONENT_PREFIX, FieldValue, Fields};
use crate::model::{BrokerConfig, ClusterConfig, EntityKind, EntityRef, Lifecycle};
use crate::planner::{Action, ActionKind};
use serde::Serialize;

/// Change to one entity of the stored tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum StateUpdate {
    /// Insert the entity with its creation fields
    Insert {
        name: String,
        initial_size: Option<u32>,
    },
    Remove,
    /// Copy one field (or `components.<name>` entry) from the desired entity
    Copy { field: String },
    /// Adjust the size field
    Scale { delta: i64 },
    /// Add or remove one member of a set field
    Member {
        field: String,
        member: String,
        present: bool,
    },
}

/// Which part of the stored tree an applied action brought up to date
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeInstruction {
    /// Position of the action in the plan
    pub action: usize,
    /// Entity in the stored tree, under its resolved name
    pub target: EntityRef,
    /// Position of the matching entity in the desired collection, if any
    pub source: Option<usize>,
    pub update: StateUpdate,
}

impl MergeInstruction {
    /// Instruction for an action that has been applied to `target`
    ///
    /// Returns `None` for actions with no stored-state counterpart.
    pub fn for_action(
        index: usize,
        action: &Action,
        target: EntityRef,
        source: Option<usize>,
        outcome: &ApplyOutcome,
    ) -> Option<Self> {
        let created_name = || match outcome {
            ApplyOutcome::Created { name } => Some(name.clone()),
            _ => target.key.name().map(String::from),
        };
        let update = match &action.kind {
            ActionKind::CreateRegion { initial_size, .. }
            | ActionKind::CreateIngressShard { initial_size, .. }
            | ActionKind::CreateRole { initial_size, .. } => StateUpdate::Insert {
                name: created_name()?,
                initial_size: Some(*initial_size),
            },
            ActionKind::CreateTopic { .. } => StateUpdate::Insert {
                name: created_name()?,
                initial_size: None,
            },
            ActionKind::GrantAcl { acl } => StateUpdate::Insert {
                name: acl.key(),
                initial_size: None,
            },
            ActionKind::RevokeAcl { .. } | ActionKind::RemoveEntity => StateUpdate::Remove,
            ActionKind::AddNodes { count } | ActionKind::AddPartitions { count } => {
                StateUpdate::Scale {
                    delta: i64::from(*count),
                }
            }
            ActionKind::DeleteNodes { count } => StateUpdate::Scale {
                delta: -i64::from(*count),
            },
            ActionKind::ChangeFlavor { .. } => StateUpdate::Copy {
                field: "flavor".into(),
            },
            ActionKind::SetRatio { field, .. }
            | ActionKind::UpdateCodes { field, .. }
            | ActionKind::UpdateSettings { field, .. } => StateUpdate::Copy {
                field: field.clone(),
            },
            ActionKind::ConfigureComponent { component, .. } => StateUpdate::Copy {
                field: format!("{COMPONENT_PREFIX}{component}"),
            },
            ActionKind::GrantAccess { group } | ActionKind::RevokeAccess { group } => {
                StateUpdate::Member {
                    field: "access_groups".into(),
                    member: group.clone(),
                    present: matches!(action.kind, ActionKind::GrantAccess { .. }),
                }
            }
            ActionKind::Uncordon => return None,
        };
        Some(Self {
            action: index,
            target,
            source,
            update,
        })
    }
}

/// Copy of `entity` holding only what its creation call sets
pub fn creation_copy<T: Keyed>(entity: &T) -> T {
    let blank = T::blank();
    let mut created = entity.clone();
    for field in entity.fields() {
        if !T::CREATION_FIELDS.contains(&field.name) {
            created.copy_field(field.name, &blank);
        }
    }
    created
}

fn merge_one<T: Keyed>(state: &mut Vec<T>, desired: &[T], merge: &MergeInstruction) -> Result<()> {
    let missing = || Error::MergeTarget {
        entity: merge.target.to_string(),
    };
    let blank = T::blank();
    let source = merge.source.and_then(|i| desired.get(i));

    if let StateUpdate::Insert { name, initial_size } = &merge.update {
        let from = source.ok_or_else(missing)?;
        let mut entity = match T::LIFECYCLE {
            Lifecycle::Grant => from.clone(),
            _ => creation_copy(from),
        };
        entity.assign_name(name);
        if let (Some(size), Some(field)) = (initial_size, T::SIZE_FIELD) {
            let current = entity
                .fields()
                .into_iter()
                .find(|f| f.name == field)
                .and_then(|f| match f.value {
                    Some(FieldValue::Count(n)) => Some(n),
                    _ => None,
                })
                .unwrap_or(0);
            entity.scale_field(field, i64::from(*size) - i64::from(current));
        }
        state.retain(|e| e.name().as_deref() != Some(name.as_str()));
        state.push(entity);
        return Ok(());
    }

    let name = merge.target.key.name().ok_or_else(missing)?;
    if matches!(merge.update, StateUpdate::Remove) {
        state.retain(|e| e.name().as_deref() != Some(name));
        return Ok(());
    }

    let position = match state.iter().position(|e| e.name().as_deref() == Some(name)) {
        Some(position) => position,
        // Implicit entities come into existence with their first field
        None if T::LIFECYCLE == Lifecycle::Implicit => {
            let mut entity = T::blank();
            entity.assign_name(name);
            state.push(entity);
            state.len() - 1
        }
        None => return Err(missing()),
    };
    let entity = &mut state[position];

    let known = match &merge.update {
        StateUpdate::Copy { field } => entity.copy_field(field, source.unwrap_or(&blank)),
        StateUpdate::Scale { delta } => T::SIZE_FIELD.is_some_and(|f| entity.scale_field(f, *delta)),
        StateUpdate::Member {
            field,
            member,
            present,
        } => entity.set_member(field, member, *present),
        StateUpdate::Insert { .. } | StateUpdate::Remove => true,
    };
    if !known {
        log::warn!("merge for {} ignored: {:?}", merge.target, merge.update);
    }
    Ok(())
}

/// Apply merge instructions to a stored tree, in order
pub fn apply_merges(
    state: &mut ClusterConfig,
    desired: &ClusterConfig,
    merges: &[MergeInstruction],
) -> Result<()> {
    let no_broker = BrokerConfig::default();
    for merge in merges {
        match merge.target.kind {
            EntityKind::Cluster => {
                if let StateUpdate::Copy { field } = &merge.update {
                    state.copy_field(field, desired);
                }
            }
            EntityKind::Role => merge_one(&mut state.roles, &desired.roles, merge)?,
            EntityKind::Region => merge_one(&mut state.regions, &desired.regions, merge)?,
            EntityKind::IngressShard => merge_one(&mut state.ingress, &desired.ingress, merge)?,
            EntityKind::Topic | EntityKind::Acl | EntityKind::Quota => {
                let from = desired.broker.as_ref().unwrap_or(&no_broker);
                let into = state.broker.get_or_insert_with(BrokerConfig::default);
                match merge.target.kind {
                    EntityKind::Topic => merge_one(&mut into.topics, &from.topics, merge)?,
                    EntityKind::Acl => merge_one(&mut into.acls, &from.acls, merge)?,
                    _ => merge_one(&mut into.quotas, &from.quotas, merge)?,
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComponentToggle, Region, Role};

    fn region_ref(name: &str) -> EntityRef {
        EntityRef::named(EntityKind::Region, name)
    }

    #[test]
    fn test_creation_copy_drops_follow_up_fields() {
        let mut region = Region {
            provisional: Some(4),
            flavor: "F1".into(),
            size: 12,
            zones: vec!["z1".into()],
            ..Default::default()
        };
        region.labels.insert("tier".into(), "gold".into());
        region
            .components
            .insert("gpu".into(), ComponentToggle::enabled());

        let created = creation_copy(&region);
        assert_eq!(created.provisional, Some(4));
        assert_eq!(created.size, 12);
        assert_eq!(created.zones, vec!["z1".to_string()]);
        assert!(created.labels.is_empty());
        assert!(created.components.is_empty());
    }

    #[test]
    fn test_insert_then_scale_then_copy() {
        let mut desired = ClusterConfig::default();
        let mut region = Region {
            flavor: "F1".into(),
            size: 12,
            ..Default::default()
        };
        region.labels.insert("tier".into(), "gold".into());
        desired.regions.push(region);

        let mut state = ClusterConfig::default();
        let merges = vec![
            MergeInstruction {
                action: 0,
                target: region_ref("region-1"),
                source: Some(0),
                update: StateUpdate::Insert {
                    name: "region-1".into(),
                    initial_size: Some(10),
                },
            },
            MergeInstruction {
                action: 1,
                target: region_ref("region-1"),
                source: Some(0),
                update: StateUpdate::Scale { delta: 2 },
            },
            MergeInstruction {
                action: 2,
                target: region_ref("region-1"),
                source: Some(0),
                update: StateUpdate::Copy {
                    field: "labels".into(),
                },
            },
        ];
        apply_merges(&mut state, &desired, &merges).unwrap();

        let merged = state.region("region-1").unwrap();
        assert_eq!(merged.size, 12);
        assert_eq!(merged.labels.get("tier").map(String::as_str), Some("gold"));
    }

    #[test]
    fn test_missing_target_is_an_error() {
        let mut state = ClusterConfig::default();
        let merges = vec![MergeInstruction {
            action: 0,
            target: region_ref("r1"),
            source: None,
            update: StateUpdate::Copy {
                field: "flavor".into(),
            },
        }];
        let err = apply_merges(&mut state, &ClusterConfig::default(), &merges).unwrap_err();
        assert!(matches!(err, Error::MergeTarget { .. }));
    }

    #[test]
    fn test_member_update() {
        let mut state = ClusterConfig {
            roles: vec![Role {
                name: "master".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let merges = vec![MergeInstruction {
            action: 0,
            target: EntityRef::named(EntityKind::Role, "master"),
            source: Some(0),
            update: StateUpdate::Member {
                field: "access_groups".into(),
                member: "ops".into(),
                present: true,
            },
        }];
        apply_merges(&mut state, &ClusterConfig::default(), &merges).unwrap();
        assert!(state.roles[0].access_groups.contains("ops"));
    }

    #[test]
    fn test_uncordon_has_no_merge() {
        let action = Action::new(region_ref("r1"), ActionKind::Uncordon);
        let merge = MergeInstruction::for_action(
            0,
            &action,
            region_ref("r1"),
            Some(0),
            &ApplyOutcome::Applied,
        );
        assert!(merge.is_none());
    }
}
