//! Structural comparison of two instances of one entity shape

use crate::fields::{COMPONENT_PREFIX, Field, FieldKind, FieldValue, Fields};
use crate::model::{ComponentOptions, ComponentToggle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// How a component's installed state moves between observed and desired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleTransition {
    Enable,
    Disable,
    /// Installed on both sides with different options
    Reconfigure,
}

impl fmt::Display for ToggleTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Reconfigure => "reconfigure",
        })
    }
}

/// One field that differs
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDelta {
    /// Field path; component entries are `components.<name>`
    pub field: String,
    pub kind: FieldKind,
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
    /// Set for component entries
    pub component: Option<ComponentDelta>,
}

/// Component-level detail of a delta
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDelta {
    pub name: String,
    pub transition: ToggleTransition,
    /// Desired options, when the component ends up installed
    pub options: Option<ComponentOptions>,
    /// Option fields that changed (reconfigure only)
    pub changed_options: Vec<String>,
}

/// Compare `desired` against `observed` field by field
///
/// A field the desired side does not declare is left alone, except component
/// toggles: a component installed on the observed side and missing or
/// uninstalled on the desired side is always reported as a disable.
pub fn compare<T: Fields>(desired: &T, observed: &T) -> Vec<FieldDelta> {
    let observed_fields: BTreeMap<&'static str, Field> = observed
        .fields()
        .into_iter()
        .map(|f| (f.name, f))
        .collect();

    let mut deltas = Vec::new();
    for field in desired.fields() {
        let old = observed_fields.get(field.name).and_then(|f| f.value.clone());

        if field.kind == FieldKind::Components {
            deltas.extend(compare_components(field.name, field.value.as_ref(), old.as_ref()));
            continue;
        }

        let Some(new) = field.value else {
            continue;
        };
        if old.as_ref() != Some(&new) {
            deltas.push(FieldDelta {
                field: field.name.to_string(),
                kind: field.kind,
                old,
                new: Some(new),
                component: None,
            });
        }
    }
    deltas
}

fn toggles(value: Option<&FieldValue>) -> BTreeMap<String, ComponentToggle> {
    match value {
        Some(FieldValue::Components(map)) => map.clone(),
        _ => BTreeMap::new(),
    }
}

fn compare_components(
    field: &str,
    desired: Option<&FieldValue>,
    observed: Option<&FieldValue>,
) -> Vec<FieldDelta> {
    let desired = toggles(desired);
    let observed = toggles(observed);
    let names: BTreeSet<&String> = desired.keys().chain(observed.keys()).collect();

    let mut deltas = Vec::new();
    for name in names {
        let want = desired.get(name);
        let have = observed.get(name);
        let want_installed = want.is_some_and(|t| t.installed);
        let have_installed = have.is_some_and(|t| t.installed);

        let (transition, changed_options) = match (want_installed, have_installed) {
            (false, true) => (ToggleTransition::Disable, Vec::new()),
            (true, false) => (ToggleTransition::Enable, Vec::new()),
            (true, true) => {
                let want_opts = want.and_then(|t| t.options.as_ref());
                let have_opts = have.and_then(|t| t.options.as_ref());
                if want_opts == have_opts {
                    continue;
                }
                let changed = match (want_opts, have_opts) {
                    (Some(w), Some(h)) => w.changed_fields(h),
                    (Some(o), None) | (None, Some(o)) => {
                        o.fields().into_iter().map(|(k, _)| k).collect()
                    }
                    (None, None) => Vec::new(),
                };
                (ToggleTransition::Reconfigure, changed)
            }
            (false, false) => continue,
        };

        let options = if transition == ToggleTransition::Disable {
            None
        } else {
            want.and_then(|t| t.options.clone())
        };

        deltas.push(FieldDelta {
            field: format!("{COMPONENT_PREFIX}{name}"),
            kind: FieldKind::Components,
            old: have.map(|t| single(name, t)),
            new: want.map(|t| single(name, t)),
            component: Some(ComponentDelta {
                name: name.clone(),
                transition,
                options,
                changed_options,
            }),
        });
    }
    log::trace!("{field}: {} component delta(s)", deltas.len());
    deltas
}

fn single(name: &str, toggle: &ComponentToggle) -> FieldValue {
    FieldValue::Components(BTreeMap::from([(name.to_string(), toggle.clone())]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterConfig, IngressShard, Region};

    fn region(size: u32, flavor: &str) -> Region {
        Region {
            name: Some("r1".into()),
            flavor: flavor.into(),
            size,
            ..Default::default()
        }
    }

    #[test]
    fn test_equal_entities_have_no_deltas() {
        let a = region(3, "F1");
        assert!(compare(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_reports_changed_fields_by_name() {
        let deltas = compare(&region(4, "F2"), &region(2, "F1"));
        let names: Vec<&str> = deltas.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(names, vec!["flavor", "size"]);
        assert_eq!(deltas[1].old, Some(FieldValue::Count(2)));
        assert_eq!(deltas[1].new, Some(FieldValue::Count(4)));
    }

    #[test]
    fn test_missing_component_on_desired_side_is_disable() {
        let desired = region(2, "F1");
        let mut observed = region(2, "F1");
        observed
            .components
            .insert("gpu".into(), ComponentToggle::enabled());

        let deltas = compare(&desired, &observed);
        assert_eq!(deltas.len(), 1);
        let component = deltas[0].component.as_ref().unwrap();
        assert_eq!(component.name, "gpu");
        assert_eq!(component.transition, ToggleTransition::Disable);
        assert_eq!(deltas[0].field, "components.gpu");
    }

    #[test]
    fn test_uninstalled_on_both_sides_is_unchanged() {
        let mut desired = region(2, "F1");
        desired
            .components
            .insert("gpu".into(), ComponentToggle::default());
        let observed = region(2, "F1");
        assert!(compare(&desired, &observed).is_empty());
    }

    #[test]
    fn test_enable_and_reconfigure() {
        let mut desired = ClusterConfig::default();
        desired.components.insert(
            "monitoring".into(),
            ComponentToggle::with_options(ComponentOptions::Monitoring {
                retention_days: 30,
                scrape_interval_secs: 15,
            }),
        );
        desired
            .components
            .insert("logging".into(), ComponentToggle::enabled());

        let mut observed = ClusterConfig::default();
        observed.components.insert(
            "monitoring".into(),
            ComponentToggle::with_options(ComponentOptions::Monitoring {
                retention_days: 7,
                scrape_interval_secs: 15,
            }),
        );

        let deltas = compare(&desired, &observed);
        assert_eq!(deltas.len(), 2);
        let logging = deltas[0].component.as_ref().unwrap();
        assert_eq!(logging.name, "logging");
        assert_eq!(logging.transition, ToggleTransition::Enable);
        let monitoring = deltas[1].component.as_ref().unwrap();
        assert_eq!(monitoring.transition, ToggleTransition::Reconfigure);
        assert_eq!(monitoring.changed_options, vec!["retention_days".to_string()]);
    }

    #[test]
    fn test_undeclared_scalar_is_left_alone() {
        let desired = ClusterConfig::default();
        let mut observed = ClusterConfig::default();
        observed.settings.version = Some("1.29".into());
        observed.settings.cpu_ratio = Some(2.0);
        assert!(compare(&desired, &observed).is_empty());
    }

    #[test]
    fn test_settings_map_difference() {
        let mut desired = IngressShard::default();
        desired.ports.insert("https".into(), 443);
        let observed = IngressShard::default();
        let deltas = compare(&desired, &observed);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].field, "ports");
        assert_eq!(deltas[0].kind, FieldKind::Settings);
    }
}
