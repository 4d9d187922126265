//! Declared fields of each entity shape
//!
//! Every entity lists its comparable fields once, tagged with the kind of
//! change a difference in that field represents. The comparator and the
//! classifier iterate these lists, so adding a field to an entity only means
//! adding one line to its `fields()` (and `copy_field()` for merging).

use crate::model::{
    AclGrant, ClusterConfig, ComponentToggle, IngressShard, Quota, Region, Role, Topic,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What a difference in a field means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// CPU/memory profile identity
    Flavor,
    /// Node (or partition) count
    NodeCount,
    /// Ratio or quota scalar
    Ratio,
    /// Map of component toggles
    Components,
    /// Unordered list of codes or tags
    Codes,
    /// Free-form settings (versions, flags, port mappings)
    Settings,
    /// Set of directory groups granted access
    AccessGroups,
}

/// A field value normalized for comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Count(u32),
    Ratio(f64),
    Set(BTreeSet<String>),
    Map(BTreeMap<String, String>),
    Components(BTreeMap<String, ComponentToggle>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Count(n) => write!(f, "{n}"),
            Self::Ratio(r) => write!(f, "{r}"),
            Self::Set(items) => {
                let items: Vec<&str> = items.iter().map(String::as_str).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Self::Map(map) => {
                let pairs: Vec<String> = map.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
            Self::Components(map) => {
                let names: Vec<&str> = map
                    .iter()
                    .filter(|(_, t)| t.installed)
                    .map(|(n, _)| n.as_str())
                    .collect();
                write!(f, "components[{}]", names.join(", "))
            }
        }
    }
}

/// One declared field
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    /// `None` when the entity does not declare the field
    pub value: Option<FieldValue>,
}

impl Field {
    fn new(name: &'static str, kind: FieldKind, value: Option<FieldValue>) -> Self {
        Self { name, kind, value }
    }
}

/// Prefix used for per-component field paths
pub const COMPONENT_PREFIX: &str = "components.";

/// Field listing and write-back for one entity shape
pub trait Fields {
    /// Declared comparable fields
    fn fields(&self) -> Vec<Field>;

    /// Copy one field (or one `components.<name>` entry) from `from`
    ///
    /// Returns `false` for unknown field names.
    fn copy_field(&mut self, field: &str, from: &Self) -> bool;

    /// Adjust a count field by a signed delta
    fn scale_field(&mut self, _field: &str, _delta: i64) -> bool {
        false
    }

    /// Add or remove one member of a set field
    fn set_member(&mut self, _field: &str, _member: &str, _present: bool) -> bool {
        false
    }
}

fn text(s: &str) -> Option<FieldValue> {
    Some(FieldValue::Text(s.to_string()))
}

fn codes(list: &[String]) -> Option<FieldValue> {
    Some(FieldValue::Set(list.iter().cloned().collect()))
}

fn string_map<V: ToString>(map: &BTreeMap<String, V>) -> Option<FieldValue> {
    Some(FieldValue::Map(
        map.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
    ))
}

fn components(map: &BTreeMap<String, ComponentToggle>) -> Option<FieldValue> {
    Some(FieldValue::Components(map.clone()))
}

fn copy_component(
    target: &mut BTreeMap<String, ComponentToggle>,
    from: &BTreeMap<String, ComponentToggle>,
    name: &str,
) {
    match from.get(name) {
        Some(toggle) => {
            target.insert(name.to_string(), toggle.clone());
        }
        None => {
            target.remove(name);
        }
    }
}

fn scale(value: &mut u32, delta: i64) {
    let next = i64::from(*value) + delta;
    *value = next.clamp(0, i64::from(u32::MAX)) as u32;
}

impl Fields for ClusterConfig {
    fn fields(&self) -> Vec<Field> {
        let s = &self.settings;
        vec![
            Field::new(
                "version",
                FieldKind::Settings,
                s.version.as_deref().and_then(text),
            ),
            Field::new(
                "maintenance_window",
                FieldKind::Settings,
                s.maintenance_window.as_deref().and_then(text),
            ),
            Field::new("cpu_ratio", FieldKind::Ratio, s.cpu_ratio.map(FieldValue::Ratio)),
            Field::new(
                "memory_ratio",
                FieldKind::Ratio,
                s.memory_ratio.map(FieldValue::Ratio),
            ),
            Field::new("components", FieldKind::Components, components(&self.components)),
        ]
    }

    fn copy_field(&mut self, field: &str, from: &Self) -> bool {
        if let Some(name) = field.strip_prefix(COMPONENT_PREFIX) {
            copy_component(&mut self.components, &from.components, name);
            return true;
        }
        match field {
            "version" => self.settings.version = from.settings.version.clone(),
            "maintenance_window" => {
                self.settings.maintenance_window = from.settings.maintenance_window.clone();
            }
            "cpu_ratio" => self.settings.cpu_ratio = from.settings.cpu_ratio,
            "memory_ratio" => self.settings.memory_ratio = from.settings.memory_ratio,
            "components" => self.components = from.components.clone(),
            _ => return false,
        }
        true
    }
}

impl Fields for Role {
    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("flavor", FieldKind::Flavor, text(&self.flavor)),
            Field::new("count", FieldKind::NodeCount, Some(FieldValue::Count(self.count))),
            Field::new(
                "access_groups",
                FieldKind::AccessGroups,
                Some(FieldValue::Set(self.access_groups.clone())),
            ),
        ]
    }

    fn copy_field(&mut self, field: &str, from: &Self) -> bool {
        match field {
            "flavor" => self.flavor = from.flavor.clone(),
            "count" => self.count = from.count,
            "access_groups" => self.access_groups = from.access_groups.clone(),
            _ => return false,
        }
        true
    }

    fn scale_field(&mut self, field: &str, delta: i64) -> bool {
        if field != "count" {
            return false;
        }
        scale(&mut self.count, delta);
        true
    }

    fn set_member(&mut self, field: &str, member: &str, present: bool) -> bool {
        if field != "access_groups" {
            return false;
        }
        if present {
            self.access_groups.insert(member.to_string());
        } else {
            self.access_groups.remove(member);
        }
        true
    }
}

impl Fields for Region {
    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("flavor", FieldKind::Flavor, text(&self.flavor)),
            Field::new("size", FieldKind::NodeCount, Some(FieldValue::Count(self.size))),
            Field::new("zones", FieldKind::Codes, codes(&self.zones)),
            Field::new("labels", FieldKind::Settings, string_map(&self.labels)),
            Field::new("components", FieldKind::Components, components(&self.components)),
        ]
    }

    fn copy_field(&mut self, field: &str, from: &Self) -> bool {
        if let Some(name) = field.strip_prefix(COMPONENT_PREFIX) {
            copy_component(&mut self.components, &from.components, name);
            return true;
        }
        match field {
            "flavor" => self.flavor = from.flavor.clone(),
            "size" => self.size = from.size,
            "zones" => self.zones = from.zones.clone(),
            "labels" => self.labels = from.labels.clone(),
            "components" => self.components = from.components.clone(),
            _ => return false,
        }
        true
    }

    fn scale_field(&mut self, field: &str, delta: i64) -> bool {
        if field != "size" {
            return false;
        }
        scale(&mut self.size, delta);
        true
    }
}

impl Fields for IngressShard {
    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("flavor", FieldKind::Flavor, text(&self.flavor)),
            Field::new("size", FieldKind::NodeCount, Some(FieldValue::Count(self.size))),
            Field::new("allowed_codes", FieldKind::Codes, codes(&self.allowed_codes)),
            Field::new("ports", FieldKind::Settings, string_map(&self.ports)),
            Field::new("features", FieldKind::Settings, string_map(&self.features)),
        ]
    }

    fn copy_field(&mut self, field: &str, from: &Self) -> bool {
        match field {
            "flavor" => self.flavor = from.flavor.clone(),
            "size" => self.size = from.size,
            "allowed_codes" => self.allowed_codes = from.allowed_codes.clone(),
            "ports" => self.ports = from.ports.clone(),
            "features" => self.features = from.features.clone(),
            _ => return false,
        }
        true
    }

    fn scale_field(&mut self, field: &str, delta: i64) -> bool {
        if field != "size" {
            return false;
        }
        scale(&mut self.size, delta);
        true
    }
}

impl Fields for Topic {
    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new(
                "partitions",
                FieldKind::NodeCount,
                Some(FieldValue::Count(self.partitions)),
            ),
            Field::new("config", FieldKind::Settings, string_map(&self.config)),
        ]
    }

    fn copy_field(&mut self, field: &str, from: &Self) -> bool {
        match field {
            "partitions" => self.partitions = from.partitions,
            "config" => self.config = from.config.clone(),
            _ => return false,
        }
        true
    }

    fn scale_field(&mut self, field: &str, delta: i64) -> bool {
        if field != "partitions" {
            return false;
        }
        scale(&mut self.partitions, delta);
        true
    }
}

// An ACL grant is all key; nothing to compare beyond identity.
impl Fields for AclGrant {
    fn fields(&self) -> Vec<Field> {
        Vec::new()
    }

    fn copy_field(&mut self, _field: &str, _from: &Self) -> bool {
        false
    }
}

impl Fields for Quota {
    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new(
                "produce_rate",
                FieldKind::Ratio,
                self.produce_rate.map(FieldValue::Ratio),
            ),
            Field::new(
                "consume_rate",
                FieldKind::Ratio,
                self.consume_rate.map(FieldValue::Ratio),
            ),
        ]
    }

    fn copy_field(&mut self, field: &str, from: &Self) -> bool {
        match field {
            "produce_rate" => self.produce_rate = from.produce_rate,
            "consume_rate" => self.consume_rate = from.consume_rate,
            _ => return false,
        }
        true
    }
}
