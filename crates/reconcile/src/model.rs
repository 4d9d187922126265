//! Configuration trees and the entities they hold
//!
//! A [`ClusterConfig`] is used for both sides of a reconciliation pass: the
//! desired tree decoded from user input and the observed tree read back from
//! the backend. Both share one shape so they can be compared field by field.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The tree the user declared
pub type DesiredConfiguration = ClusterConfig;

/// The tree last read from the backend
pub type ObservedConfiguration = ClusterConfig;

/// A composite cluster resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster-wide scalar settings (version, ratios)
    pub settings: ClusterSettings,

    /// Cluster-scope component toggles, keyed by component name
    pub components: BTreeMap<String, ComponentToggle>,

    /// Control-plane roles, keyed by role name
    pub roles: Vec<Role>,

    /// Worker regions, in declaration order
    pub regions: Vec<Region>,

    /// Ingress shards, in declaration order
    pub ingress: Vec<IngressShard>,

    /// Message-broker topics, ACLs and quotas. `None` on the desired side
    /// means the broker is not managed by this configuration.
    pub broker: Option<BrokerConfig>,
}

impl ClusterConfig {
    /// Find a region by its backend-assigned name
    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| r.name.as_deref() == Some(name))
    }

    /// Find an ingress shard by its backend-assigned name
    pub fn ingress_shard(&self, name: &str) -> Option<&IngressShard> {
        self.ingress
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }

    /// Find a control-plane role by name
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Whether a component is installed at cluster scope
    pub fn component_installed(&self, component: &str) -> bool {
        self.components
            .get(component)
            .is_some_and(|toggle| toggle.installed)
    }
}

/// Cluster-wide scalar settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Platform version
    pub version: Option<String>,
    /// Preferred maintenance window, e.g. "sun:02:00-sun:04:00"
    pub maintenance_window: Option<String>,
    /// CPU overcommit ratio
    pub cpu_ratio: Option<f64>,
    /// Memory overcommit ratio
    pub memory_ratio: Option<f64>,
}

/// An installable component and its options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentToggle {
    pub installed: bool,
    pub options: Option<ComponentOptions>,
}

impl ComponentToggle {
    /// An installed component with no options
    pub fn enabled() -> Self {
        Self {
            installed: true,
            options: None,
        }
    }

    /// An installed component with options
    pub fn with_options(options: ComponentOptions) -> Self {
        Self {
            installed: true,
            options: Some(options),
        }
    }
}

/// Options for the known component types
///
/// The set is closed: each variant lists its own fields through
/// [`ComponentOptions::fields`], so comparing two option blocks never relies
/// on field naming conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentOptions {
    Monitoring {
        retention_days: u32,
        scrape_interval_secs: u32,
    },
    Logging {
        level: String,
        #[serde(default)]
        sink: Option<String>,
    },
    Autoscaler {
        min_nodes: u32,
        max_nodes: u32,
    },
    Gpu {
        driver_version: String,
    },
    /// Components without a dedicated shape
    Generic {
        #[serde(default)]
        values: BTreeMap<String, String>,
    },
}

impl ComponentOptions {
    /// Variant name as written in configuration files
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Monitoring { .. } => "monitoring",
            Self::Logging { .. } => "logging",
            Self::Autoscaler { .. } => "autoscaler",
            Self::Gpu { .. } => "gpu",
            Self::Generic { .. } => "generic",
        }
    }

    /// Declared option fields and their rendered values
    pub fn fields(&self) -> Vec<(String, String)> {
        match self {
            Self::Monitoring {
                retention_days,
                scrape_interval_secs,
            } => vec![
                ("retention_days".into(), retention_days.to_string()),
                ("scrape_interval_secs".into(), scrape_interval_secs.to_string()),
            ],
            Self::Logging { level, sink } => vec![
                ("level".into(), level.clone()),
                ("sink".into(), sink.clone().unwrap_or_default()),
            ],
            Self::Autoscaler {
                min_nodes,
                max_nodes,
            } => vec![
                ("min_nodes".into(), min_nodes.to_string()),
                ("max_nodes".into(), max_nodes.to_string()),
            ],
            Self::Gpu { driver_version } => {
                vec![("driver_version".into(), driver_version.clone())]
            }
            Self::Generic { values } => values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Names of option fields that differ between two blocks
    ///
    /// A change of variant reports `kind` plus every field of both sides.
    pub fn changed_fields(&self, other: &Self) -> Vec<String> {
        if self.kind() != other.kind() {
            let mut names: BTreeSet<String> = BTreeSet::from(["kind".to_string()]);
            names.extend(self.fields().into_iter().map(|(k, _)| k));
            names.extend(other.fields().into_iter().map(|(k, _)| k));
            return names.into_iter().collect();
        }
        let ours: BTreeMap<String, String> = self.fields().into_iter().collect();
        let theirs: BTreeMap<String, String> = other.fields().into_iter().collect();
        ours.keys()
            .chain(theirs.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|k| ours.get(*k) != theirs.get(*k))
            .cloned()
            .collect()
    }
}

/// A control-plane role (master, etcd, ...)
///
/// `flavor` and `count` are required when decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub flavor: String,
    pub count: u32,
    /// Directory groups granted access through this role
    #[serde(default)]
    pub access_groups: BTreeSet<String>,
}

/// A variable-size pool of worker nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Assigned by the backend once the region exists
    #[serde(default)]
    pub name: Option<String>,
    /// Client-assigned key carried until the backend name supersedes it
    #[serde(default)]
    pub provisional: Option<u32>,
    pub flavor: String,
    pub size: u32,
    /// Availability zone codes
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Region-scope component toggles
    #[serde(default)]
    pub components: BTreeMap<String, ComponentToggle>,
}

impl Region {
    /// Whether a component is installed at this region's scope
    pub fn component_installed(&self, component: &str) -> bool {
        self.components
            .get(component)
            .is_some_and(|toggle| toggle.installed)
    }
}

/// An ingress shard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressShard {
    /// Assigned by the backend once the shard exists
    #[serde(default)]
    pub name: Option<String>,
    /// Client-assigned key carried until the backend name supersedes it
    #[serde(default)]
    pub provisional: Option<u32>,
    pub flavor: String,
    pub size: u32,
    /// Source country codes allowed through this shard
    #[serde(default)]
    pub allowed_codes: Vec<String>,
    /// Named port mappings
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    /// Feature flags
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

/// Message-broker sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub topics: Vec<Topic>,
    pub acls: Vec<AclGrant>,
    pub quotas: Vec<Quota>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topic {
    pub name: String,
    pub partitions: u32,
    pub config: BTreeMap<String, String>,
}

/// One permission granted to a principal on a topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclGrant {
    pub principal: String,
    pub operation: String,
    pub topic: String,
}

impl AclGrant {
    /// Composite identity key
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.principal, self.operation, self.topic)
    }
}

/// Per-principal throughput quota
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quota {
    pub principal: String,
    /// Bytes per second
    pub produce_rate: Option<f64>,
    /// Bytes per second
    pub consume_rate: Option<f64>,
}

/// Kind of entity a change or action refers to
///
/// Declaration order is scope order: broader scopes sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Cluster,
    Role,
    Region,
    IngressShard,
    Topic,
    Acl,
    Quota,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Role => "role",
            Self::Region => "region",
            Self::IngressShard => "ingress_shard",
            Self::Topic => "topic",
            Self::Acl => "acl",
            Self::Quota => "quota",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity used to match an entity across the two trees
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKey {
    /// Stable name (user-declared, or assigned by the backend)
    Named(String),
    /// Not created yet; identified by desired-list position and the
    /// optional client-assigned provisional key
    Pending {
        position: usize,
        provisional: Option<u32>,
    },
}

impl EntityKey {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Pending { .. } => None,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Pending {
                provisional: Some(p),
                ..
            } => write!(f, "~{p}"),
            Self::Pending { position, .. } => write!(f, "#{position}"),
        }
    }
}

/// Reference to one entity instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub key: EntityKey,
}

/// Key used for the single cluster-scope entity
pub const CLUSTER_KEY: &str = "cluster";

impl EntityRef {
    pub fn new(kind: EntityKind, key: EntityKey) -> Self {
        Self { kind, key }
    }

    pub fn named(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::new(kind, EntityKey::named(name))
    }

    pub fn cluster() -> Self {
        Self::named(EntityKind::Cluster, CLUSTER_KEY)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// How an entity kind comes into and goes out of existence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Explicit create and remove calls
    Created,
    /// Exists as a grant; added and removed by grant/revoke
    Grant,
    /// No create call; exists once any of its fields is set
    Implicit,
}

/// Full copy of an entity carried by create/remove changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Role(Role),
    Region(Region),
    IngressShard(IngressShard),
    Topic(Topic),
    Acl(AclGrant),
    Quota(Quota),
}

impl EntitySnapshot {
    /// Node count (or partition count) the entity is declared with
    pub fn size(&self) -> u32 {
        match self {
            Self::Role(role) => role.count,
            Self::Region(region) => region.size,
            Self::IngressShard(shard) => shard.size,
            Self::Topic(topic) => topic.partitions,
            Self::Acl(_) | Self::Quota(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_options_changed_fields_same_kind() {
        let a = ComponentOptions::Monitoring {
            retention_days: 7,
            scrape_interval_secs: 30,
        };
        let b = ComponentOptions::Monitoring {
            retention_days: 14,
            scrape_interval_secs: 30,
        };
        assert_eq!(a.changed_fields(&b), vec!["retention_days".to_string()]);
        assert!(a.changed_fields(&a).is_empty());
    }

    #[test]
    fn test_component_options_changed_fields_variant_switch() {
        let a = ComponentOptions::Gpu {
            driver_version: "535".into(),
        };
        let b = ComponentOptions::Autoscaler {
            min_nodes: 1,
            max_nodes: 3,
        };
        let changed = a.changed_fields(&b);
        assert!(changed.contains(&"kind".to_string()));
        assert!(changed.contains(&"driver_version".to_string()));
        assert!(changed.contains(&"max_nodes".to_string()));
    }

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::named("r1").to_string(), "r1");
        let pending = EntityKey::Pending {
            position: 2,
            provisional: None,
        };
        assert_eq!(pending.to_string(), "#2");
        let provisional = EntityKey::Pending {
            position: 2,
            provisional: Some(7),
        };
        assert_eq!(provisional.to_string(), "~7");
        assert_eq!(
            EntityRef::named(EntityKind::Region, "r1").to_string(),
            "region/r1"
        );
    }

    #[test]
    fn test_entity_sizing_is_required() {
        let missing_size = serde_json::from_str::<Region>(r#"{"name":"r1","flavor":"F1"}"#);
        assert!(missing_size.is_err());
        let missing_flavor = serde_json::from_str::<IngressShard>(r#"{"size":2}"#);
        assert!(missing_flavor.is_err());
        let missing_count = serde_json::from_str::<Role>(r#"{"name":"master","flavor":"F4"}"#);
        assert!(missing_count.is_err());

        let region: Region = serde_json::from_str(r#"{"flavor":"F1","size":3}"#).unwrap();
        assert_eq!(region.name, None);
        assert!(region.zones.is_empty());
        let role: Role =
            serde_json::from_str(r#"{"name":"master","flavor":"F4","count":3}"#).unwrap();
        assert!(role.access_groups.is_empty());
    }

    #[test]
    fn test_component_options_from_toml_shape() {
        let json = r#"{"kind":"logging","level":"info"}"#;
        let parsed: ComponentOptions = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            ComponentOptions::Logging {
                level: "info".into(),
                sink: None
            }
        );
    }
}
