//! Action planner - turns change records into an ordered execution plan

use crate::classify::{ChangeKind, ChangePayload, ChangeRecord, Direction};
use crate::compare::ToggleTransition;
use crate::config::PlannerConfig;
use crate::differ::observed_key;
use crate::error::{Error, Result};
use crate::fields::FieldValue;
use crate::model::{
    AclGrant, ClusterConfig, ComponentOptions, EntityKind, EntityRef, EntitySnapshot,
    IngressShard, Region, Role, Topic,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Priority rank of an action; plans run in ascending order
///
/// The middle of the table is fixed: flavor changes run before node count
/// changes, which run before ratios, component toggles and finally codes
/// and settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Revoke,
    Remove,
    Create,
    Flavor,
    NodeCount,
    RatioConfig,
    ComponentToggle,
    Settings,
    Grant,
    Activate,
}

/// Operation and parameters of one action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a region with at most one batch of nodes; only the creation
    /// fields of `region` are applied
    CreateRegion {
        region: Region,
        initial_size: u32,
    },
    CreateIngressShard {
        shard: IngressShard,
        initial_size: u32,
    },
    CreateRole {
        role: Role,
        initial_size: u32,
    },
    CreateTopic {
        topic: Topic,
    },
    AddNodes {
        count: u32,
    },
    DeleteNodes {
        count: u32,
    },
    AddPartitions {
        count: u32,
    },
    ChangeFlavor {
        flavor: String,
    },
    /// Set a ratio or quota; `None` clears it
    SetRatio {
        field: String,
        value: Option<f64>,
    },
    ConfigureComponent {
        component: String,
        transition: ToggleTransition,
        options: Option<ComponentOptions>,
    },
    UpdateCodes {
        field: String,
        add: BTreeSet<String>,
        remove: BTreeSet<String>,
    },
    UpdateSettings {
        field: String,
        value: Option<FieldValue>,
    },
    GrantAccess {
        group: String,
    },
    RevokeAccess {
        group: String,
    },
    GrantAcl {
        acl: AclGrant,
    },
    RevokeAcl {
        acl: AclGrant,
    },
    /// Bring a freshly created entity into service
    Uncordon,
    RemoveEntity,
}

impl ActionKind {
    /// Machine name, as used for failure injection and logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRegion { .. } => "create_region",
            Self::CreateIngressShard { .. } => "create_ingress_shard",
            Self::CreateRole { .. } => "create_role",
            Self::CreateTopic { .. } => "create_topic",
            Self::AddNodes { .. } => "add_nodes",
            Self::DeleteNodes { .. } => "delete_nodes",
            Self::AddPartitions { .. } => "add_partitions",
            Self::ChangeFlavor { .. } => "change_flavor",
            Self::SetRatio { .. } => "set_ratio",
            Self::ConfigureComponent { .. } => "configure_component",
            Self::UpdateCodes { .. } => "update_codes",
            Self::UpdateSettings { .. } => "update_settings",
            Self::GrantAccess { .. } => "grant_access",
            Self::RevokeAccess { .. } => "revoke_access",
            Self::GrantAcl { .. } => "grant_acl",
            Self::RevokeAcl { .. } => "revoke_acl",
            Self::Uncordon => "uncordon",
            Self::RemoveEntity => "remove_entity",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::CreateRegion { .. } => "CreateRegion",
            Self::CreateIngressShard { .. } => "CreateIngressShard",
            Self::CreateRole { .. } => "CreateRole",
            Self::CreateTopic { .. } => "CreateTopic",
            Self::AddNodes { .. } => "AddNodes",
            Self::DeleteNodes { .. } => "DeleteNodes",
            Self::AddPartitions { .. } => "AddPartitions",
            Self::ChangeFlavor { .. } => "ChangeFlavor",
            Self::SetRatio { .. } => "SetRatio",
            Self::ConfigureComponent { .. } => "ConfigureComponent",
            Self::UpdateCodes { .. } => "UpdateCodes",
            Self::UpdateSettings { .. } => "UpdateSettings",
            Self::GrantAccess { .. } => "GrantAccess",
            Self::RevokeAccess { .. } => "RevokeAccess",
            Self::GrantAcl { .. } => "GrantAcl",
            Self::RevokeAcl { .. } => "RevokeAcl",
            Self::Uncordon => "Uncordon",
            Self::RemoveEntity => "RemoveEntity",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Self::CreateRegion { .. }
                | Self::CreateIngressShard { .. }
                | Self::CreateRole { .. }
                | Self::CreateTopic { .. }
        )
    }

    pub fn priority(&self) -> Priority {
        match self {
            Self::RevokeAccess { .. } | Self::RevokeAcl { .. } => Priority::Revoke,
            Self::RemoveEntity => Priority::Remove,
            Self::CreateRegion { .. }
            | Self::CreateIngressShard { .. }
            | Self::CreateRole { .. }
            | Self::CreateTopic { .. } => Priority::Create,
            Self::ChangeFlavor { .. } => Priority::Flavor,
            Self::AddNodes { .. } | Self::DeleteNodes { .. } | Self::AddPartitions { .. } => {
                Priority::NodeCount
            }
            Self::SetRatio { .. } => Priority::RatioConfig,
            Self::ConfigureComponent { .. } => Priority::ComponentToggle,
            Self::UpdateCodes { .. } | Self::UpdateSettings { .. } => Priority::Settings,
            Self::GrantAccess { .. } | Self::GrantAcl { .. } => Priority::Grant,
            Self::Uncordon => Priority::Activate,
        }
    }

    /// Whether repeating the call leaves the entity in the same state
    ///
    /// Creates and node deltas are not: a repeated call after a lost
    /// response would create or attach twice.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Self::CreateRegion { .. }
                | Self::CreateIngressShard { .. }
                | Self::CreateRole { .. }
                | Self::CreateTopic { .. }
                | Self::AddNodes { .. }
                | Self::DeleteNodes { .. }
                | Self::AddPartitions { .. }
        )
    }

    /// Whether a transient failure may be retried within the pass
    pub fn is_retryable(&self) -> bool {
        self.is_idempotent() && !matches!(self, Self::RemoveEntity)
    }
}

/// One imperative backend operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: EntityRef,
    pub priority: Priority,
    pub idempotent: bool,
    pub retryable: bool,
}

impl Action {
    pub fn new(target: EntityRef, kind: ActionKind) -> Self {
        Self {
            priority: kind.priority(),
            idempotent: kind.is_idempotent(),
            retryable: kind.is_retryable(),
            kind,
            target,
        }
    }

    /// Component scope order: enables broad to narrow, disables narrow to
    /// broad
    fn scope_rank(&self) -> u8 {
        let scope = self.target.kind as u8;
        match &self.kind {
            ActionKind::ConfigureComponent {
                transition: ToggleTransition::Disable,
                ..
            } => u8::MAX - scope,
            _ => scope,
        }
    }

    fn plan_order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.scope_rank().cmp(&other.scope_rank()))
            .then_with(|| self.target.cmp(&other.target))
    }
}

fn join(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.kind.label(), self.target)?;
        match &self.kind {
            ActionKind::CreateRegion { initial_size, .. }
            | ActionKind::CreateIngressShard { initial_size, .. }
            | ActionKind::CreateRole { initial_size, .. } => write!(f, ", {initial_size}")?,
            ActionKind::CreateTopic { topic } => write!(f, ", {}", topic.partitions)?,
            ActionKind::AddNodes { count } | ActionKind::AddPartitions { count } => {
                write!(f, ", +{count}")?;
            }
            ActionKind::DeleteNodes { count } => write!(f, ", -{count}")?,
            ActionKind::ChangeFlavor { flavor } => write!(f, ", {flavor}")?,
            ActionKind::SetRatio { field, value } => match value {
                Some(v) => write!(f, ", {field}={v}")?,
                None => write!(f, ", {field} cleared")?,
            },
            ActionKind::ConfigureComponent {
                component,
                transition,
                ..
            } => write!(f, ", {component}, {transition}")?,
            ActionKind::UpdateCodes { field, add, remove } => {
                write!(f, ", {field}")?;
                if !add.is_empty() {
                    write!(f, " +[{}]", join(add))?;
                }
                if !remove.is_empty() {
                    write!(f, " -[{}]", join(remove))?;
                }
            }
            ActionKind::UpdateSettings { field, .. } => write!(f, ", {field}")?,
            ActionKind::GrantAccess { group } | ActionKind::RevokeAccess { group } => {
                write!(f, ", {group}")?;
            }
            ActionKind::GrantAcl { .. }
            | ActionKind::RevokeAcl { .. }
            | ActionKind::Uncordon
            | ActionKind::RemoveEntity => {}
        }
        f.write_str(")")
    }
}

/// What the planner needs besides the changes themselves
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    /// Observed tree the changes were computed against
    pub observed: &'a ClusterConfig,
    pub config: &'a PlannerConfig,
}

/// An ordered list of actions for one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub actions: Vec<Action>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    /// Number of actions that will not be retried on transient failure
    pub fn fragile_count(&self) -> usize {
        self.actions.iter().filter(|a| !a.retryable).count()
    }
}

impl<'a> IntoIterator for &'a ExecutionPlan {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

fn unplannable(change: &ChangeRecord) -> Error {
    Error::Unplannable {
        entity: change.entity.to_string(),
        change: format!("{} {}", change.kind, change.direction),
    }
}

/// Split a node addition into one bounded call and one remainder call
fn node_batches(total: u32, batch: u32) -> (u32, Option<u32>) {
    if total > batch {
        (batch, Some(total - batch))
    } else {
        (total, None)
    }
}

fn actions_for(change: &ChangeRecord, batch: u32) -> Result<Vec<Action>> {
    let target = change.entity.clone();
    let one = |kind| Ok(vec![Action::new(target.clone(), kind)]);

    match (change.kind, &change.payload) {
        (ChangeKind::Create, ChangePayload::Entity(snapshot)) => {
            let (initial_size, rest) = node_batches(snapshot.size(), batch);
            let create = match snapshot {
                EntitySnapshot::Region(region) => ActionKind::CreateRegion {
                    region: region.clone(),
                    initial_size,
                },
                EntitySnapshot::IngressShard(shard) => ActionKind::CreateIngressShard {
                    shard: shard.clone(),
                    initial_size,
                },
                EntitySnapshot::Role(role) => ActionKind::CreateRole {
                    role: role.clone(),
                    initial_size,
                },
                EntitySnapshot::Topic(topic) => {
                    return one(ActionKind::CreateTopic {
                        topic: topic.clone(),
                    });
                }
                EntitySnapshot::Acl(_) | EntitySnapshot::Quota(_) => {
                    return Err(unplannable(change));
                }
            };
            let mut actions = vec![Action::new(target.clone(), create)];
            if let Some(count) = rest {
                actions.push(Action::new(target.clone(), ActionKind::AddNodes { count }));
                actions.push(Action::new(target, ActionKind::Uncordon));
            }
            Ok(actions)
        }
        (ChangeKind::Remove, _) => one(ActionKind::RemoveEntity),
        (ChangeKind::Flavor, ChangePayload::Flavor { to, .. }) => {
            one(ActionKind::ChangeFlavor { flavor: to.clone() })
        }
        (ChangeKind::NodeCount, ChangePayload::NodeCount { .. }) => {
            let count = change.magnitude;
            match (change.entity.kind, change.direction) {
                (EntityKind::Topic, Direction::Add) => one(ActionKind::AddPartitions { count }),
                (EntityKind::Topic, _) => Err(Error::validation(format!(
                    "{} cannot shrink by {count} partition(s)",
                    change.entity
                ))),
                (_, Direction::Add) => {
                    let (first, rest) = node_batches(count, batch);
                    let mut actions =
                        vec![Action::new(target.clone(), ActionKind::AddNodes { count: first })];
                    if let Some(count) = rest {
                        actions.push(Action::new(target, ActionKind::AddNodes { count }));
                    }
                    Ok(actions)
                }
                (_, _) => one(ActionKind::DeleteNodes { count }),
            }
        }
        (ChangeKind::RatioConfig, ChangePayload::Ratio { field, value }) => {
            one(ActionKind::SetRatio {
                field: field.clone(),
                value: *value,
            })
        }
        (
            ChangeKind::ComponentToggle,
            ChangePayload::Component {
                name,
                transition,
                options,
            },
        ) => one(ActionKind::ConfigureComponent {
            component: name.clone(),
            transition: *transition,
            options: options.clone(),
        }),
        (
            ChangeKind::Codes,
            ChangePayload::Codes {
                field,
                added,
                removed,
            },
        ) => one(ActionKind::UpdateCodes {
            field: field.clone(),
            add: added.clone(),
            remove: removed.clone(),
        }),
        (ChangeKind::Settings, ChangePayload::Settings { field, value }) => {
            one(ActionKind::UpdateSettings {
                field: field.clone(),
                value: value.clone(),
            })
        }
        (ChangeKind::AccessGrant, ChangePayload::Grant { group }) => {
            let group = group.clone();
            match change.direction {
                Direction::Remove => one(ActionKind::RevokeAccess { group }),
                _ => one(ActionKind::GrantAccess { group }),
            }
        }
        (ChangeKind::AccessGrant, ChangePayload::Entity(EntitySnapshot::Acl(acl))) => {
            let acl = acl.clone();
            match change.direction {
                Direction::Remove => one(ActionKind::RevokeAcl { acl }),
                _ => one(ActionKind::GrantAcl { acl }),
            }
        }
        _ => Err(unplannable(change)),
    }
}

fn component_change(change: &ChangeRecord) -> Option<(&str, ToggleTransition)> {
    match &change.payload {
        ChangePayload::Component {
            name, transition, ..
        } => Some((name.as_str(), *transition)),
        _ => None,
    }
}

/// Component toggles that would leave a region using a component the
/// cluster no longer (or never) provides
fn dependency_issues(changes: &[ChangeRecord], observed: &ClusterConfig) -> Vec<String> {
    let cluster_toggle = |component: &str, wanted: ToggleTransition| {
        changes.iter().any(|c| {
            c.entity.kind == EntityKind::Cluster
                && component_change(c).is_some_and(|(n, t)| n == component && t == wanted)
        })
    };
    let mut issues = Vec::new();

    for change in changes {
        let Some((component, transition)) = component_change(change) else {
            continue;
        };

        match (change.entity.kind, transition) {
            (EntityKind::Cluster, ToggleTransition::Disable) => {
                for (position, region) in observed.regions.iter().enumerate() {
                    if !region.component_installed(component) {
                        continue;
                    }
                    let region_ref = EntityRef::new(EntityKind::Region, observed_key(position, region));
                    let released = changes.iter().any(|c| {
                        c.entity == region_ref
                            && (c.kind == ChangeKind::Remove
                                || component_change(c).is_some_and(|(n, t)| {
                                    n == component && t == ToggleTransition::Disable
                                }))
                    });
                    if !released {
                        issues.push(format!(
                            "cannot disable '{component}' at cluster scope while {region_ref} still has it enabled"
                        ));
                    }
                }
                for enabling in changes.iter().filter(|c| {
                    c.entity.kind == EntityKind::Region
                        && component_change(c).is_some_and(|(n, t)| {
                            n == component && t == ToggleTransition::Enable
                        })
                }) {
                    issues.push(format!(
                        "cannot disable '{component}' at cluster scope while enabling it on {}",
                        enabling.entity
                    ));
                }
            }
            (EntityKind::Region, ToggleTransition::Enable) => {
                let provided = (observed.component_installed(component)
                    && !cluster_toggle(component, ToggleTransition::Disable))
                    || cluster_toggle(component, ToggleTransition::Enable);
                if !provided {
                    issues.push(format!(
                        "cannot enable '{component}' on {} without enabling it at cluster scope",
                        change.entity
                    ));
                }
            }
            _ => {}
        }
    }
    issues
}

/// Build an ordered plan from a changeset
///
/// Rejects the whole changeset when a component toggle violates the
/// cluster/region dependency; nothing is cascaded.
pub fn plan(changes: &[ChangeRecord], ctx: &PlanContext<'_>) -> Result<ExecutionPlan> {
    let issues = dependency_issues(changes, ctx.observed);
    if !issues.is_empty() {
        return Err(Error::Validation { issues });
    }

    let batch = ctx.config.max_batch_size.max(1);
    let mut actions = Vec::with_capacity(changes.len());
    for change in changes {
        actions.extend(actions_for(change, batch)?);
    }
    // Stable sort keeps emission order for equal keys (batched node calls)
    actions.sort_by(Action::plan_order);

    for action in &actions {
        log::debug!("planned {action}");
    }
    Ok(ExecutionPlan { actions })
}
