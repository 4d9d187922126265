//! Backend capability set and action dispatch
//!
//! The engine never talks to a backend directly. A [`Backend`] exposes one
//! method per action kind; [`dispatch`] routes a planned [`Action`] to it.

use crate::compare::ToggleTransition;
use crate::error::BackendError;
use crate::fields::FieldValue;
use crate::model::{
    AclGrant, ClusterConfig, ComponentOptions, EntityRef, IngressShard, Region, Role, Topic,
};
use crate::planner::{Action, ActionKind};
use serde::Serialize;
use std::collections::BTreeSet;

/// What a backend call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The change was made
    Applied,
    /// The entity was already in the requested state
    Unchanged,
    /// A new entity exists under a backend-assigned name
    Created { name: String },
}

impl ApplyOutcome {
    /// Whether the call changed anything
    pub fn applied(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

pub type BackendResult = std::result::Result<ApplyOutcome, BackendError>;

/// Mutation operations of one resource instance
///
/// Every method receives the target entity reference. Create methods
/// receive a target whose key may still be pending and report the assigned
/// name through [`ApplyOutcome::Created`].
pub trait Backend {
    /// Read the current configuration
    fn observe(&mut self) -> std::result::Result<ClusterConfig, BackendError>;

    fn create_region(&mut self, target: &EntityRef, region: &Region, initial_size: u32)
    -> BackendResult;

    fn create_ingress_shard(
        &mut self,
        target: &EntityRef,
        shard: &IngressShard,
        initial_size: u32,
    ) -> BackendResult;

    fn create_role(&mut self, target: &EntityRef, role: &Role, initial_size: u32) -> BackendResult;

    fn create_topic(&mut self, target: &EntityRef, topic: &Topic) -> BackendResult;

    fn add_nodes(&mut self, target: &EntityRef, count: u32) -> BackendResult;

    fn delete_nodes(&mut self, target: &EntityRef, count: u32) -> BackendResult;

    fn add_partitions(&mut self, target: &EntityRef, count: u32) -> BackendResult;

    fn change_flavor(&mut self, target: &EntityRef, flavor: &str) -> BackendResult;

    fn set_ratio(&mut self, target: &EntityRef, field: &str, value: Option<f64>) -> BackendResult;

    fn configure_component(
        &mut self,
        target: &EntityRef,
        component: &str,
        transition: ToggleTransition,
        options: Option<&ComponentOptions>,
    ) -> BackendResult;

    fn update_codes(
        &mut self,
        target: &EntityRef,
        field: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> BackendResult;

    fn update_settings(
        &mut self,
        target: &EntityRef,
        field: &str,
        value: Option<&FieldValue>,
    ) -> BackendResult;

    fn grant_access(&mut self, target: &EntityRef, group: &str) -> BackendResult;

    fn revoke_access(&mut self, target: &EntityRef, group: &str) -> BackendResult;

    fn grant_acl(&mut self, target: &EntityRef, acl: &AclGrant) -> BackendResult;

    fn revoke_acl(&mut self, target: &EntityRef, acl: &AclGrant) -> BackendResult;

    fn uncordon(&mut self, target: &EntityRef) -> BackendResult;

    fn remove_entity(&mut self, target: &EntityRef) -> BackendResult;
}

/// Apply one action
pub fn dispatch<B: Backend + ?Sized>(backend: &mut B, action: &Action) -> BackendResult {
    let target = &action.target;
    match &action.kind {
        ActionKind::CreateRegion {
            region,
            initial_size,
        } => backend.create_region(target, region, *initial_size),
        ActionKind::CreateIngressShard {
            shard,
            initial_size,
        } => backend.create_ingress_shard(target, shard, *initial_size),
        ActionKind::CreateRole { role, initial_size } => {
            backend.create_role(target, role, *initial_size)
        }
        ActionKind::CreateTopic { topic } => backend.create_topic(target, topic),
        ActionKind::AddNodes { count } => backend.add_nodes(target, *count),
        ActionKind::DeleteNodes { count } => backend.delete_nodes(target, *count),
        ActionKind::AddPartitions { count } => backend.add_partitions(target, *count),
        ActionKind::ChangeFlavor { flavor } => backend.change_flavor(target, flavor),
        ActionKind::SetRatio { field, value } => backend.set_ratio(target, field, *value),
        ActionKind::ConfigureComponent {
            component,
            transition,
            options,
        } => backend.configure_component(target, component, *transition, options.as_ref()),
        ActionKind::UpdateCodes { field, add, remove } => {
            backend.update_codes(target, field, add, remove)
        }
        ActionKind::UpdateSettings { field, value } => {
            backend.update_settings(target, field, value.as_ref())
        }
        ActionKind::GrantAccess { group } => backend.grant_access(target, group),
        ActionKind::RevokeAccess { group } => backend.revoke_access(target, group),
        ActionKind::GrantAcl { acl } => backend.grant_acl(target, acl),
        ActionKind::RevokeAcl { acl } => backend.revoke_acl(target, acl),
        ActionKind::Uncordon => backend.uncordon(target),
        ActionKind::RemoveEntity => backend.remove_entity(target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::sim::SimulatedBackend;

    #[test]
    fn test_dispatch_routes_to_matching_method() {
        let mut config = ClusterConfig::default();
        config.regions.push(Region {
            name: Some("r1".into()),
            flavor: "F1".into(),
            size: 2,
            ..Default::default()
        });
        let mut backend = SimulatedBackend::new(config);

        let action = Action::new(
            EntityRef::named(EntityKind::Region, "r1"),
            ActionKind::ChangeFlavor {
                flavor: "F2".into(),
            },
        );
        assert_eq!(dispatch(&mut backend, &action).unwrap(), ApplyOutcome::Applied);
        assert_eq!(backend.calls(), ["change_flavor region/r1"]);
        assert_eq!(backend.state().regions[0].flavor, "F2");

        // Same flavor again is a no-op on the backend side
        assert_eq!(
            dispatch(&mut backend, &action).unwrap(),
            ApplyOutcome::Unchanged
        );
    }

    #[test]
    fn test_outcome_applied() {
        assert!(ApplyOutcome::Applied.applied());
        assert!(
            ApplyOutcome::Created {
                name: "region-1".into()
            }
            .applied()
        );
        assert!(!ApplyOutcome::Unchanged.applied());
    }
}
