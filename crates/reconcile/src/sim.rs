//! In-memory backend
//!
//! Holds one cluster tree and applies actions to it the way a real backend
//! would: creates assign names and only set creation fields, component
//! toggles enforce the cluster/region dependency, and scripted failures can
//! be injected per action kind.

use crate::compare::ToggleTransition;
use crate::differ::Keyed;
use crate::error::{BackendError, ErrorCategory};
use crate::executor::{ApplyOutcome, Backend, BackendResult};
use crate::fields::FieldValue;
use crate::merge::creation_copy;
use crate::model::{
    AclGrant, BrokerConfig, ClusterConfig, ComponentOptions, ComponentToggle, EntityKind,
    EntityRef, IngressShard, Quota, Region, Role, Topic,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct ScriptedFailure {
    remaining: u32,
    category: ErrorCategory,
}

/// Backend that keeps its state in memory
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    state: ClusterConfig,
    next_id: u32,
    failures: BTreeMap<String, ScriptedFailure>,
    observe_failure: Option<ErrorCategory>,
    calls: Vec<String>,
    cordoned: BTreeSet<String>,
}

fn not_found(target: &EntityRef) -> BackendError {
    BackendError::not_found(format!("{target} does not exist"))
}

fn find<'a, T: Keyed>(items: &'a mut [T], target: &EntityRef) -> Result<&'a mut T, BackendError> {
    let name = target.key.name().ok_or_else(|| not_found(target))?;
    items
        .iter_mut()
        .find(|e| e.name().as_deref() == Some(name))
        .ok_or_else(|| not_found(target))
}

fn changed(applied: bool) -> ApplyOutcome {
    if applied {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Unchanged
    }
}

fn set_codes(
    codes: &mut Vec<String>,
    add: &BTreeSet<String>,
    remove: &BTreeSet<String>,
) -> ApplyOutcome {
    let before: BTreeSet<String> = codes.iter().cloned().collect();
    let mut after = before.clone();
    after.extend(add.iter().cloned());
    after.retain(|c| !remove.contains(c));
    *codes = after.iter().cloned().collect();
    changed(before != after)
}

fn text(value: Option<&FieldValue>) -> Result<Option<String>, BackendError> {
    match value {
        None => Ok(None),
        Some(FieldValue::Text(s)) => Ok(Some(s.clone())),
        Some(other) => Err(BackendError::rejected(format!("expected text, got {other}"))),
    }
}

fn string_map(value: Option<&FieldValue>) -> Result<BTreeMap<String, String>, BackendError> {
    match value {
        None => Ok(BTreeMap::new()),
        Some(FieldValue::Map(map)) => Ok(map.clone()),
        Some(other) => Err(BackendError::rejected(format!("expected map, got {other}"))),
    }
}

fn parsed_map<V: std::str::FromStr>(
    value: Option<&FieldValue>,
) -> Result<BTreeMap<String, V>, BackendError> {
    string_map(value)?
        .into_iter()
        .map(|(k, v)| {
            v.parse::<V>()
                .map(|parsed| (k.clone(), parsed))
                .map_err(|_| BackendError::rejected(format!("invalid value '{v}' for '{k}'")))
        })
        .collect()
}

fn unknown_field(target: &EntityRef, field: &str) -> BackendError {
    BackendError::rejected(format!("{target} has no field '{field}'"))
}

impl SimulatedBackend {
    pub fn new(state: ClusterConfig) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Current state of the simulated instance
    pub fn state(&self) -> &ClusterConfig {
        &self.state
    }

    pub fn into_state(self) -> ClusterConfig {
        self.state
    }

    /// Calls made so far, as `<action> <target>`
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    /// Entities created with fewer nodes than declared and not yet uncordoned
    pub fn cordoned(&self) -> &BTreeSet<String> {
        &self.cordoned
    }

    /// Fail the next `times` calls of `action` (an `ActionKind` name)
    pub fn fail(&mut self, action: &str, times: u32, category: ErrorCategory) {
        self.failures.insert(
            action.to_string(),
            ScriptedFailure {
                remaining: times,
                category,
            },
        );
    }

    /// Fail every call of `action`
    pub fn fail_always(&mut self, action: &str, category: ErrorCategory) {
        self.fail(action, u32::MAX, category);
    }

    /// Make the next `observe` fail
    pub fn fail_observe(&mut self, category: ErrorCategory) {
        self.observe_failure = Some(category);
    }

    fn begin(&mut self, action: &str, target: &EntityRef) -> Result<(), BackendError> {
        self.calls.push(format!("{action} {target}"));
        if let Some(failure) = self.failures.get_mut(action)
            && failure.remaining > 0
        {
            failure.remaining -= 1;
            log::debug!("injected {} failure for {action} {target}", failure.category);
            return Err(BackendError::new(
                failure.category,
                format!("injected failure for {action}"),
            ));
        }
        Ok(())
    }

    fn next_name(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn broker(&mut self) -> &mut BrokerConfig {
        self.state.broker.get_or_insert_with(BrokerConfig::default)
    }

    fn components_mut(
        &mut self,
        target: &EntityRef,
    ) -> Result<&mut BTreeMap<String, ComponentToggle>, BackendError> {
        match target.kind {
            EntityKind::Cluster => Ok(&mut self.state.components),
            EntityKind::Region => Ok(&mut find(&mut self.state.regions, target)?.components),
            _ => Err(BackendError::rejected(format!(
                "{target} has no components"
            ))),
        }
    }

    fn size_mut(&mut self, target: &EntityRef) -> Result<&mut u32, BackendError> {
        match target.kind {
            EntityKind::Role => Ok(&mut find(&mut self.state.roles, target)?.count),
            EntityKind::Region => Ok(&mut find(&mut self.state.regions, target)?.size),
            EntityKind::IngressShard => Ok(&mut find(&mut self.state.ingress, target)?.size),
            _ => Err(BackendError::rejected(format!("{target} has no nodes"))),
        }
    }

    fn check_component_dependency(
        &self,
        target: &EntityRef,
        component: &str,
        transition: ToggleTransition,
    ) -> Result<(), BackendError> {
        match (target.kind, transition) {
            (EntityKind::Cluster, ToggleTransition::Disable) => {
                if let Some(region) = self
                    .state
                    .regions
                    .iter()
                    .find(|r| r.component_installed(component))
                {
                    return Err(BackendError::new(
                        ErrorCategory::Conflict,
                        format!(
                            "'{component}' still enabled on region {}",
                            region.name.as_deref().unwrap_or("?")
                        ),
                    ));
                }
            }
            (EntityKind::Region, ToggleTransition::Enable) => {
                if !self.state.component_installed(component) {
                    return Err(BackendError::rejected(format!(
                        "'{component}' is not enabled at cluster scope"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn create<T: Keyed>(
        items: &mut Vec<T>,
        entity: &T,
        name: String,
        initial_size: Option<u32>,
    ) -> Result<(), BackendError> {
        if items.iter().any(|e| e.name().as_deref() == Some(name.as_str())) {
            return Err(BackendError::new(
                ErrorCategory::Conflict,
                format!("{} {name} already exists", T::KIND),
            ));
        }
        let mut created = creation_copy(entity);
        created.assign_name(&name);
        if let (Some(size), Some(field)) = (initial_size, T::SIZE_FIELD) {
            created.scale_field(field, i64::from(size) - i64::from(entity_size(entity)));
        }
        items.push(created);
        Ok(())
    }
}

fn entity_size<T: Keyed>(entity: &T) -> u32 {
    entity.snapshot().size()
}

impl Backend for SimulatedBackend {
    fn observe(&mut self) -> Result<ClusterConfig, BackendError> {
        if let Some(category) = self.observe_failure.take() {
            return Err(BackendError::new(category, "injected observe failure"));
        }
        Ok(self.state.clone())
    }

    fn create_region(
        &mut self,
        target: &EntityRef,
        region: &Region,
        initial_size: u32,
    ) -> BackendResult {
        self.begin("create_region", target)?;
        let name = match &region.name {
            Some(name) => name.clone(),
            None => self.next_name("region"),
        };
        Self::create(&mut self.state.regions, region, name.clone(), Some(initial_size))?;
        if initial_size < region.size {
            self.cordoned.insert(name.clone());
        }
        Ok(ApplyOutcome::Created { name })
    }

    fn create_ingress_shard(
        &mut self,
        target: &EntityRef,
        shard: &IngressShard,
        initial_size: u32,
    ) -> BackendResult {
        self.begin("create_ingress_shard", target)?;
        let name = match &shard.name {
            Some(name) => name.clone(),
            None => self.next_name("ingress"),
        };
        Self::create(&mut self.state.ingress, shard, name.clone(), Some(initial_size))?;
        if initial_size < shard.size {
            self.cordoned.insert(name.clone());
        }
        Ok(ApplyOutcome::Created { name })
    }

    fn create_role(&mut self, target: &EntityRef, role: &Role, initial_size: u32) -> BackendResult {
        self.begin("create_role", target)?;
        let name = role.name.clone();
        Self::create(&mut self.state.roles, role, name.clone(), Some(initial_size))?;
        if initial_size < role.count {
            self.cordoned.insert(name.clone());
        }
        Ok(ApplyOutcome::Created { name })
    }

    fn create_topic(&mut self, target: &EntityRef, topic: &Topic) -> BackendResult {
        self.begin("create_topic", target)?;
        let topics = &mut self.broker().topics;
        Self::create(topics, topic, topic.name.clone(), None)?;
        Ok(ApplyOutcome::Created {
            name: topic.name.clone(),
        })
    }

    fn add_nodes(&mut self, target: &EntityRef, count: u32) -> BackendResult {
        self.begin("add_nodes", target)?;
        let size = self.size_mut(target)?;
        *size = size.saturating_add(count);
        Ok(changed(count > 0))
    }

    fn delete_nodes(&mut self, target: &EntityRef, count: u32) -> BackendResult {
        self.begin("delete_nodes", target)?;
        let size = self.size_mut(target)?;
        if count > *size {
            return Err(BackendError::rejected(format!(
                "cannot delete {count} of {size} node(s)"
            )));
        }
        *size -= count;
        Ok(changed(count > 0))
    }

    fn add_partitions(&mut self, target: &EntityRef, count: u32) -> BackendResult {
        self.begin("add_partitions", target)?;
        let topic = find(&mut self.broker().topics, target)?;
        topic.partitions = topic.partitions.saturating_add(count);
        Ok(changed(count > 0))
    }

    fn change_flavor(&mut self, target: &EntityRef, flavor: &str) -> BackendResult {
        self.begin("change_flavor", target)?;
        let current = match target.kind {
            EntityKind::Role => &mut find(&mut self.state.roles, target)?.flavor,
            EntityKind::Region => &mut find(&mut self.state.regions, target)?.flavor,
            EntityKind::IngressShard => &mut find(&mut self.state.ingress, target)?.flavor,
            _ => return Err(unknown_field(target, "flavor")),
        };
        if *current == flavor {
            return Ok(ApplyOutcome::Unchanged);
        }
        *current = flavor.to_string();
        Ok(ApplyOutcome::Applied)
    }

    fn set_ratio(&mut self, target: &EntityRef, field: &str, value: Option<f64>) -> BackendResult {
        self.begin("set_ratio", target)?;
        let slot = match (target.kind, field) {
            (EntityKind::Cluster, "cpu_ratio") => &mut self.state.settings.cpu_ratio,
            (EntityKind::Cluster, "memory_ratio") => &mut self.state.settings.memory_ratio,
            (EntityKind::Quota, "produce_rate" | "consume_rate") => {
                let name = target.key.name().ok_or_else(|| not_found(target))?;
                let quotas = &mut self.broker().quotas;
                let position = match quotas.iter().position(|q| q.principal == name) {
                    Some(position) => position,
                    None => {
                        quotas.push(Quota {
                            principal: name.to_string(),
                            ..Default::default()
                        });
                        quotas.len() - 1
                    }
                };
                let quota = &mut quotas[position];
                if field == "produce_rate" {
                    &mut quota.produce_rate
                } else {
                    &mut quota.consume_rate
                }
            }
            _ => return Err(unknown_field(target, field)),
        };
        let applied = *slot != value;
        *slot = value;
        Ok(changed(applied))
    }

    fn configure_component(
        &mut self,
        target: &EntityRef,
        component: &str,
        transition: ToggleTransition,
        options: Option<&ComponentOptions>,
    ) -> BackendResult {
        self.begin("configure_component", target)?;
        self.check_component_dependency(target, component, transition)?;
        let components = self.components_mut(target)?;
        match transition {
            ToggleTransition::Disable => Ok(changed(components.remove(component).is_some())),
            ToggleTransition::Enable | ToggleTransition::Reconfigure => {
                let toggle = ComponentToggle {
                    installed: true,
                    options: options.cloned(),
                };
                let previous = components.insert(component.to_string(), toggle.clone());
                Ok(changed(previous.as_ref() != Some(&toggle)))
            }
        }
    }

    fn update_codes(
        &mut self,
        target: &EntityRef,
        field: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> BackendResult {
        self.begin("update_codes", target)?;
        let codes = match (target.kind, field) {
            (EntityKind::Region, "zones") => &mut find(&mut self.state.regions, target)?.zones,
            (EntityKind::IngressShard, "allowed_codes") => {
                &mut find(&mut self.state.ingress, target)?.allowed_codes
            }
            _ => return Err(unknown_field(target, field)),
        };
        Ok(set_codes(codes, add, remove))
    }

    fn update_settings(
        &mut self,
        target: &EntityRef,
        field: &str,
        value: Option<&FieldValue>,
    ) -> BackendResult {
        self.begin("update_settings", target)?;
        let applied = match (target.kind, field) {
            (EntityKind::Cluster, "version") => {
                let value = text(value)?;
                let slot = &mut self.state.settings.version;
                let applied = *slot != value;
                *slot = value;
                applied
            }
            (EntityKind::Cluster, "maintenance_window") => {
                let value = text(value)?;
                let slot = &mut self.state.settings.maintenance_window;
                let applied = *slot != value;
                *slot = value;
                applied
            }
            (EntityKind::Region, "labels") => {
                let value = string_map(value)?;
                let region = find(&mut self.state.regions, target)?;
                let applied = region.labels != value;
                region.labels = value;
                applied
            }
            (EntityKind::IngressShard, "ports") => {
                let value: BTreeMap<String, u16> = parsed_map(value)?;
                let shard = find(&mut self.state.ingress, target)?;
                let applied = shard.ports != value;
                shard.ports = value;
                applied
            }
            (EntityKind::IngressShard, "features") => {
                let value: BTreeMap<String, bool> = parsed_map(value)?;
                let shard = find(&mut self.state.ingress, target)?;
                let applied = shard.features != value;
                shard.features = value;
                applied
            }
            (EntityKind::Topic, "config") => {
                let value = string_map(value)?;
                let topic = find(&mut self.broker().topics, target)?;
                let applied = topic.config != value;
                topic.config = value;
                applied
            }
            _ => return Err(unknown_field(target, field)),
        };
        Ok(changed(applied))
    }

    fn grant_access(&mut self, target: &EntityRef, group: &str) -> BackendResult {
        self.begin("grant_access", target)?;
        let role = find(&mut self.state.roles, target)?;
        Ok(changed(role.access_groups.insert(group.to_string())))
    }

    fn revoke_access(&mut self, target: &EntityRef, group: &str) -> BackendResult {
        self.begin("revoke_access", target)?;
        let role = find(&mut self.state.roles, target)?;
        Ok(changed(role.access_groups.remove(group)))
    }

    fn grant_acl(&mut self, target: &EntityRef, acl: &AclGrant) -> BackendResult {
        self.begin("grant_acl", target)?;
        let acls = &mut self.broker().acls;
        if acls.contains(acl) {
            return Ok(ApplyOutcome::Unchanged);
        }
        acls.push(acl.clone());
        Ok(ApplyOutcome::Applied)
    }

    fn revoke_acl(&mut self, target: &EntityRef, acl: &AclGrant) -> BackendResult {
        self.begin("revoke_acl", target)?;
        let acls = &mut self.broker().acls;
        let before = acls.len();
        acls.retain(|a| a != acl);
        Ok(changed(acls.len() != before))
    }

    fn uncordon(&mut self, target: &EntityRef) -> BackendResult {
        self.begin("uncordon", target)?;
        let name = target.key.name().ok_or_else(|| not_found(target))?;
        Ok(changed(self.cordoned.remove(name)))
    }

    fn remove_entity(&mut self, target: &EntityRef) -> BackendResult {
        self.begin("remove_entity", target)?;
        let name = target.key.name().ok_or_else(|| not_found(target))?;
        let removed = match target.kind {
            EntityKind::Role => remove_named(&mut self.state.roles, name),
            EntityKind::Region => remove_named(&mut self.state.regions, name),
            EntityKind::IngressShard => remove_named(&mut self.state.ingress, name),
            EntityKind::Topic => remove_named(&mut self.broker().topics, name),
            _ => return Err(BackendError::rejected(format!("{target} cannot be removed"))),
        };
        self.cordoned.remove(name);
        Ok(changed(removed))
    }
}

fn remove_named<T: Keyed>(items: &mut Vec<T>, name: &str) -> bool {
    let before = items.len();
    items.retain(|e| e.name().as_deref() != Some(name));
    items.len() != before
}
