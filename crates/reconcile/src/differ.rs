//! Collection and whole-tree diffing
//!
//! Entities are matched across the two trees by key. Regions and ingress
//! shards only get a name once the backend creates them, so an unnamed
//! desired entity is matched by its provisional key, then by list position,
//! and otherwise counts as added.

use crate::classify::{self, ChangeKind, ChangePayload, ChangeRecord, Direction};
use crate::compare::compare;
use crate::error::Result;
use crate::fields::Fields;
use crate::model::{
    AclGrant, BrokerConfig, ClusterConfig, EntityKey, EntityKind, EntityRef, EntitySnapshot,
    IngressShard, Lifecycle, Quota, Region, Role, Topic,
};
use std::collections::{BTreeMap, BTreeSet};

/// An entity shape that lives in a keyed collection
pub trait Keyed: Fields + Clone {
    const KIND: EntityKind;

    /// Whether the name is assigned by the backend on creation
    const BACKEND_NAMED: bool = false;

    const LIFECYCLE: Lifecycle = Lifecycle::Created;

    /// Fields the creation call sets; everything else needs follow-up changes
    const CREATION_FIELDS: &'static [&'static str] = &[];

    /// Count field scaled by node (or partition) actions
    const SIZE_FIELD: Option<&'static str> = None;

    /// Stable name, if known
    fn name(&self) -> Option<String>;

    /// Client-assigned provisional key
    fn provisional(&self) -> Option<u32> {
        None
    }

    /// The entity with nothing declared
    fn blank() -> Self;

    fn snapshot(&self) -> EntitySnapshot;

    /// Record the entity's name (backend-assigned for regions and shards)
    fn assign_name(&mut self, _name: &str) {}
}

impl Keyed for Role {
    const KIND: EntityKind = EntityKind::Role;
    const CREATION_FIELDS: &'static [&'static str] = &["flavor", "count"];
    const SIZE_FIELD: Option<&'static str> = Some("count");

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn assign_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn blank() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::Role(self.clone())
    }
}

impl Keyed for Region {
    const KIND: EntityKind = EntityKind::Region;
    const BACKEND_NAMED: bool = true;
    const CREATION_FIELDS: &'static [&'static str] = &["flavor", "size", "zones"];
    const SIZE_FIELD: Option<&'static str> = Some("size");

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn provisional(&self) -> Option<u32> {
        self.provisional
    }

    fn blank() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::Region(self.clone())
    }

    fn assign_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }
}

impl Keyed for IngressShard {
    const KIND: EntityKind = EntityKind::IngressShard;
    const BACKEND_NAMED: bool = true;
    const CREATION_FIELDS: &'static [&'static str] = &["flavor", "size", "allowed_codes"];
    const SIZE_FIELD: Option<&'static str> = Some("size");

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn provisional(&self) -> Option<u32> {
        self.provisional
    }

    fn blank() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::IngressShard(self.clone())
    }

    fn assign_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }
}

impl Keyed for Topic {
    const KIND: EntityKind = EntityKind::Topic;
    const CREATION_FIELDS: &'static [&'static str] = &["partitions", "config"];
    const SIZE_FIELD: Option<&'static str> = Some("partitions");

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn assign_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn blank() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::Topic(self.clone())
    }
}

impl Keyed for AclGrant {
    const KIND: EntityKind = EntityKind::Acl;
    const LIFECYCLE: Lifecycle = Lifecycle::Grant;

    fn name(&self) -> Option<String> {
        Some(self.key())
    }

    fn blank() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::Acl(self.clone())
    }
}

impl Keyed for Quota {
    const KIND: EntityKind = EntityKind::Quota;
    const LIFECYCLE: Lifecycle = Lifecycle::Implicit;

    fn name(&self) -> Option<String> {
        Some(self.principal.clone())
    }

    fn assign_name(&mut self, name: &str) {
        self.principal = name.to_string();
    }

    fn blank() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::Quota(self.clone())
    }
}

/// Result of diffing one collection
#[derive(Debug, Clone, Default)]
pub struct CollectionDiff<T> {
    /// Desired entities with no observed counterpart, with their keys
    pub added: Vec<(EntityRef, T)>,
    /// Observed entities with no desired counterpart
    pub removed: Vec<(EntityRef, T)>,
    /// Change records for added, removed and matched entities
    pub modified: Vec<ChangeRecord>,
    /// Desired entities whose backend name vanished from the observed side
    pub drifted: Vec<EntityRef>,
    /// Desired list position of every matched or added entity
    pub bindings: BTreeMap<EntityRef, usize>,
}

impl<T> CollectionDiff<T> {
    /// Keys reported as both added and removed (always empty for a
    /// well-formed diff)
    pub fn overlapping_keys(&self) -> Vec<EntityRef> {
        let removed: BTreeSet<&EntityRef> = self.removed.iter().map(|(r, _)| r).collect();
        self.added
            .iter()
            .filter(|(r, _)| removed.contains(r))
            .map(|(r, _)| r.clone())
            .collect()
    }
}

pub(crate) fn observed_key<T: Keyed>(position: usize, entity: &T) -> EntityKey {
    match entity.name() {
        Some(name) => EntityKey::Named(name),
        None => EntityKey::Pending {
            position,
            provisional: entity.provisional(),
        },
    }
}

/// Match `desired` against `observed` and classify every difference
pub fn diff_collection<T: Keyed>(desired: &[T], observed: &[T]) -> Result<CollectionDiff<T>> {
    let mut diff = CollectionDiff {
        added: Vec::new(),
        removed: Vec::new(),
        modified: Vec::new(),
        drifted: Vec::new(),
        bindings: BTreeMap::new(),
    };

    let by_name: BTreeMap<String, usize> = observed
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.name().map(|n| (n, i)))
        .collect();
    let by_provisional: BTreeMap<u32, usize> = observed
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.provisional().map(|p| (p, i)))
        .collect();

    let mut matches: Vec<Option<usize>> = vec![None; desired.len()];
    let mut claimed: BTreeSet<usize> = BTreeSet::new();

    // Names first, so a positional match can never steal a named entity
    for (i, entity) in desired.iter().enumerate() {
        let Some(name) = entity.name() else { continue };
        if let Some(&j) = by_name.get(&name) {
            matches[i] = Some(j);
            claimed.insert(j);
        } else if T::BACKEND_NAMED {
            log::warn!("{} {name} is missing from the observed configuration", T::KIND);
            diff.drifted.push(EntityRef::named(T::KIND, name));
        }
    }

    for (i, entity) in desired.iter().enumerate() {
        if matches[i].is_some() || entity.name().is_some() {
            continue;
        }
        if let Some(p) = entity.provisional()
            && let Some(&j) = by_provisional.get(&p)
            && claimed.insert(j)
        {
            matches[i] = Some(j);
        }
    }

    // The k-th unkeyed desired entity pairs with the k-th observed entity
    // left over by name and provisional key. Created entities are appended
    // by the backend, so raw indices drift once a keyed neighbour exists.
    let unkeyed = desired
        .iter()
        .enumerate()
        .filter(|(i, e)| matches[*i].is_none() && e.name().is_none() && e.provisional().is_none())
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let unclaimed = observed
        .iter()
        .enumerate()
        .filter(|(j, e)| !claimed.contains(j) && e.provisional().is_none())
        .map(|(j, _)| j)
        .collect::<Vec<_>>();
    for (&i, &j) in unkeyed.iter().zip(&unclaimed) {
        log::debug!("{} at position {i} matched positionally to {j}", T::KIND);
        matches[i] = Some(j);
        claimed.insert(j);
    }

    for (i, entity) in desired.iter().enumerate() {
        let drifted = T::BACKEND_NAMED && matches[i].is_none() && entity.name().is_some();
        if drifted {
            continue;
        }
        match matches[i] {
            Some(j) => {
                let entity_ref = EntityRef::new(T::KIND, observed_key(j, &observed[j]));
                let deltas = compare(entity, &observed[j]);
                diff.modified
                    .extend(classify::classify_all(&entity_ref, &deltas)?);
                diff.bindings.insert(entity_ref, i);
            }
            None => {
                let key = match entity.name() {
                    Some(name) => EntityKey::Named(name),
                    None => EntityKey::Pending {
                        position: i,
                        provisional: entity.provisional(),
                    },
                };
                let entity_ref = EntityRef::new(T::KIND, key);
                diff.modified.extend(added_records(&entity_ref, entity)?);
                diff.bindings.insert(entity_ref.clone(), i);
                diff.added.push((entity_ref, entity.clone()));
            }
        }
    }

    for (j, entity) in observed.iter().enumerate() {
        if claimed.contains(&j) {
            continue;
        }
        let entity_ref = EntityRef::new(T::KIND, observed_key(j, entity));
        diff.modified.extend(removed_records(&entity_ref, entity));
        diff.removed.push((entity_ref, entity.clone()));
    }

    Ok(diff)
}

fn added_records<T: Keyed>(entity_ref: &EntityRef, entity: &T) -> Result<Vec<ChangeRecord>> {
    let snapshot = entity.snapshot();
    match T::LIFECYCLE {
        Lifecycle::Created => {
            let mut records = vec![ChangeRecord {
                entity: entity_ref.clone(),
                kind: ChangeKind::Create,
                direction: Direction::Add,
                magnitude: snapshot.size(),
                payload: ChangePayload::Entity(snapshot),
            }];
            records.extend(classify::synthetic_records(
                entity_ref,
                entity,
                &T::blank(),
                T::CREATION_FIELDS,
            )?);
            Ok(records)
        }
        Lifecycle::Grant => Ok(vec![ChangeRecord {
            entity: entity_ref.clone(),
            kind: ChangeKind::AccessGrant,
            direction: Direction::Add,
            magnitude: 1,
            payload: ChangePayload::Entity(snapshot),
        }]),
        Lifecycle::Implicit => {
            classify::synthetic_records(entity_ref, entity, &T::blank(), T::CREATION_FIELDS)
        }
    }
}

fn removed_records<T: Keyed>(entity_ref: &EntityRef, entity: &T) -> Vec<ChangeRecord> {
    let snapshot = entity.snapshot();
    match T::LIFECYCLE {
        Lifecycle::Created => vec![ChangeRecord {
            entity: entity_ref.clone(),
            kind: ChangeKind::Remove,
            direction: Direction::Remove,
            magnitude: snapshot.size(),
            payload: ChangePayload::Entity(snapshot),
        }],
        Lifecycle::Grant => vec![ChangeRecord {
            entity: entity_ref.clone(),
            kind: ChangeKind::AccessGrant,
            direction: Direction::Remove,
            magnitude: 1,
            payload: ChangePayload::Entity(snapshot),
        }],
        Lifecycle::Implicit => classify::clearing_records(entity_ref, entity),
    }
}

/// Every difference between a desired and an observed tree
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    /// Change records, in detection order
    pub changes: Vec<ChangeRecord>,
    pub added: Vec<EntityRef>,
    pub removed: Vec<EntityRef>,
    pub drifted: Vec<EntityRef>,
    /// Desired list position of every matched or added entity
    pub bindings: BTreeMap<EntityRef, usize>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn absorb<T>(&mut self, diff: CollectionDiff<T>) {
        self.changes.extend(diff.modified);
        self.added.extend(diff.added.into_iter().map(|(r, _)| r));
        self.removed.extend(diff.removed.into_iter().map(|(r, _)| r));
        self.drifted.extend(diff.drifted);
        self.bindings.extend(diff.bindings);
    }
}

/// Diff two whole configuration trees
///
/// A desired tree without a broker section leaves the observed broker alone.
pub fn diff_configs(desired: &ClusterConfig, observed: &ClusterConfig) -> Result<ConfigDiff> {
    let mut diff = ConfigDiff::default();

    let cluster = EntityRef::cluster();
    diff.changes
        .extend(classify::classify_all(&cluster, &compare(desired, observed))?);

    diff.absorb(diff_collection(&desired.roles, &observed.roles)?);
    diff.absorb(diff_collection(&desired.regions, &observed.regions)?);
    diff.absorb(diff_collection(&desired.ingress, &observed.ingress)?);

    if let Some(broker) = &desired.broker {
        let empty = BrokerConfig::default();
        let current = observed.broker.as_ref().unwrap_or(&empty);
        diff.absorb(diff_collection(&broker.topics, &current.topics)?);
        diff.absorb(diff_collection(&broker.acls, &current.acls)?);
        diff.absorb(diff_collection(&broker.quotas, &current.quotas)?);
    }

    log::debug!(
        "diff: {} change(s), {} added, {} removed, {} drifted",
        diff.changes.len(),
        diff.added.len(),
        diff.removed.len(),
        diff.drifted.len()
    );
    Ok(diff)
}
