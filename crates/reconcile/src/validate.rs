//! Checks that run before any action is planned
//!
//! Problems are collected rather than returned on the first hit so a caller
//! sees every issue of a configuration at once.

use crate::classify::{ChangeKind, ChangeRecord, Direction};
use crate::config::PlannerConfig;
use crate::error::{Error, Result};
use crate::model::{ClusterConfig, EntityKind};
use std::collections::BTreeSet;

fn duplicates(kind: EntityKind, keys: impl Iterator<Item = String>, issues: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for key in keys {
        if !seen.insert(key.clone()) {
            issues.push(format!("duplicate {kind} key '{key}'"));
        }
    }
}

fn blank_names<'a>(kind: EntityKind, names: impl Iterator<Item = &'a str>, issues: &mut Vec<String>) {
    if names.into_iter().any(str::is_empty) {
        issues.push(format!("{kind} entry without a name"));
    }
}

/// Validate a desired tree on its own
///
/// Rejects duplicate keys and components installed at region scope without
/// the cluster-scope toggle.
pub fn validate_desired(desired: &ClusterConfig) -> Result<()> {
    let mut issues = Vec::new();

    blank_names(
        EntityKind::Role,
        desired.roles.iter().map(|r| r.name.as_str()),
        &mut issues,
    );
    duplicates(
        EntityKind::Role,
        desired.roles.iter().map(|r| r.name.clone()),
        &mut issues,
    );

    duplicates(
        EntityKind::Region,
        desired.regions.iter().filter_map(|r| r.name.clone()),
        &mut issues,
    );
    duplicates(
        EntityKind::Region,
        desired
            .regions
            .iter()
            .filter_map(|r| r.provisional.map(|p| format!("~{p}"))),
        &mut issues,
    );
    duplicates(
        EntityKind::IngressShard,
        desired.ingress.iter().filter_map(|s| s.name.clone()),
        &mut issues,
    );
    duplicates(
        EntityKind::IngressShard,
        desired
            .ingress
            .iter()
            .filter_map(|s| s.provisional.map(|p| format!("~{p}"))),
        &mut issues,
    );

    if let Some(broker) = &desired.broker {
        blank_names(
            EntityKind::Topic,
            broker.topics.iter().map(|t| t.name.as_str()),
            &mut issues,
        );
        duplicates(
            EntityKind::Topic,
            broker.topics.iter().map(|t| t.name.clone()),
            &mut issues,
        );
        duplicates(
            EntityKind::Acl,
            broker.acls.iter().map(|a| a.key()),
            &mut issues,
        );
        duplicates(
            EntityKind::Quota,
            broker.quotas.iter().map(|q| q.principal.clone()),
            &mut issues,
        );
    }

    for (position, region) in desired.regions.iter().enumerate() {
        let label = region
            .name
            .clone()
            .unwrap_or_else(|| format!("#{position}"));
        for (component, toggle) in &region.components {
            if toggle.installed && !desired.component_installed(component) {
                issues.push(format!(
                    "component '{component}' enabled on region {label} but not at cluster scope"
                ));
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { issues })
    }
}

/// Validate a changeset against the planner policy
///
/// Removals of created entities are only allowed when the policy says so,
/// and topic partitions can only grow.
pub fn validate_changes(changes: &[ChangeRecord], config: &PlannerConfig) -> Result<()> {
    let mut issues = Vec::new();

    for change in changes {
        if change.kind == ChangeKind::Remove && !config.allow_removals {
            issues.push(format!(
                "{} is not in the desired configuration and removals are disabled",
                change.entity
            ));
        }
        if change.kind == ChangeKind::NodeCount
            && change.direction == Direction::Remove
            && change.entity.kind == EntityKind::Topic
        {
            issues.push(format!(
                "{} cannot shrink by {} partition(s)",
                change.entity, change.magnitude
            ));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { issues })
    }
}
