//! Change display

use colored::{ColoredString, Colorize};
use reconcile::{ChangePayload, ChangeRecord, ConfigDiff, Direction, EntityKind};
use serde::Serialize;
use std::collections::BTreeMap;

/// Machine-readable form of a diff
#[derive(Serialize)]
pub struct DiffReport<'a> {
    pub changes: &'a [ChangeRecord],
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl<'a> DiffReport<'a> {
    pub fn new(diff: &'a ConfigDiff) -> Self {
        Self {
            changes: &diff.changes,
            added: diff.added.iter().map(ToString::to_string).collect(),
            removed: diff.removed.iter().map(ToString::to_string).collect(),
        }
    }
}

fn symbol(direction: Direction) -> ColoredString {
    match direction {
        Direction::Add => "+".green(),
        Direction::Remove => "-".red(),
        Direction::Modify => "~".yellow(),
    }
}

fn kind_title(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Cluster => "Cluster",
        EntityKind::Role => "Control-plane roles",
        EntityKind::Region => "Regions",
        EntityKind::IngressShard => "Ingress shards",
        EntityKind::Topic => "Broker topics",
        EntityKind::Acl => "Broker ACLs",
        EntityKind::Quota => "Broker quotas",
    }
}

/// What changed, without the entity
pub fn describe(change: &ChangeRecord) -> String {
    match &change.payload {
        ChangePayload::Entity(snapshot) => match change.direction {
            Direction::Remove => "(will remove)".to_string(),
            _ => format!("(new) size {}", snapshot.size()),
        },
        ChangePayload::Flavor { from, to } => {
            format!("flavor {} → {to}", from.as_deref().unwrap_or("(none)"))
        }
        ChangePayload::NodeCount { field, from, to } => format!("{field} {from} → {to}"),
        ChangePayload::Ratio { field, value } => match value {
            Some(v) => format!("{field} = {v}"),
            None => format!("{field} cleared"),
        },
        ChangePayload::Component {
            name, transition, ..
        } => format!("component {name}: {transition}"),
        ChangePayload::Codes {
            field,
            added,
            removed,
        } => {
            let mut parts = Vec::new();
            if !added.is_empty() {
                parts.push(format!(
                    "+{}",
                    added.iter().cloned().collect::<Vec<_>>().join(",")
                ));
            }
            if !removed.is_empty() {
                parts.push(format!(
                    "-{}",
                    removed.iter().cloned().collect::<Vec<_>>().join(",")
                ));
            }
            format!("{field} {}", parts.join(" "))
        }
        ChangePayload::Settings { field, value } => match value {
            Some(v) => format!("{field} = {v}"),
            None => format!("{field} unset"),
        },
        ChangePayload::Grant { group } => format!("access group {group}"),
    }
}

/// Display classified changes grouped by entity kind
pub fn display_diff(diff: &ConfigDiff) {
    if diff.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    let mut by_kind: BTreeMap<EntityKind, Vec<&ChangeRecord>> = BTreeMap::new();
    for change in &diff.changes {
        by_kind.entry(change.entity.kind).or_default().push(change);
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Configuration Diff".bold()
    );
    println!("│");

    for (kind, changes) in &by_kind {
        println!("│ {}", kind_title(*kind).bold());
        for change in changes {
            println!(
                "│   {} {:<24} {:<16} {}",
                symbol(change.direction),
                change.entity.key.to_string(),
                change.kind.to_string(),
                describe(change).dimmed()
            );
        }
        println!("│");
    }

    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} changes ({} new, {} removed entities)",
        diff.changes.len().to_string().bold(),
        diff.added.len().to_string().green(),
        diff.removed.len().to_string().red()
    );
    println!("└─────────────────────────────────────────────────────┘");
}
