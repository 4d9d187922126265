//! Plan display

use colored::{ColoredString, Colorize};
use reconcile::{Action, ExecutionPlan, Priority};

fn marker(action: &Action) -> ColoredString {
    match action.priority {
        Priority::Revoke | Priority::Remove => "-".red(),
        Priority::Create | Priority::Grant => "+".green(),
        Priority::Activate => "▲".cyan(),
        _ => "~".yellow(),
    }
}

/// Short tag for actions that are not retried on transient failure
fn fragility(action: &Action) -> Option<&'static str> {
    if !action.idempotent {
        Some(" [once]")
    } else if !action.retryable {
        Some(" [no retry]")
    } else {
        None
    }
}

/// Display the ordered plan
pub fn display_plan(plan: &ExecutionPlan) {
    if plan.is_empty() {
        println!();
        println!("  {} Nothing to do", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");
    for (index, action) in plan.iter().enumerate() {
        println!(
            "│ {:>3}. {} {}{}",
            index + 1,
            marker(action),
            action,
            fragility(action).unwrap_or_default().red()
        );
    }
    println!("│");
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} actions ({} not retried on transient failure)",
        plan.len().to_string().bold(),
        plan.fragile_count().to_string().yellow()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{ActionKind, EntityKind, EntityRef};

    #[test]
    fn test_fragility_tags() {
        let target = EntityRef::named(EntityKind::Region, "r1");
        let add = Action::new(target.clone(), ActionKind::AddNodes { count: 2 });
        let flavor = Action::new(
            target.clone(),
            ActionKind::ChangeFlavor {
                flavor: "F2".into(),
            },
        );
        let remove = Action::new(target, ActionKind::RemoveEntity);

        assert_eq!(fragility(&add), Some(" [once]"));
        assert_eq!(fragility(&flavor), None);
        assert_eq!(fragility(&remove), Some(" [no retry]"));
    }
}
