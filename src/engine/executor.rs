//! Simulated apply with terminal progress

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{
    Action, ActionStatus, BackendError, ClusterConfig, EngineConfig, ErrorCategory, NoSleep,
    PassReport, ProgressCallback, Reconciler, SimulatedBackend,
};
use std::sync::Arc;
use std::time::Duration;

use super::planner::display_plan;
use crate::ui;

/// Options for a simulated apply
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Skip confirmation prompts
    pub yes: bool,
    /// Don't sleep between retries
    pub no_wait: bool,
    /// Maximum passes
    pub passes: usize,
    /// Scripted failures as (action kind, times)
    pub failures: Vec<(String, u32)>,
    /// Category of injected failures
    pub category: ErrorCategory,
    /// Verbose output
    pub verbose: bool,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            yes: false,
            no_wait: false,
            passes: 1,
            failures: Vec::new(),
            category: ErrorCategory::Transient,
            verbose: false,
        }
    }
}

/// Summary of action outcomes across passes
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SimulateSummary {
    pub passes: usize,
    pub created: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub not_attempted: usize,
}

impl SimulateSummary {
    pub fn total_changes(&self) -> usize {
        self.created + self.applied
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.not_attempted == 0
    }

    fn record(&mut self, report: &PassReport) {
        self.passes += 1;
        for outcome in &report.outcomes {
            match outcome.status {
                ActionStatus::Applied => self.applied += 1,
                ActionStatus::Created { .. } => self.created += 1,
                ActionStatus::Unchanged => self.unchanged += 1,
                ActionStatus::Failed { .. } => self.failed += 1,
                ActionStatus::NotAttempted => self.not_attempted += 1,
            }
        }
    }
}

/// Parse a `KIND[:N]` failure argument
pub fn parse_failure(arg: &str) -> Result<(String, u32)> {
    let (kind, times) = match arg.split_once(':') {
        Some((kind, times)) => {
            let times = times
                .parse::<u32>()
                .with_context(|| format!("Invalid failure count in '{arg}'"))?;
            (kind, times)
        }
        None => (arg, 1),
    };
    let kind = kind.trim();
    if kind.is_empty() {
        anyhow::bail!("Missing action kind in '{arg}'");
    }
    Ok((kind.to_string(), times))
}

/// Progress bar over the actions of one pass
pub struct BarProgress {
    bar: Option<ProgressBar>,
    verbose: bool,
}

impl BarProgress {
    pub fn new(verbose: bool) -> Self {
        Self { bar: None, verbose }
    }
}

impl ProgressCallback for BarProgress {
    fn on_pass_start(&mut self, instance: &str, actions: usize) {
        let bar = ProgressBar::new(actions as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.set_message(instance.to_string());
        self.bar = Some(bar);
    }

    fn on_action_start(&mut self, _index: usize, action: &Action) {
        if let Some(bar) = &self.bar {
            bar.set_message(ui::truncate(&action.to_string(), 40));
        }
    }

    fn on_retry(&mut self, action: &Action, attempt: u32, error: &BackendError, delay: Duration) {
        let line = format!(
            "    {} {action} attempt {attempt} failed ({error}), retrying in {}",
            "⟳".yellow(),
            ui::format_duration(delay)
        );
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    fn on_action_complete(&mut self, _index: usize, action: &Action, status: &ActionStatus) {
        let symbol = match status {
            ActionStatus::Unchanged => "○".dimmed(),
            ActionStatus::Applied | ActionStatus::Created { .. } => "✓".green(),
            ActionStatus::Failed { .. } => "✗".red(),
            ActionStatus::NotAttempted => "⊘".dimmed(),
        };
        let line = if self.verbose || !status.is_success() {
            format!("    {symbol} {action} {}", status.to_string().dimmed())
        } else {
            format!("    {symbol} {action}")
        };
        match &self.bar {
            Some(bar) => {
                bar.println(line);
                bar.inc(1);
            }
            None => println!("{line}"),
        }
    }

    fn on_pass_complete(&mut self, _report: &PassReport) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Confirm with user
fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}

/// Plan, confirm, and apply against an in-memory backend
///
/// Returns the summary and the backend's final state.
pub fn simulate(
    desired: &ClusterConfig,
    observed: ClusterConfig,
    config: EngineConfig,
    opts: &SimulateOptions,
) -> Result<(SimulateSummary, ClusterConfig)> {
    let mut reconciler = Reconciler::new(config);
    if opts.no_wait {
        reconciler = reconciler.with_sleeper(Arc::new(NoSleep));
    }

    // 1. Show what will happen
    let preview = reconciler.preview(desired, &observed)?;
    display_plan(&preview.plan);
    if preview.plan.is_empty() {
        return Ok((SimulateSummary::default(), observed));
    }

    // 2. Confirm (unless --yes)
    if !opts.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok((
            SimulateSummary {
                not_attempted: preview.plan.len(),
                ..Default::default()
            },
            observed,
        ));
    }

    let mut backend = SimulatedBackend::new(observed);
    for (kind, times) in &opts.failures {
        backend.fail(kind, *times, opts.category);
    }

    // 3. Run passes until nothing is left or a pass fails
    let mut summary = SimulateSummary::default();
    let mut progress = BarProgress::new(opts.verbose);
    for pass in 1..=opts.passes.max(1) {
        println!();
        println!("  {} Pass {pass}...", "→".cyan());
        let report = reconciler.reconcile("simulated", desired, &mut backend, &mut progress);
        summary.record(&report);
        let noop = report.is_noop();

        if let Some(error) = report.error {
            print_summary(&summary);
            return Err(error).context(format!("Pass {pass} {}", report.state));
        }
        if noop {
            break;
        }
    }

    // 4. Summary
    print_summary(&summary);
    if !backend.cordoned().is_empty() {
        ui::warn(&format!(
            "Still cordoned: {}",
            backend.cordoned().iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }

    Ok((summary, backend.into_state()))
}

/// Print final summary
fn print_summary(summary: &SimulateSummary) {
    println!();
    if summary.is_success() {
        println!(
            "  {} Configuration converged in {} pass(es)",
            "✓".green().bold(),
            summary.passes
        );
    } else {
        println!(
            "  {} Configuration applied with errors",
            "⚠".yellow().bold()
        );
    }

    if summary.created > 0 {
        println!("    • {} entities created", summary.created);
    }
    if summary.applied > 0 {
        println!("    • {} actions applied", summary.applied);
    }
    if summary.unchanged > 0 {
        println!("    • {} actions already in place", summary.unchanged);
    }
    if summary.not_attempted > 0 {
        println!("    • {} actions not attempted", summary.not_attempted);
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "actions".red());
    }
}
