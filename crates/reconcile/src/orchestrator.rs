//! Reconciliation orchestrator - drives diff, plan and apply for one instance
//!
//! A pass walks `Idle -> Diffing -> Planning -> Applying` and ends in
//! `Succeeded` or `PartiallyFailed` (or `Rejected` when it stops before
//! anything is applied). Actions run strictly one at a time; the first
//! failure stops the queue and the next pass re-reads the backend.

use crate::classify::ChangeRecord;
use crate::config::EngineConfig;
use crate::context::{CancelToken, NoProgress, ProgressCallback};
use crate::differ::{ConfigDiff, diff_configs};
use crate::error::{BackendError, Error, Result};
use crate::executor::{ApplyOutcome, Backend, dispatch};
use crate::merge::MergeInstruction;
use crate::model::{DesiredConfiguration, EntityKey, EntityRef, ObservedConfiguration};
use crate::planner::{Action, ExecutionPlan, PlanContext, plan};
use crate::retry::{RetryError, RetryPolicy, Sleeper, ThreadSleeper, with_retry};
use crate::validate::{validate_changes, validate_desired};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Where a pass is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Diffing,
    Planning,
    Applying,
    Succeeded,
    PartiallyFailed,
    /// Stopped before any action was dispatched
    Rejected,
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Diffing => "diffing",
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially failed",
            Self::Rejected => "rejected",
        })
    }
}

/// How one planned action settled
#[derive(Debug, Clone, PartialEq)]
pub enum ActionStatus {
    Applied,
    Unchanged,
    Created { name: String },
    Failed { error: Error },
    /// Skipped because an earlier action failed or the pass was cancelled
    NotAttempted,
}

impl ActionStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Unchanged | Self::Created { .. }
        )
    }
}

impl From<ApplyOutcome> for ActionStatus {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied => Self::Applied,
            ApplyOutcome::Unchanged => Self::Unchanged,
            ApplyOutcome::Created { name } => Self::Created { name },
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Created { name } => write!(f, "created {name}"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::NotAttempted => f.write_str("not attempted"),
        }
    }
}

/// One action of a pass and what happened to it
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// The action as dispatched (pending keys resolved)
    pub action: Action,
    pub status: ActionStatus,
    /// Backend calls made for this action
    pub attempts: u32,
}

/// Everything a pass did
#[derive(Debug, Clone)]
pub struct PassReport {
    pub instance: String,
    /// Final state
    pub state: PassState,
    /// States visited, in order
    pub transitions: Vec<PassState>,
    pub changes: Vec<ChangeRecord>,
    pub outcomes: Vec<ActionOutcome>,
    /// State updates for the actions that succeeded, in order
    pub merges: Vec<MergeInstruction>,
    pub error: Option<Error>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PassReport {
    fn new(instance: &str) -> Self {
        let now = Utc::now();
        Self {
            instance: instance.to_string(),
            state: PassState::Idle,
            transitions: vec![PassState::Idle],
            changes: Vec::new(),
            outcomes: Vec::new(),
            merges: Vec::new(),
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn enter(&mut self, state: PassState) {
        log::debug!("{}: {} -> {state}", self.instance, self.state);
        self.state = state;
        self.transitions.push(state);
    }

    fn finish(&mut self, state: PassState, error: Option<Error>) {
        self.enter(state);
        // Back to idle; the terminal state stays in `state`
        self.transitions.push(PassState::Idle);
        self.error = error;
        self.finished_at = Utc::now();
    }

    /// Whether the pass found nothing to do
    pub fn is_noop(&self) -> bool {
        self.error.is_none() && self.outcomes.is_empty()
    }

    /// Actions that committed, in order
    pub fn committed(&self) -> Vec<&Action> {
        self.outcomes
            .iter()
            .filter(|o| o.status.is_success())
            .map(|o| &o.action)
            .collect()
    }

    /// The report, or the error the pass ended with
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// Diff and plan without executing anything
#[derive(Debug, Clone)]
pub struct Preview {
    pub diff: ConfigDiff,
    pub plan: ExecutionPlan,
}

/// One resource instance for [`Reconciler::reconcile_all`]
pub struct Instance<B> {
    pub name: String,
    pub desired: DesiredConfiguration,
    pub backend: B,
}

/// Runs reconciliation passes
#[derive(Clone)]
pub struct Reconciler {
    config: EngineConfig,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancelToken,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sleeper: Arc::new(ThreadSleeper),
            cancel: CancelToken::new(),
        }
    }

    /// Replace how retry delays are waited out
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that stops running passes before their next action
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Diff, validate and plan
    ///
    /// Fails with `ConfigurationDrift` when an entity known by its backend
    /// name disappeared, and with `Validation` for rejected changesets.
    pub fn preview(
        &self,
        desired: &DesiredConfiguration,
        observed: &ObservedConfiguration,
    ) -> Result<Preview> {
        let diff = self.diff(desired, observed)?;
        let plan = self.plan(&diff, observed)?;
        Ok(Preview { diff, plan })
    }

    fn diff(
        &self,
        desired: &DesiredConfiguration,
        observed: &ObservedConfiguration,
    ) -> Result<ConfigDiff> {
        validate_desired(desired)?;
        let diff = diff_configs(desired, observed)?;
        if !diff.drifted.is_empty() {
            return Err(Error::ConfigurationDrift {
                entities: diff.drifted.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(diff)
    }

    fn plan(&self, diff: &ConfigDiff, observed: &ObservedConfiguration) -> Result<ExecutionPlan> {
        validate_changes(&diff.changes, &self.config.planner)?;
        plan(
            &diff.changes,
            &PlanContext {
                observed,
                config: &self.config.planner,
            },
        )
    }

    /// Run one pass for one instance
    ///
    /// The observed configuration is read from the backend at the start of
    /// the pass. The returned report always lists every planned action; on
    /// failure `report.error` holds the surfaced error.
    pub fn reconcile<B, P>(
        &self,
        instance: &str,
        desired: &DesiredConfiguration,
        backend: &mut B,
        progress: &mut P,
    ) -> PassReport
    where
        B: Backend + ?Sized,
        P: ProgressCallback + ?Sized,
    {
        let mut report = PassReport::new(instance);

        report.enter(PassState::Diffing);
        let observed = match backend.observe() {
            Ok(observed) => observed,
            Err(e) => {
                report.finish(PassState::Rejected, Some(Error::Observe(e)));
                progress.on_pass_complete(&report);
                return report;
            }
        };
        let diff = match self.diff(desired, &observed) {
            Ok(diff) => diff,
            Err(e) => {
                log::warn!("{instance}: {e}");
                report.finish(PassState::Rejected, Some(e));
                progress.on_pass_complete(&report);
                return report;
            }
        };
        report.changes.clone_from(&diff.changes);

        report.enter(PassState::Planning);
        let plan = match self.plan(&diff, &observed) {
            Ok(plan) => plan,
            Err(e) => {
                log::warn!("{instance}: {e}");
                report.finish(PassState::Rejected, Some(e));
                progress.on_pass_complete(&report);
                return report;
            }
        };

        report.enter(PassState::Applying);
        progress.on_pass_start(instance, plan.len());
        let error = self.apply(&plan, &diff.bindings, backend, progress, &mut report);

        let state = if error.is_some() {
            PassState::PartiallyFailed
        } else {
            PassState::Succeeded
        };
        report.finish(state, error);
        log::info!(
            "{instance}: pass {} ({} action(s), {} committed)",
            report.state,
            report.outcomes.len(),
            report.committed().len()
        );
        progress.on_pass_complete(&report);
        report
    }

    fn apply<B, P>(
        &self,
        plan: &ExecutionPlan,
        bindings: &BTreeMap<EntityRef, usize>,
        backend: &mut B,
        progress: &mut P,
        report: &mut PassReport,
    ) -> Option<Error>
    where
        B: Backend + ?Sized,
        P: ProgressCallback + ?Sized,
    {
        // Names the backend assigned to entities created earlier in the pass
        let mut resolved: BTreeMap<EntityKey, String> = BTreeMap::new();
        let mut committed: Vec<String> = Vec::new();
        let mut failure: Option<Error> = None;

        for (index, planned) in plan.iter().enumerate() {
            if failure.is_some() {
                report.outcomes.push(ActionOutcome {
                    action: planned.clone(),
                    status: ActionStatus::NotAttempted,
                    attempts: 0,
                });
                continue;
            }

            if self.cancel.is_cancelled() {
                log::warn!("{}: cancelled before {planned}", report.instance);
                failure = Some(Error::Cancelled {
                    committed: committed.clone(),
                });
                report.outcomes.push(ActionOutcome {
                    action: planned.clone(),
                    status: ActionStatus::NotAttempted,
                    attempts: 0,
                });
                continue;
            }

            let mut action = planned.clone();
            if let Some(name) = resolved.get(&planned.target.key) {
                action.target = EntityRef::named(planned.target.kind, name.clone());
            }

            progress.on_action_start(index, &action);
            let (status, attempts) = self.run_action(&action, backend, progress);

            match &status {
                Ok(outcome) => {
                    if let ApplyOutcome::Created { name } = outcome
                        && planned.target.key.is_pending()
                    {
                        resolved.insert(planned.target.key.clone(), name.clone());
                        action.target = EntityRef::named(planned.target.kind, name.clone());
                    }
                    log::info!("{}: {action} {outcome:?}", report.instance);
                    let source = bindings.get(&planned.target).copied();
                    report.merges.extend(MergeInstruction::for_action(
                        index,
                        &action,
                        action.target.clone(),
                        source,
                        outcome,
                    ));
                    committed.push(action.to_string());
                }
                Err(error) => {
                    log::warn!("{}: {action} failed: {error}", report.instance);
                    failure = Some(match error {
                        Error::Cancelled { .. } => Error::Cancelled {
                            committed: committed.clone(),
                        },
                        _ if committed.is_empty() => error.clone(),
                        _ => Error::PartialApply {
                            failed: action.to_string(),
                            committed: committed.clone(),
                            source: Box::new(error.clone()),
                        },
                    });
                }
            }

            let status = match status {
                Ok(outcome) => ActionStatus::from(outcome),
                Err(error) => ActionStatus::Failed { error },
            };
            progress.on_action_complete(index, &action, &status);
            report.outcomes.push(ActionOutcome {
                action,
                status,
                attempts,
            });
        }

        failure
    }

    fn run_action<B, P>(
        &self,
        action: &Action,
        backend: &mut B,
        progress: &mut P,
    ) -> (Result<ApplyOutcome>, u32)
    where
        B: Backend + ?Sized,
        P: ProgressCallback + ?Sized,
    {
        if action.target.key.is_pending() && !action.kind.is_create() {
            let error = BackendError::not_found(format!("{} was never created", action.target));
            return (
                Err(Error::Backend {
                    action: action.to_string(),
                    source: error,
                }),
                0,
            );
        }

        let policy = if action.idempotent && action.retryable {
            RetryPolicy::from(&self.config.retry)
        } else {
            RetryPolicy::no_retry()
        };

        let result = with_retry(
            &policy,
            self.sleeper.as_ref(),
            &self.cancel,
            |attempt, error: &BackendError, delay| {
                log::warn!(
                    "{action} attempt {attempt}/{} failed: {error}; retrying in {}s",
                    policy.max_attempts,
                    delay.as_secs()
                );
                progress.on_retry(action, attempt, error, delay);
            },
            || dispatch(backend, action),
        );

        match result {
            Ok((outcome, attempts)) => (Ok(outcome), attempts),
            Err(RetryError::Exhausted { attempts, last }) => (
                Err(Error::TransientBackend {
                    action: action.to_string(),
                    attempts,
                    source: last,
                }),
                attempts,
            ),
            Err(RetryError::Fatal { attempts, error }) => (
                Err(Error::Backend {
                    action: action.to_string(),
                    source: error,
                }),
                attempts,
            ),
            Err(RetryError::Cancelled { attempts, .. }) => (
                Err(Error::Cancelled {
                    committed: Vec::new(),
                }),
                attempts,
            ),
        }
    }

    /// Run passes until one finds nothing to do
    ///
    /// Stops at the first failed pass. Returns every report; the last one is
    /// a no-op pass unless `max_passes` ran out first.
    pub fn converge<B, P>(
        &self,
        instance: &str,
        desired: &DesiredConfiguration,
        backend: &mut B,
        progress: &mut P,
        max_passes: usize,
    ) -> Result<Vec<PassReport>>
    where
        B: Backend + ?Sized,
        P: ProgressCallback + ?Sized,
    {
        let mut reports = Vec::new();
        for pass in 1..=max_passes.max(1) {
            log::debug!("{instance}: pass {pass}");
            let report = self.reconcile(instance, desired, backend, progress);
            let noop = report.is_noop();
            if let Some(error) = &report.error {
                return Err(error.clone());
            }
            reports.push(report);
            if noop {
                return Ok(reports);
            }
        }
        log::warn!("{instance}: still changing after {max_passes} pass(es)");
        Ok(reports)
    }

    /// Reconcile independent instances in parallel
    ///
    /// Each instance still runs its own actions one at a time. `jobs` caps
    /// the number of instances in flight (0 uses rayon's default).
    pub fn reconcile_all<B>(&self, instances: &mut [Instance<B>], jobs: usize) -> Vec<PassReport>
    where
        B: Backend + Send,
    {
        let run = |instances: &mut [Instance<B>]| -> Vec<PassReport> {
            instances
                .par_iter_mut()
                .map(|i| self.reconcile(&i.name, &i.desired, &mut i.backend, &mut NoProgress))
                .collect()
        };

        if jobs == 0 {
            return run(instances);
        }
        match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
            Ok(pool) => pool.install(|| run(instances)),
            Err(e) => {
                log::warn!("failed to create thread pool ({e}); using the global pool");
                run(instances)
            }
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::diff_configs;
    use crate::error::ErrorCategory;
    use crate::merge::apply_merges;
    use crate::model::{
        AclGrant, BrokerConfig, ClusterConfig, ComponentOptions, ComponentToggle, EntityKind,
        IngressShard, Quota, Region, Role, Topic,
    };
    use crate::retry::RecordingSleeper;
    use crate::sim::SimulatedBackend;
    use std::time::Duration;

    fn region(name: Option<&str>, size: u32, flavor: &str) -> Region {
        Region {
            name: name.map(String::from),
            flavor: flavor.into(),
            size,
            ..Default::default()
        }
    }

    fn reconciler(sleeper: Arc<RecordingSleeper>) -> Reconciler {
        Reconciler::default().with_sleeper(sleeper)
    }

    fn observed_cluster() -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.settings.version = Some("1.28".into());
        config
            .components
            .insert("monitoring".into(), ComponentToggle::enabled());
        config.roles.push(Role {
            name: "master".into(),
            flavor: "F4".into(),
            count: 3,
            access_groups: ["ops".to_string()].into(),
        });
        let mut r1 = region(Some("r1"), 2, "F1");
        r1.zones = vec!["z1".into()];
        r1.components
            .insert("monitoring".into(), ComponentToggle::enabled());
        config.regions.push(r1);
        config.ingress.push(IngressShard {
            name: Some("ingress-a".into()),
            flavor: "F1".into(),
            size: 2,
            allowed_codes: vec!["US".into()],
            ..Default::default()
        });
        config.broker = Some(BrokerConfig {
            topics: vec![Topic {
                name: "orders".into(),
                partitions: 3,
                ..Default::default()
            }],
            acls: vec![AclGrant {
                principal: "svc".into(),
                operation: "read".into(),
                topic: "orders".into(),
            }],
            quotas: vec![Quota {
                principal: "svc".into(),
                produce_rate: Some(1024.0),
                consume_rate: None,
            }],
        });
        config
    }

    fn desired_cluster() -> ClusterConfig {
        let mut config = observed_cluster();
        config.settings.version = Some("1.29".into());
        config.settings.cpu_ratio = Some(2.0);
        config.components.insert(
            "logging".into(),
            ComponentToggle::with_options(ComponentOptions::Logging {
                level: "info".into(),
                sink: None,
            }),
        );
        config.roles[0].flavor = "F8".into();
        config.roles[0].access_groups = ["dev".to_string()].into();

        let r1 = &mut config.regions[0];
        r1.size = 5;
        r1.flavor = "F2".into();
        r1.zones = vec!["z1".into(), "z2".into()];
        r1.components.remove("monitoring");
        r1.components
            .insert("logging".into(), ComponentToggle::enabled());

        let mut fresh = region(None, 12, "F3");
        fresh.provisional = Some(1);
        fresh.labels.insert("tier".into(), "batch".into());
        fresh
            .components
            .insert("logging".into(), ComponentToggle::enabled());
        config.regions.push(fresh);

        let shard = &mut config.ingress[0];
        shard.allowed_codes = vec!["US".into(), "CA".into()];
        shard.ports.insert("https".into(), 443);

        let broker = config.broker.get_or_insert_with(BrokerConfig::default);
        broker.topics[0].partitions = 6;
        broker.topics.push(Topic {
            name: "audit".into(),
            partitions: 1,
            config: [("retention.ms".to_string(), "86400000".to_string())].into(),
        });
        broker.acls = vec![AclGrant {
            principal: "svc".into(),
            operation: "write".into(),
            topic: "orders".into(),
        }];
        broker.quotas[0].consume_rate = Some(2048.0);
        config
    }

    #[test]
    fn test_no_op_pass() {
        let config = observed_cluster();
        let mut backend = SimulatedBackend::new(config.clone());
        let report = Reconciler::default().reconcile("c1", &config, &mut backend, &mut NoProgress);
        assert!(report.is_noop());
        assert!(report.changes.is_empty());
        assert_eq!(report.state, PassState::Succeeded);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F1")],
            ..Default::default()
        };
        let observed = ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(observed);
        let report = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert_eq!(
            report.transitions,
            vec![
                PassState::Idle,
                PassState::Diffing,
                PassState::Planning,
                PassState::Applying,
                PassState::Succeeded,
                PassState::Idle,
            ]
        );
        assert_eq!(backend.calls(), ["add_nodes region/r1"]);
    }

    #[test]
    fn test_full_tree_converges_against_backend() {
        let desired = desired_cluster();
        let mut backend = SimulatedBackend::new(observed_cluster());
        let sleeper = Arc::new(RecordingSleeper::new());

        let report = reconciler(sleeper.clone()).reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(report.error.is_none(), "{:?}", report.error);
        assert!(sleeper.delays().is_empty());

        let rediff = diff_configs(&desired, backend.state()).unwrap();
        assert!(
            rediff.is_empty(),
            "left over: {:?}",
            rediff.changes.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        assert!(backend.cordoned().is_empty());

        let again = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(again.is_noop());
    }

    #[test]
    fn test_merges_converge_stored_state() {
        let desired = desired_cluster();
        let observed = observed_cluster();
        let mut backend = SimulatedBackend::new(observed.clone());

        let report = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(report.error.is_none(), "{:?}", report.error);

        let mut stored = observed;
        apply_merges(&mut stored, &desired, &report.merges).unwrap();
        let rediff = diff_configs(&desired, &stored).unwrap();
        assert!(
            rediff.is_empty(),
            "left over: {:?}",
            rediff.changes.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        assert_eq!(stored.regions.len(), 2);
        assert!(stored.regions[1].name.is_some());
    }

    #[test]
    fn test_scenario_c_resolves_created_name() {
        let desired = ClusterConfig {
            regions: vec![region(None, 12, "F1")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig::default());
        let report = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(report.error.is_none());
        let rendered: Vec<String> = report.outcomes.iter().map(|o| o.action.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "CreateRegion(region/region-1, 10)",
                "AddNodes(region/region-1, +2)",
                "Uncordon(region/region-1)",
            ]
        );
        assert_eq!(
            report.outcomes[0].status,
            ActionStatus::Created {
                name: "region-1".into()
            }
        );
        assert_eq!(backend.state().regions[0].size, 12);
    }

    #[test]
    fn test_retry_bound_for_idempotent_action() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F2")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        });
        backend.fail_always("change_flavor", ErrorCategory::Transient);
        let sleeper = Arc::new(RecordingSleeper::new());

        let report = reconciler(sleeper.clone()).reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert_eq!(report.state, PassState::PartiallyFailed);
        assert_eq!(report.outcomes[0].attempts, 5);
        assert_eq!(backend.calls().len(), 5);
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240),
            ]
        );
        match report.error {
            Some(Error::TransientBackend { attempts: 5, .. }) => {}
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_idempotent_failure_not_retried() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F1")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        });
        backend.fail("add_nodes", 1, ErrorCategory::Transient);
        let sleeper = Arc::new(RecordingSleeper::new());

        let report = reconciler(sleeper.clone()).reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert_eq!(report.state, PassState::PartiallyFailed);
        assert_eq!(report.outcomes[0].attempts, 1);
        assert!(sleeper.delays().is_empty());
        assert!(report.error.as_ref().is_some_and(Error::is_transient));

        // The next pass picks the change up again
        let retry = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(retry.error.is_none());
        assert_eq!(backend.state().regions[0].size, 4);
    }

    #[test]
    fn test_partial_apply_lists_committed_and_stops() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F2")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        });
        backend.fail_always("add_nodes", ErrorCategory::Rejected);
        let mut desired_with_label = desired.clone();
        desired_with_label.regions[0]
            .labels
            .insert("tier".into(), "gold".into());

        let report =
            Reconciler::default().reconcile("c1", &desired_with_label, &mut backend, &mut NoProgress);
        assert_eq!(report.state, PassState::PartiallyFailed);
        match &report.error {
            Some(Error::PartialApply {
                failed,
                committed,
                source,
            }) => {
                assert_eq!(failed, "AddNodes(region/r1, +2)");
                assert_eq!(committed, &vec!["ChangeFlavor(region/r1, F2)".to_string()]);
                assert!(matches!(**source, Error::Backend { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(report.outcomes[2].status, ActionStatus::NotAttempted);
        assert!(!backend.calls().iter().any(|c| c.starts_with("update_settings")));
        assert_eq!(report.merges.len(), 1);
    }

    #[test]
    fn test_first_action_failure_surfaces_directly() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F1")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        });
        backend.fail_always("add_nodes", ErrorCategory::Rejected);
        let report = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(matches!(report.error, Some(Error::Backend { .. })));
    }

    #[test]
    fn test_validation_rejects_before_any_call() {
        let mut observed = ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        };
        observed
            .components
            .insert("x".into(), ComponentToggle::enabled());
        observed.regions[0]
            .components
            .insert("x".into(), ComponentToggle::enabled());
        let mut desired = observed.clone();
        desired.components.remove("x");
        desired.regions[0].size = 3;

        let mut backend = SimulatedBackend::new(observed);
        let report = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert_eq!(report.state, PassState::Rejected);
        assert!(matches!(report.error, Some(Error::Validation { .. })));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_drift_stops_pass() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r9"), 2, "F1")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig::default());
        let report = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert_eq!(report.state, PassState::Rejected);
        match report.error {
            Some(Error::ConfigurationDrift { entities }) => {
                assert_eq!(entities, vec!["region/r9".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_observe_failure() {
        let mut backend = SimulatedBackend::default();
        backend.fail_observe(ErrorCategory::Transient);
        let report = Reconciler::default().reconcile(
            "c1",
            &ClusterConfig::default(),
            &mut backend,
            &mut NoProgress,
        );
        assert!(matches!(report.error, Some(Error::Observe(_))));
        assert!(report.error.as_ref().is_some_and(Error::is_transient));
    }

    #[test]
    fn test_cancel_before_dispatch() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F2")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        });
        let reconciler = Reconciler::default();
        reconciler.cancel_token().cancel();
        let report = reconciler.reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(matches!(report.error, Some(Error::Cancelled { .. })));
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.status == ActionStatus::NotAttempted)
        );
        assert!(backend.calls().is_empty());
    }

    struct CancelAfterFirst(CancelToken);

    impl ProgressCallback for CancelAfterFirst {
        fn on_pass_start(&mut self, _instance: &str, _actions: usize) {}
        fn on_action_start(&mut self, _index: usize, _action: &Action) {}
        fn on_retry(&mut self, _: &Action, _: u32, _: &BackendError, _: Duration) {}
        fn on_action_complete(&mut self, _index: usize, _action: &Action, _status: &ActionStatus) {
            self.0.cancel();
        }
        fn on_pass_complete(&mut self, _report: &PassReport) {}
    }

    #[test]
    fn test_cancel_keeps_applied_prefix() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F2")],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        });
        let reconciler = Reconciler::default();
        let mut progress = CancelAfterFirst(reconciler.cancel_token());
        let report = reconciler.reconcile("c1", &desired, &mut backend, &mut progress);

        match &report.error {
            Some(Error::Cancelled { committed }) => {
                assert_eq!(committed, &vec!["ChangeFlavor(region/r1, F2)".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // No rollback: the flavor change stays
        assert_eq!(backend.state().regions[0].flavor, "F2");
        assert_eq!(backend.state().regions[0].size, 2);
    }

    #[test]
    fn test_unnamed_region_ahead_of_named_one_converges() {
        let desired = ClusterConfig {
            regions: vec![region(None, 3, "F1"), region(Some("r1"), 2, "F1")],
            ..Default::default()
        };
        let observed = ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        };

        for allow_removals in [false, true] {
            let reconciler = Reconciler::new(crate::config::EngineConfig {
                planner: crate::config::PlannerConfig {
                    allow_removals,
                    ..Default::default()
                },
                ..Default::default()
            });
            let mut backend = SimulatedBackend::new(observed.clone());

            let first = reconciler.reconcile("c1", &desired, &mut backend, &mut NoProgress);
            assert!(first.error.is_none(), "{:?}", first.error);
            assert_eq!(first.outcomes.len(), 1);

            let second = reconciler.reconcile("c1", &desired, &mut backend, &mut NoProgress);
            assert!(second.error.is_none(), "{:?}", second.error);
            assert!(second.is_noop());
            assert_eq!(backend.state().regions.len(), 2);

            let mut stored = observed.clone();
            apply_merges(&mut stored, &desired, &first.merges).unwrap();
            assert!(diff_configs(&desired, &stored).unwrap().is_empty());
        }
    }

    #[test]
    fn test_large_role_is_created_in_batches() {
        let desired = ClusterConfig {
            roles: vec![Role {
                name: "workers".into(),
                flavor: "F4".into(),
                count: 25,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut backend = SimulatedBackend::new(ClusterConfig::default());
        let report = Reconciler::default().reconcile("c1", &desired, &mut backend, &mut NoProgress);
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(backend.state().roles[0].count, 25);
        assert!(backend.cordoned().is_empty());

        let mut stored = ClusterConfig::default();
        apply_merges(&mut stored, &desired, &report.merges).unwrap();
        assert_eq!(stored.roles[0].count, 25);
    }

    #[test]
    fn test_converge_stops_on_noop() {
        let desired = desired_cluster();
        let mut backend = SimulatedBackend::new(observed_cluster());
        let reports = Reconciler::default()
            .converge("c1", &desired, &mut backend, &mut NoProgress, 5)
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[1].is_noop());
    }

    #[test]
    fn test_preview_matches_scenarios() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F1")],
            ..Default::default()
        };
        let observed = ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        };
        let preview = Reconciler::default().preview(&desired, &observed).unwrap();
        assert_eq!(preview.diff.changes.len(), 1);
        assert_eq!(preview.diff.changes[0].magnitude, 2);
        assert_eq!(preview.plan.actions[0].to_string(), "AddNodes(region/r1, +2)");
        assert_eq!(
            preview.plan.actions[0].target,
            EntityRef::named(EntityKind::Region, "r1")
        );
    }

    #[test]
    fn test_reconcile_all_runs_instances_independently() {
        let desired = ClusterConfig {
            regions: vec![region(Some("r1"), 4, "F1")],
            ..Default::default()
        };
        let observed = ClusterConfig {
            regions: vec![region(Some("r1"), 2, "F1")],
            ..Default::default()
        };
        let mut failing = SimulatedBackend::new(observed.clone());
        failing.fail_always("add_nodes", ErrorCategory::Rejected);
        let mut instances = vec![
            Instance {
                name: "a".into(),
                desired: desired.clone(),
                backend: SimulatedBackend::new(observed.clone()),
            },
            Instance {
                name: "b".into(),
                desired: desired.clone(),
                backend: failing,
            },
        ];

        let reports = Reconciler::default().reconcile_all(&mut instances, 2);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].instance, "a");
        assert!(reports[0].error.is_none());
        assert!(reports[1].error.is_some());
        assert_eq!(instances[0].backend.state().regions[0].size, 4);
        assert_eq!(instances[1].backend.state().regions[0].size, 2);
    }
}
