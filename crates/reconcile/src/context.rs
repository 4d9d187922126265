//! Progress and cancellation hooks for a reconciliation pass
//!
//! These let the engine report to a terminal (or nothing) without
//! depending on any particular UI crate.

use crate::error::BackendError;
use crate::orchestrator::{ActionStatus, PassReport};
use crate::planner::Action;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Progress callback for a reconciliation pass
///
/// Implement this trait to receive updates while actions execute.
pub trait ProgressCallback: Send {
    /// Called once the plan is known, before the first action
    fn on_pass_start(&mut self, instance: &str, actions: usize);

    /// Called before an action is dispatched
    fn on_action_start(&mut self, index: usize, action: &Action);

    /// Called before waiting to retry a transient failure
    ///
    /// `attempt` is the attempt that just failed (1-indexed).
    fn on_retry(&mut self, action: &Action, attempt: u32, error: &BackendError, delay: Duration);

    /// Called when an action has settled
    fn on_action_complete(&mut self, index: usize, action: &Action, status: &ActionStatus);

    /// Called when the pass ends, successfully or not
    fn on_pass_complete(&mut self, report: &PassReport);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_pass_start(&mut self, _instance: &str, _actions: usize) {}
    fn on_action_start(&mut self, _index: usize, _action: &Action) {}
    fn on_retry(&mut self, _action: &Action, _attempt: u32, _error: &BackendError, _delay: Duration) {}
    fn on_action_complete(&mut self, _index: usize, _action: &Action, _status: &ActionStatus) {}
    fn on_pass_complete(&mut self, _report: &PassReport) {}
}

/// Shared flag a caller flips to stop a pass between actions
///
/// Cancellation never interrupts a backend call in flight; the pass stops
/// before the next dispatch or retry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
