//! # Reconcile
//!
//! Converges a composite cluster resource from its observed configuration
//! to a desired one.
//!
//! ## Core Concepts
//!
//! - **ClusterConfig**: A configuration tree (cluster settings, roles,
//!   regions, ingress shards and an optional message broker)
//! - **ChangeRecord**: One classified difference between two trees
//! - **ExecutionPlan**: Ordered backend actions that remove the differences
//! - **Backend**: The mutation operations one resource instance exposes
//! - **Reconciler**: Runs diff, plan and apply passes with retry
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{ClusterConfig, NoProgress, Reconciler, SimulatedBackend};
//!
//! let desired: ClusterConfig = toml::from_str(&std::fs::read_to_string("desired.toml")?)?;
//! let mut backend = SimulatedBackend::new(ClusterConfig::default());
//!
//! let report = Reconciler::default().reconcile("prod", &desired, &mut backend, &mut NoProgress);
//! for outcome in &report.outcomes {
//!     println!("{} {}", outcome.action, outcome.status);
//! }
//! report.into_result()?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`Backend`]: Reads and mutates one resource instance
//! - [`ProgressCallback`]: Receives progress updates
//! - [`Sleeper`]: Waits out retry delays

pub mod classify;
pub mod compare;
pub mod config;
pub mod context;
pub mod differ;
pub mod error;
pub mod executor;
pub mod fields;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod sim;
pub mod validate;

// Re-export main types at crate root
pub use classify::{ChangeKind, ChangePayload, ChangeRecord, Direction};
pub use compare::{FieldDelta, ToggleTransition, compare};
pub use config::{EngineConfig, PlannerConfig, RetryConfig};
pub use context::{CancelToken, NoProgress, ProgressCallback};
pub use differ::{ConfigDiff, diff_configs};
pub use error::{BackendError, Error, ErrorCategory, Result};
pub use executor::{ApplyOutcome, Backend, BackendResult, dispatch};
pub use merge::{MergeInstruction, StateUpdate, apply_merges};
pub use model::{
    AclGrant, BrokerConfig, ClusterConfig, ClusterSettings, ComponentOptions, ComponentToggle,
    DesiredConfiguration, EntityKey, EntityKind, EntityRef, IngressShard, ObservedConfiguration,
    Quota, Region, Role, Topic,
};
pub use orchestrator::{
    ActionOutcome, ActionStatus, Instance, PassReport, PassState, Preview, Reconciler,
};
pub use planner::{Action, ActionKind, ExecutionPlan, Priority};
pub use retry::{NoSleep, RecordingSleeper, RetryPolicy, Sleeper, ThreadSleeper};
pub use sim::SimulatedBackend;
