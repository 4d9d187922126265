//! Engine settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one reconciler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub planner: PlannerConfig,
}

/// Backoff for idempotent, retryable actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per action, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_secs: u64,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_factor: f64,
    /// Upper bound for a single delay
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 30,
            backoff_factor: 2.0,
            max_delay_secs: 600,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Planner limits and policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Most nodes a single create or attach call may request
    pub max_batch_size: u32,
    /// Whether regions, ingress shards, roles and topics absent from the
    /// desired tree are removed. When false such changesets are rejected.
    pub allow_removals: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            allow_removals: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay(), Duration::from_secs(30));
        assert_eq!(config.planner.max_batch_size, 10);
        assert!(!config.planner.allow_removals);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"planner":{"allow_removals":true}}"#).unwrap();
        assert!(config.planner.allow_removals);
        assert_eq!(config.planner.max_batch_size, 10);
        assert_eq!(config.retry, RetryConfig::default());
    }
}
