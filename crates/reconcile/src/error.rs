//! Error types for reconciliation passes.
//!
//! Backend failures carry a category so the orchestrator can tell transient
//! faults (worth retrying) from rejections. Engine errors follow the pass
//! lifecycle: validation and drift stop a pass before anything executes,
//! backend failures during apply surface directly or wrapped in
//! [`Error::PartialApply`] once earlier actions have committed.

use std::fmt;
use thiserror::Error;

/// Categories of backend errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Timeouts, throttling, temporarily unavailable (retryable)
    Transient,
    /// Resource is busy with another mutation
    Conflict,
    /// Target entity does not exist
    NotFound,
    /// Request refused as invalid
    Rejected,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "transient backend failure",
            Self::Conflict => "conflicting mutation in progress",
            Self::NotFound => "entity not found",
            Self::Rejected => "request rejected",
            Self::Other => "unexpected error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Error returned by a backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category}: {message}")]
pub struct BackendError {
    pub category: ErrorCategory,
    pub message: String,
}

impl BackendError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Rejected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

/// Errors that can occur during a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The changeset violates a configuration or dependency invariant
    #[error("validation failed: {}", .issues.join("; "))]
    Validation {
        /// One line per violated invariant
        issues: Vec<String>,
    },

    /// Entities with backend-assigned names vanished from the observed tree
    #[error("configuration drift: {} no longer present in observed configuration", .entities.join(", "))]
    ConfigurationDrift {
        /// Entities expected by key but not found
        entities: Vec<String>,
    },

    /// A retryable action kept failing transiently
    #[error("{action} failed after {attempts} attempts: {source}")]
    TransientBackend {
        /// Rendered action
        action: String,
        /// Attempts made, including the first
        attempts: u32,
        /// Last backend error seen
        source: BackendError,
    },

    /// An action failed and was not retried
    #[error("{action} failed: {source}")]
    Backend {
        /// Rendered action
        action: String,
        /// Backend error
        source: BackendError,
    },

    /// An action failed after earlier actions of the same pass committed
    #[error("{failed} failed after committing [{}]: {source}", .committed.join(", "))]
    PartialApply {
        /// Rendered action that failed
        failed: String,
        /// Rendered actions that were applied, in order
        committed: Vec<String>,
        /// The failure of `failed`
        source: Box<Error>,
    },

    /// A field difference has no change classification (engine bug)
    #[error("field '{field}' of {entity} has no change classification")]
    Classification {
        /// Entity whose field differed
        entity: String,
        /// Field path
        field: String,
    },

    /// A change record has no action mapping (engine bug)
    #[error("no action for {change} on {entity}")]
    Unplannable {
        /// Entity the change targets
        entity: String,
        /// Change kind
        change: String,
    },

    /// The caller cancelled the pass
    #[error("pass cancelled after committing [{}]", .committed.join(", "))]
    Cancelled {
        /// Rendered actions that were applied before cancellation
        committed: Vec<String>,
    },

    /// Reading the observed configuration failed
    #[error("failed to read observed configuration: {0}")]
    Observe(#[source] BackendError),

    /// A merge instruction named an entity that is not in the target state
    #[error("merge target {entity} not found")]
    MergeTarget {
        /// Entity reference
        entity: String,
    },
}

impl Error {
    pub fn validation(issue: impl Into<String>) -> Self {
        Self::Validation {
            issues: vec![issue.into()],
        }
    }

    /// Actions committed before this error, when the error carries them.
    pub fn committed(&self) -> &[String] {
        match self {
            Self::PartialApply { committed, .. } | Self::Cancelled { committed } => committed,
            _ => &[],
        }
    }

    /// Whether the root failure was a transient backend error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientBackend { .. } => true,
            Self::PartialApply { source, .. } => source.is_transient(),
            Self::Observe(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether a later pass may succeed without a configuration change.
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            Self::Validation { .. } | Self::Classification { .. } | Self::Unplannable { .. }
        )
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(!ErrorCategory::Rejected.is_retryable());
        assert!(!ErrorCategory::Conflict.is_retryable());
    }

    #[test]
    fn test_partial_apply_message_lists_committed() {
        let err = Error::PartialApply {
            failed: "AddNodes(region/r1, +2)".into(),
            committed: vec!["ChangeFlavor(region/r1, F2)".into()],
            source: Box::new(Error::Backend {
                action: "AddNodes(region/r1, +2)".into(),
                source: BackendError::rejected("quota exceeded"),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("ChangeFlavor(region/r1, F2)"), "{msg}");
        assert_eq!(err.committed().len(), 1);
        assert!(!err.is_transient());
        assert!(err.is_resumable());
    }

    #[test]
    fn test_transient_through_partial_apply() {
        let err = Error::PartialApply {
            failed: "x".into(),
            committed: vec!["y".into()],
            source: Box::new(Error::TransientBackend {
                action: "x".into(),
                attempts: 5,
                source: BackendError::transient("timeout"),
            }),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_validation_not_resumable() {
        assert!(!Error::validation("bad").is_resumable());
    }
}
