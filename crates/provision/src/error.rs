//! Error types for graph validation and provisioning actions.

use std::time::Duration;
use thiserror::Error;

/// Problems with a declared graph, reported before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A node was declared without a name
    #[error("resource name must not be empty")]
    EmptyName,

    /// Two nodes share a name
    #[error("duplicate resource '{0}'")]
    DuplicateNode(String),

    /// A node depends on a name that was never declared
    #[error("resource '{node}' depends on unknown resource '{dependency}'")]
    UnknownDependency {
        /// Node declaring the dependency
        node: String,
        /// The undeclared name
        dependency: String,
    },

    /// The dependency relation is not acyclic
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// The cycle as a path that starts and ends on the same node
        cycle: Vec<String>,
    },

    /// A selection target does not name a node
    #[error("unknown target resource '{0}'")]
    UnknownTarget(String),
}

/// Failures surfaced by a provisioning action.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// Temporary condition (network, rate limit); worth retrying
    #[error("transient failure: {message}")]
    Transient {
        /// What went wrong
        message: String,
    },

    /// The action cannot succeed by trying again
    #[error("{message}")]
    Permanent {
        /// What went wrong
        message: String,
    },

    /// The action ran past its deadline
    #[error("timed out after {}s", .after.as_secs())]
    TimedOut {
        /// Time budget that was exceeded
        after: Duration,
    },

    /// The run was cancelled before the action could finish its work
    #[error("cancelled")]
    Cancelled,
}

impl ActionError {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Whether retrying the action may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors that prevent a run from starting.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The graph is invalid
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The worker pool could not be created
    #[error("failed to create provisioning thread pool: {0}")]
    ThreadPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_shows_path() {
        let err = ValidationError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ActionError::transient("429 Too Many Requests").is_retryable());
        assert!(!ActionError::permanent("quota exceeded").is_retryable());
        assert!(
            !ActionError::TimedOut {
                after: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!ActionError::Cancelled.is_retryable());
    }
}
