//! Core types for graph execution

use crate::retry::RetryConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a node within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet dispatched
    Pending,
    /// Handed to a worker
    Running,
    /// Action completed and state is recorded
    Succeeded,
    /// Action or state persistence failed
    Failed,
    /// Never executed
    Skipped,
}

impl NodeStatus {
    /// Whether the node has finished for this run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Why a node was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency, direct or transitive, did not succeed
    UpstreamFailure {
        /// The dependency that failed or was skipped
        node: String,
    },
    /// The run was cancelled before the node was dispatched
    Cancelled,
    /// A critical failure halted the run
    Aborted {
        /// Node whose failure triggered the abort
        critical_failure: String,
    },
    /// Dry run; nothing was executed
    DryRun,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamFailure { node } => write!(f, "upstream '{node}' did not succeed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Aborted { critical_failure } => {
                write!(f, "run aborted after critical failure of '{critical_failure}'")
            }
            Self::DryRun => write!(f, "dry run"),
        }
    }
}

/// Final result for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// State version after the run, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Whether a new state version was written
    #[serde(default)]
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeOutcome {
    /// A node that completed successfully
    pub fn succeeded(
        name: impl Into<String>,
        version: u64,
        changed: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Succeeded,
            skip_reason: None,
            error: None,
            version: Some(version),
            changed,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    /// A node whose action or persistence failed
    pub fn failed(
        name: impl Into<String>,
        error: impl Into<String>,
        version: Option<u64>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Failed,
            skip_reason: None,
            error: Some(error.into()),
            version,
            changed: false,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    /// A node that never ran (or gave up before doing anything)
    pub fn skipped(name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Skipped,
            skip_reason: Some(reason),
            error: None,
            version: None,
            changed: false,
            started_at: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }
}

/// Counts of node outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ExecuteSummary {
    /// Number of nodes that succeeded
    pub fn succeeded(&self) -> usize {
        self.changed + self.unchanged
    }

    /// Total number of nodes accounted for
    pub fn total(&self) -> usize {
        self.changed + self.unchanged + self.failed + self.skipped
    }

    /// Check if execution was fully successful
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Add an outcome to the summary
    pub fn add(&mut self, outcome: &NodeOutcome) {
        match outcome.status {
            NodeStatus::Succeeded if outcome.changed => self.changed += 1,
            NodeStatus::Succeeded => self.unchanged += 1,
            NodeStatus::Failed => self.failed += 1,
            NodeStatus::Skipped | NodeStatus::Pending | NodeStatus::Running => self.skipped += 1,
        }
    }
}

/// Result of executing a graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphReport {
    /// Deterministic topological order of the graph
    pub order: Vec<String>,
    /// One outcome per node, in completion order
    pub outcomes: Vec<NodeOutcome>,
    /// Critical node whose failure halted the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<String>,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl GraphReport {
    /// Look up the outcome for a node
    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Status of a node, `None` if it is not part of the graph
    pub fn status_of(&self, name: &str) -> Option<NodeStatus> {
        self.outcome(name).map(|o| o.status)
    }

    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for outcome in &self.outcomes {
            summary.add(outcome);
        }
        summary
    }

    /// Whether any node failed
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| o.status == NodeStatus::Failed)
    }
}

/// Options for graph execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of nodes running at once
    pub jobs: usize,
    /// Lease duration for per-node locks
    pub lock_ttl: Duration,
    /// Lock key for nodes that do not name a state resource
    pub global_lock_key: String,
    /// Lock holder identity, unique per run
    pub holder_id: String,
    /// Per-node action time budget
    pub action_timeout: Option<Duration>,
    /// Retry policy handed to actions
    pub retry: RetryConfig,
    /// Compute the order without executing anything
    pub dry_run: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            lock_ttl: Duration::from_secs(900),
            global_lock_key: "global".to_string(),
            holder_id: format!("provision-{}", std::process::id()),
            action_timeout: Some(Duration::from_secs(300)),
            retry: RetryConfig::default(),
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let started = Utc::now();
        let report = GraphReport {
            order: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            outcomes: vec![
                NodeOutcome::succeeded("a", 1, true, started),
                NodeOutcome::succeeded("b", 4, false, started),
                NodeOutcome::failed("c", "boom", None, started),
                NodeOutcome::skipped(
                    "d",
                    SkipReason::UpstreamFailure { node: "c".into() },
                ),
            ],
            ..GraphReport::default()
        };

        let summary = report.summary();
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total(), 4);
        assert!(!summary.is_success());
        assert!(report.has_failures());
        assert_eq!(report.status_of("d"), Some(NodeStatus::Skipped));
        assert_eq!(report.status_of("zzz"), None);
    }

    #[test]
    fn test_skip_reason_serializes_tagged() {
        let json = serde_json::to_value(SkipReason::Aborted {
            critical_failure: "vpc".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "aborted");
        assert_eq!(json["critical_failure"], "vpc");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Succeeded.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
    }
}
