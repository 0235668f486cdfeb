//! Secret mappings and their outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a mapped secret is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SinkTarget {
    /// Sink identifier
    pub sink: String,
    /// Name of the secret inside the sink
    pub name: String,
}

impl fmt::Display for SinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sink, self.name)
    }
}

/// Propagate one secret from the store to one sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMapping {
    /// Name in the Secret Store
    pub source_name: String,
    /// Destination
    pub target: SinkTarget,
    /// Whether a missing source fails the run
    pub required: bool,
}

impl SecretMapping {
    /// Create a required mapping.
    pub fn new(
        source_name: impl Into<String>,
        sink: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            target: SinkTarget {
                sink: sink.into(),
                name: name.into(),
            },
            required: true,
        }
    }

    /// Mark the mapping optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Why a mapping failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A required source secret does not exist
    MissingSecret,
    /// Reading the source failed
    StoreError,
    /// Writing the sink failed
    SinkError,
}

/// Why a mapping was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipKind {
    /// An optional source secret does not exist yet
    NotConfigured,
    /// The provisioning node producing the value did not succeed
    UpstreamFailure {
        /// Node that failed or was skipped
        node: String,
    },
    /// Dry run; the sink was not written
    DryRun,
    /// The run was cancelled before reconciliation
    Cancelled,
    /// A critical node failed and the run stopped before reconciliation
    Aborted {
        /// The critical node
        node: String,
    },
}

/// Result of one mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum MappingResult {
    /// Value written to the sink
    Succeeded,
    /// Not written because of an error
    Failed(FailureKind),
    /// Deliberately not written
    Skipped(SkipKind),
}

/// Outcome record for one mapping. Carries names and kinds, never values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingOutcome {
    /// Source secret name
    pub source: String,
    /// Destination
    pub target: SinkTarget,
    /// Whether the mapping was required
    pub required: bool,
    /// What happened
    pub result: MappingResult,
    /// Scrubbed error message for failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MappingOutcome {
    /// Outcome with a result and no error message.
    pub fn new(mapping: &SecretMapping, result: MappingResult) -> Self {
        Self {
            source: mapping.source_name.clone(),
            target: mapping.target.clone(),
            required: mapping.required,
            result,
            error: None,
        }
    }

    /// Failed outcome carrying an error message.
    pub fn failed(mapping: &SecretMapping, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(mapping, MappingResult::Failed(kind))
        }
    }

    /// Skipped outcome.
    pub fn skipped(mapping: &SecretMapping, kind: SkipKind) -> Self {
        Self::new(mapping, MappingResult::Skipped(kind))
    }

    /// Whether the value reached the sink.
    pub fn is_success(&self) -> bool {
        self.result == MappingResult::Succeeded
    }

    /// A failure of a required mapping; fails the run.
    pub fn is_failure(&self) -> bool {
        self.required && matches!(self.result, MappingResult::Failed(_))
    }

    /// A failure of an optional mapping; reported as a warning.
    pub fn is_warning(&self) -> bool {
        !self.required && matches!(self.result, MappingResult::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_without_values() {
        let mapping = SecretMapping::new("db_password", "github", "DB_PASSWORD");
        let outcome = MappingOutcome::failed(&mapping, FailureKind::MissingSecret, "not found");
        let json = serde_json::to_value(&outcome).unwrap();

        assert_eq!(json["result"]["status"], "failed");
        assert_eq!(json["result"]["kind"], "missing_secret");
        assert_eq!(json["target"]["name"], "DB_PASSWORD");
        assert!(outcome.is_failure());
        assert!(!outcome.is_warning());
    }

    #[test]
    fn test_optional_failure_is_warning() {
        let mapping = SecretMapping::new("sentry_dsn", "github", "SENTRY_DSN").optional();
        let outcome = MappingOutcome::failed(&mapping, FailureKind::SinkError, "HTTP 500");
        assert!(outcome.is_warning());
        assert!(!outcome.is_failure());
    }

    #[test]
    fn test_skip_reason_serialization() {
        let mapping = SecretMapping::new("db_url", "runtime", "DB_URL");
        let outcome = MappingOutcome::skipped(
            &mapping,
            SkipKind::UpstreamFailure {
                node: "database".into(),
            },
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"]["status"], "skipped");
        assert_eq!(json["result"]["kind"]["reason"], "upstream_failure");
        assert_eq!(json["result"]["kind"]["node"], "database");
    }
}
