//! Data types for the statekit crate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One version of a resource's provisioning output
///
/// Records are append-only: every successful write creates `version + 1`
/// and earlier versions stay readable for audit and rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Logical resource name the record belongs to
    pub resource_name: String,
    /// Monotonic version, starting at 1
    pub version: u64,
    /// Opaque provisioning output (endpoints, identifiers, ...)
    pub payload: serde_json::Value,
    /// When this version was written
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// Build the record that follows `previous` (or the first record when absent)
    pub fn next(
        resource_name: &str,
        previous: Option<u64>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            version: previous.unwrap_or(0) + 1,
            payload,
            updated_at: now,
        }
    }
}

/// A lease on a lock key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    /// Key of the guarded state resource
    pub resource_key: String,
    /// Identity of the current holder
    pub holder_id: String,
    /// Instant after which any caller may take the lock over
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    /// Whether the lease is still live at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_next_record_versions() {
        let now = Utc::now();
        let first = StateRecord::next("vpc", None, serde_json::json!({"id": "vpc-1"}), now);
        assert_eq!(first.version, 1);

        let second = StateRecord::next("vpc", Some(first.version), serde_json::json!({}), now);
        assert_eq!(second.version, 2);
        assert_eq!(second.resource_name, "vpc");
    }

    #[test]
    fn test_lock_liveness() {
        let now = Utc::now();
        let handle = LockHandle {
            resource_key: "network".into(),
            holder_id: "run-a".into(),
            expires_at: now + Duration::seconds(30),
        };
        assert!(handle.is_live(now));
        assert!(!handle.is_live(now + Duration::seconds(30)));
    }
}
