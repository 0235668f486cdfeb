//! In-process state and lock backend
//!
//! Used for tests and as the ephemeral fallback when the durable backend
//! cannot be opened. Nothing survives the process.

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::lock::{Acquire, LockBackend};
use crate::types::{LockHandle, StateRecord};
use crate::StateStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ephemeral in-memory state store and lock backend
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, Vec<StateRecord>>>,
    locks: Mutex<HashMap<String, LockHandle>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamping records with `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Vec<StateRecord>>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, LockHandle>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn get(&self, resource: &str) -> Result<Option<StateRecord>> {
        Ok(self
            .records()
            .get(resource)
            .and_then(|history| history.last().cloned()))
    }

    fn put(
        &self,
        resource: &str,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<StateRecord> {
        let mut records = self.records();
        let history = records.entry(resource.to_string()).or_default();
        let actual = history.last().map_or(0, |r| r.version);

        if actual != expected_version {
            return Err(Error::VersionConflict {
                resource: resource.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let record = StateRecord::next(
            resource,
            history.last().map(|r| r.version),
            payload,
            self.clock.now(),
        );
        history.push(record.clone());
        Ok(record)
    }

    fn rollback(&self, resource: &str, to_version: u64) -> Result<StateRecord> {
        let mut records = self.records();
        let no_such_version = || Error::NoSuchVersion {
            resource: resource.to_string(),
            version: to_version,
        };

        let history = records.get_mut(resource).ok_or_else(no_such_version)?;
        let target = history
            .iter()
            .find(|r| r.version == to_version)
            .cloned()
            .ok_or_else(no_such_version)?;
        let latest = history.last().cloned().ok_or_else(no_such_version)?;

        if latest.version == to_version {
            return Ok(latest);
        }

        let record = StateRecord::next(
            resource,
            Some(latest.version),
            target.payload,
            self.clock.now(),
        );
        history.push(record.clone());
        Ok(record)
    }

    fn history(&self, resource: &str) -> Result<Vec<StateRecord>> {
        Ok(self.records().get(resource).cloned().unwrap_or_default())
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        let mut latest: Vec<StateRecord> = self
            .records()
            .values()
            .filter_map(|history| history.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.resource_name.cmp(&b.resource_name));
        Ok(latest)
    }
}

impl LockBackend for MemoryStateStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Acquire> {
        let mut locks = self.locks();

        if let Some(current) = locks.get(key)
            && current.is_live(now)
        {
            return Ok(Acquire::Held(current.clone()));
        }

        let handle = LockHandle {
            resource_key: key.to_string(),
            holder_id: holder.to_string(),
            expires_at,
        };
        locks.insert(key.to_string(), handle.clone());
        Ok(Acquire::Acquired(handle))
    }

    fn current(&self, key: &str) -> Result<Option<LockHandle>> {
        Ok(self.locks().get(key).cloned())
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut locks = self.locks();
        if locks.get(key).is_some_and(|h| h.holder_id == holder) {
            locks.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn extend(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut locks = self.locks();
        match locks.get_mut(key) {
            Some(handle) if handle.holder_id == holder && handle.is_live(now) => {
                handle.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn force_release(&self, key: &str) -> Result<bool> {
        Ok(self.locks().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_requires_expected_version() {
        let store = MemoryStateStore::new();

        let first = store.put("vpc", 0, json!({"id": "vpc-1"})).unwrap();
        assert_eq!(first.version, 1);

        // A writer that read version 0 is now stale
        let err = store.put("vpc", 0, json!({"id": "vpc-2"})).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));

        let second = store.put("vpc", 1, json!({"id": "vpc-2"})).unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(store.get("vpc").unwrap().unwrap().payload["id"], "vpc-2");
    }

    #[test]
    fn test_get_missing_resource() {
        let store = MemoryStateStore::new();
        assert!(store.get("nothing").unwrap().is_none());
        assert!(store.history("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_rollback_appends_prior_payload() {
        let store = MemoryStateStore::new();
        store.put("db", 0, json!({"size": "small"})).unwrap();
        store.put("db", 1, json!({"size": "large"})).unwrap();

        let rolled = store.rollback("db", 1).unwrap();
        assert_eq!(rolled.version, 3);
        assert_eq!(rolled.payload["size"], "small");

        let history = store.history("db").unwrap();
        let versions: Vec<u64> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_rollback_to_latest_is_noop() {
        let store = MemoryStateStore::new();
        store.put("db", 0, json!({"size": "small"})).unwrap();

        let rolled = store.rollback("db", 1).unwrap();
        assert_eq!(rolled.version, 1);
        assert_eq!(store.history("db").unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_unknown_version() {
        let store = MemoryStateStore::new();
        store.put("db", 0, json!({})).unwrap();

        assert!(matches!(
            store.rollback("db", 7),
            Err(Error::NoSuchVersion { version: 7, .. })
        ));
        assert!(matches!(
            store.rollback("cache", 1),
            Err(Error::NoSuchVersion { .. })
        ));
    }

    #[test]
    fn test_list_returns_latest_sorted() {
        let store = MemoryStateStore::new();
        store.put("vpc", 0, json!({"v": 1})).unwrap();
        store.put("vpc", 1, json!({"v": 2})).unwrap();
        store.put("cache", 0, json!({"v": 1})).unwrap();

        let latest = store.list().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].resource_name, "cache");
        assert_eq!(latest[1].resource_name, "vpc");
        assert_eq!(latest[1].version, 2);
    }

    #[test]
    fn test_not_durable() {
        let store = MemoryStateStore::new();
        assert!(!store.is_durable());
        assert_eq!(store.backend_name(), "memory");
    }
}
