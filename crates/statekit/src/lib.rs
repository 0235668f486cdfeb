//! # Statekit
//!
//! Durable record of what is currently provisioned, and the locks that keep
//! concurrent runs from corrupting it.
//!
//! This crate provides:
//! - [`StateStore`]: versioned records with compare-and-swap writes,
//!   append-only history and rollback
//! - [`LockManager`]: expiring leases over a [`LockBackend`]
//! - [`SqliteStateStore`]: durable backend shared between processes
//! - [`MemoryStateStore`]: ephemeral fallback for local runs
//!
//! ## Example
//!
//! ```no_run
//! use statekit::{LockManager, StateBackend};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! let backend = StateBackend::open_or_ephemeral(Path::new("/var/lib/keel/state.db"), true)?;
//! let locks = LockManager::new(backend.locks.clone());
//!
//! let lease = locks.acquire("network", "run-42", Duration::from_secs(900))?;
//! let current = backend.store.get("vpc")?;
//! let expected = current.as_ref().map_or(0, |r| r.version);
//! backend.store.put("vpc", expected, serde_json::json!({"id": "vpc-0a1b"}))?;
//! locks.release(&lease)?;
//! # Ok::<(), statekit::Error>(())
//! ```

mod backend;
mod clock;
mod error;
mod lock;
mod memory;
mod sqlite;
mod types;

pub use backend::StateBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use lock::{Acquire, LockBackend, LockManager};
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;
pub use types::{LockHandle, StateRecord};

/// Versioned store of provisioning outputs keyed by resource name
///
/// Writes are compare-and-swap on the version: a writer that read version
/// `N` (or nothing, `0`) must write `N + 1` or fail with
/// [`Error::VersionConflict`].
pub trait StateStore: Send + Sync {
    /// Short backend name for reports ("sqlite", "memory")
    fn backend_name(&self) -> &'static str;

    /// Whether records survive the process
    fn is_durable(&self) -> bool;

    /// Latest record for a resource
    fn get(&self, resource: &str) -> Result<Option<StateRecord>>;

    /// Write the next version if the latest stored version equals `expected_version`
    ///
    /// Use `0` when no record has been read.
    fn put(
        &self,
        resource: &str,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<StateRecord>;

    /// Re-publish the payload of `to_version` as a new latest version
    ///
    /// Rolling back to the current version returns it unchanged.
    fn rollback(&self, resource: &str, to_version: u64) -> Result<StateRecord>;

    /// Every recorded version, oldest first
    fn history(&self, resource: &str) -> Result<Vec<StateRecord>>;

    /// Latest record of every resource, sorted by name
    fn list(&self) -> Result<Vec<StateRecord>>;
}
