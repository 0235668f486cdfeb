//! Backend selection with ephemeral fallback

use crate::error::{Error, Result};
use crate::lock::LockBackend;
use crate::memory::MemoryStateStore;
use crate::sqlite::SqliteStateStore;
use crate::StateStore;
use std::path::Path;
use std::sync::Arc;

/// A state store paired with the lock backend sharing its medium
#[derive(Clone)]
pub struct StateBackend {
    /// Versioned record store
    pub store: Arc<dyn StateStore>,
    /// Lease storage for the lock manager
    pub locks: Arc<dyn LockBackend>,
    /// Why the durable backend was not used, when it was not
    pub degraded: Option<String>,
}

impl StateBackend {
    /// Open the durable SQLite backend
    pub fn sqlite(path: &Path) -> Result<Self> {
        let store = Arc::new(SqliteStateStore::open(path)?);
        Ok(Self {
            store: store.clone(),
            locks: store,
            degraded: None,
        })
    }

    /// In-process backend that forgets everything on exit
    pub fn ephemeral(reason: impl Into<String>) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        Self {
            store: store.clone(),
            locks: store,
            degraded: Some(reason.into()),
        }
    }

    /// Open the durable backend, falling back to memory when allowed
    ///
    /// A fallback run is marked degraded: its state is not authoritative and
    /// its locks exclude nobody outside this process.
    pub fn open_or_ephemeral(path: &Path, allow_ephemeral: bool) -> Result<Self> {
        match Self::sqlite(path) {
            Ok(backend) => Ok(backend),
            Err(e) if allow_ephemeral => {
                log::warn!(
                    "State backend at {} unavailable ({}), using ephemeral state",
                    path.display(),
                    e
                );
                Ok(Self::ephemeral(format!(
                    "state backend at {} unavailable: {e}; results are not authoritative",
                    path.display()
                )))
            }
            Err(e) => Err(Error::Unavailable(format!("{}: {e}", path.display()))),
        }
    }

    /// Whether this run's state is non-authoritative
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_opens_sqlite_when_possible() {
        let dir = TempDir::new().unwrap();
        let backend = StateBackend::open_or_ephemeral(&dir.path().join("s.db"), true).unwrap();
        assert!(!backend.is_degraded());
        assert_eq!(backend.store.backend_name(), "sqlite");
    }

    #[test]
    fn test_falls_back_when_unreachable() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened as a database file
        let backend = StateBackend::open_or_ephemeral(dir.path(), true).unwrap();
        assert!(backend.is_degraded());
        assert_eq!(backend.store.backend_name(), "memory");
        assert!(backend.degraded.unwrap().contains("not authoritative"));
    }

    #[test]
    fn test_refuses_fallback_when_disallowed() {
        let dir = TempDir::new().unwrap();
        let result = StateBackend::open_or_ephemeral(dir.path(), false);
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }
}
