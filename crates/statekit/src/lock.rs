//! Expiring mutual-exclusion locks over a shared backend
//!
//! A lock is a lease: `acquire` succeeds when no live lease exists for the
//! key, either because none was ever taken or because the previous holder let
//! it lapse. Expired leases may be taken over by anyone, so a crashed holder
//! cannot wedge a key forever. The price is that exclusion is best-effort:
//! a holder that outlives its lease can be overtaken mid-operation, and
//! whatever it guards must be safe to re-run.

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::types::LockHandle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of an atomic acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now holds the lease
    Acquired(LockHandle),
    /// A live lease belongs to someone else
    Held(LockHandle),
}

/// Storage medium for lock leases
///
/// Every method must be atomic with respect to concurrent callers on the
/// same backend.
pub trait LockBackend: Send + Sync {
    /// Create the lease if absent, or overwrite it if the stored one expired at `now`
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Acquire>;

    /// Stored lease for a key, live or not
    fn current(&self, key: &str) -> Result<Option<LockHandle>>;

    /// Delete the lease if `holder` owns it. Returns whether it was deleted.
    fn release(&self, key: &str, holder: &str) -> Result<bool>;

    /// Push the expiry of a live lease owned by `holder`. Returns whether it was extended.
    fn extend(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete the lease regardless of holder. Returns whether one existed.
    fn force_release(&self, key: &str) -> Result<bool>;
}

/// Lease-based lock manager
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    /// Create a manager using wall-clock time
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit time source
    pub fn with_clock(backend: Arc<dyn LockBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Acquire the lock on `key` for `ttl`
    ///
    /// Fails with [`Error::LockHeld`] while another live lease exists,
    /// including one held by the same `holder`.
    pub fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<LockHandle> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl);

        match self.backend.try_acquire(key, holder, expires_at, now)? {
            Acquire::Acquired(handle) => {
                log::debug!("Acquired lock '{}' for {} until {}", key, holder, expires_at);
                Ok(handle)
            }
            Acquire::Held(current) => Err(Error::LockHeld {
                key: key.to_string(),
                holder: current.holder_id,
                expires_at: current.expires_at,
            }),
        }
    }

    /// Release a lease previously returned by [`acquire`](Self::acquire)
    pub fn release(&self, handle: &LockHandle) -> Result<()> {
        if self
            .backend
            .release(&handle.resource_key, &handle.holder_id)?
        {
            log::debug!(
                "Released lock '{}' held by {}",
                handle.resource_key,
                handle.holder_id
            );
            Ok(())
        } else {
            Err(Error::NotHeld {
                key: handle.resource_key.clone(),
                holder: handle.holder_id.clone(),
            })
        }
    }

    /// Extend a live lease by `ttl` from now
    ///
    /// Fails with [`Error::Expired`] when the lease lapsed or was taken over.
    pub fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<LockHandle> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl);

        if self
            .backend
            .extend(&handle.resource_key, &handle.holder_id, expires_at, now)?
        {
            Ok(LockHandle {
                expires_at,
                ..handle.clone()
            })
        } else {
            Err(Error::Expired {
                key: handle.resource_key.clone(),
                holder: handle.holder_id.clone(),
            })
        }
    }

    /// Live lease on `key`, if any
    pub fn status(&self, key: &str) -> Result<Option<LockHandle>> {
        let now = self.clock.now();
        Ok(self
            .backend
            .current(key)?
            .filter(|handle| handle.is_live(now)))
    }

    /// Remove whatever lease exists on `key`
    pub fn force_release(&self, key: &str) -> Result<bool> {
        let removed = self.backend.force_release(key)?;
        if removed {
            log::warn!("Force-released lock '{}'", key);
        }
        Ok(removed)
    }
}

/// `now + ttl`, saturating at the largest representable instant
fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
