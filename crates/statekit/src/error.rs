//! Error types for the statekit crate

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during state and lock operations
#[derive(Error, Debug)]
pub enum Error {
    /// A compare-and-swap write observed a different version than expected
    #[error("version conflict on '{resource}': expected version {expected}, found {actual}")]
    VersionConflict {
        resource: String,
        expected: u64,
        actual: u64,
    },

    /// Rollback target does not exist in the resource history
    #[error("no version {version} recorded for '{resource}'")]
    NoSuchVersion { resource: String, version: u64 },

    /// Another holder owns a live lease on the key
    #[error("lock '{key}' is held by {holder} until {expires_at}")]
    LockHeld {
        key: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// Release was attempted by a caller that does not own the lease
    #[error("lock '{key}' is not held by {holder}")]
    NotHeld { key: String, holder: String },

    /// Renewal was attempted after the lease lapsed or was stolen
    #[error("lock '{key}' held by {holder} has expired")]
    Expired { key: String, holder: String },

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization error
    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend could not be reached or is not usable
    #[error("state backend unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Whether the caller may retry the whole operation after re-reading state.
    ///
    /// The engine never retries these on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. } | Self::Expired { .. } | Self::VersionConflict { .. }
        )
    }

    /// Whether this error is a lock contention or lease problem
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. } | Self::NotHeld { .. } | Self::Expired { .. }
        )
    }
}

/// Result type for statekit operations
pub type Result<T> = std::result::Result<T, Error>;
