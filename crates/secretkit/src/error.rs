//! Error types for secret stores and sinks.
//!
//! Errors are categorized so callers can decide whether a retry is worth it.
//! Messages built from external program output are scrubbed of the secret
//! value before they are stored.

use crate::value::{REDACTED, SecretValue};
use thiserror::Error;

/// Categories of secret backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or rate-limit issue (transient, retryable)
    Network,
    /// Authentication or permission problem
    Permission,
    /// A name or mapping is not acceptable
    Invalid,
    /// Backend program missing or misconfigured
    Unavailable,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Network connectivity issue",
            Self::Permission => "Permission denied",
            Self::Invalid => "Invalid name or mapping",
            Self::Unavailable => "Secret backend unavailable",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Network => "Check connectivity and try again",
            Self::Permission => "Check the backend credentials and their scopes",
            Self::Invalid => "Fix the mapping in the configuration file",
            Self::Unavailable => "Install the backend tool or fix its configured command",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors from secret stores, sinks and the reconciler.
#[derive(Debug, Error)]
pub enum Error {
    /// Network-related error (connection, timeout, rate limit)
    #[error("network error: {message}")]
    Network {
        /// Scrubbed error message
        message: String,
    },

    /// Credentials rejected or insufficient
    #[error("permission denied: {message}")]
    Permission {
        /// Scrubbed error message
        message: String,
    },

    /// The backend does not accept writes
    #[error("secret store '{backend}' is read-only")]
    ReadOnly {
        /// Backend name
        backend: String,
    },

    /// A sink rejected a secret name
    #[error("invalid secret name '{name}': {reason}")]
    InvalidName {
        /// Rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A mapping set failed validation
    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    /// A mapping references a sink that is not registered
    #[error("unknown sink '{0}'")]
    UnknownSink(String),

    /// The backend program could not be started
    #[error("failed to execute '{program}': {message}")]
    Spawn {
        /// Program that could not run
        program: String,
        /// Reason reported by the OS
        message: String,
    },

    /// The backend program ran past its time budget
    #[error("'{program}' timed out after {secs}s")]
    Timeout {
        /// Program that was killed
        program: String,
        /// Time budget
        secs: u64,
    },

    /// The backend program exited unsuccessfully
    #[error("'{program}' failed: {stderr}")]
    CommandFailed {
        /// Program that failed
        program: String,
        /// Scrubbed standard error
        stderr: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => ErrorCategory::Network,
            Self::Permission { .. } | Self::ReadOnly { .. } => ErrorCategory::Permission,
            Self::InvalidName { .. } | Self::InvalidMapping(_) | Self::UnknownSink(_) => {
                ErrorCategory::Invalid
            }
            Self::Spawn { .. } => ErrorCategory::Unavailable,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Create an error from a failed backend program.
    ///
    /// The secret value, when given, is removed from stderr before it is
    /// analyzed or stored.
    pub fn from_command_output(program: &str, stderr: &str, secret: Option<&SecretValue>) -> Self {
        let stderr = scrub(stderr.trim(), secret);
        let lower = stderr.to_lowercase();

        if lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("could not resolve")
            || lower.contains("temporarily unavailable")
            || lower.contains("http 502")
            || lower.contains("http 503")
        {
            return Self::Network { message: stderr };
        }

        if lower.contains("permission denied")
            || lower.contains("forbidden")
            || lower.contains("unauthorized")
            || lower.contains("http 401")
            || lower.contains("http 403")
            || lower.contains("authentication")
        {
            return Self::Permission { message: stderr };
        }

        Self::CommandFailed {
            program: program.to_string(),
            stderr,
        }
    }
}

/// Replace every occurrence of the secret in `text`.
pub fn scrub(text: &str, secret: Option<&SecretValue>) -> String {
    match secret {
        Some(value) if !value.is_empty() => text.replace(value.expose(), REDACTED),
        _ => text.to_string(),
    }
}

/// Result type for secret operations.
pub type Result<T> = std::result::Result<T, Error>;
