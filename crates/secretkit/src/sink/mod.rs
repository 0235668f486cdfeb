//! Secret Sink clients: consumers that receive secret values.
//!
//! Sinks accept unconditional "set" semantics; the reconciler never diffs
//! before writing.

pub mod command;
pub mod dotenv;
pub mod memory;

pub use command::CommandSink;
pub use dotenv::DotenvSink;
pub use memory::MemorySink;

use crate::error::{Error, Result};
use crate::value::SecretValue;

/// A destination for secret values.
pub trait SecretSink: Send + Sync {
    /// Identifier used by mappings to address this sink.
    fn id(&self) -> &str;

    /// Create or overwrite a secret.
    fn set(&self, name: &str, value: &SecretValue) -> Result<()>;

    /// Names currently present, for drift auditing only.
    fn list(&self) -> Result<Vec<String>>;

    /// Check that the sink accepts `name`.
    fn validate_name(&self, name: &str) -> Result<()> {
        check_basic_name(name)
    }
}

/// Names must be non-empty and free of whitespace and `=`.
pub(crate) fn check_basic_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }
    if name.chars().any(|c| c.is_whitespace() || c == '=') {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name contains whitespace or '='".to_string(),
        });
    }
    Ok(())
}
