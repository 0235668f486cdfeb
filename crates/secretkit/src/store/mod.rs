//! Secret Store clients: the authoritative source of secret values.
//!
//! The [`SecretStore`] trait abstracts where secrets live, enabling:
//! - An external secrets manager driven through its CLI ([`CommandSecretStore`])
//! - A local JSON file for development ([`FileSecretStore`])
//! - Process environment injection in CI ([`EnvSecretStore`])
//! - In-memory stores for tests ([`MemorySecretStore`])

pub mod command;
pub mod env;
pub mod file;
pub mod memory;

pub use command::CommandSecretStore;
pub use env::EnvSecretStore;
pub use file::FileSecretStore;
pub use memory::MemorySecretStore;

use crate::error::Result;
use crate::value::SecretValue;

/// Source of truth for secret values.
pub trait SecretStore: Send + Sync {
    /// Short backend name for logs and reports.
    fn backend_name(&self) -> &'static str;

    /// Fetch a secret; `None` when it does not exist.
    fn get(&self, name: &str) -> Result<Option<SecretValue>>;

    /// Create or update a secret.
    ///
    /// Writing a name that already exists overwrites it; "already exists" is
    /// never an error.
    fn put(&self, name: &str, value: &SecretValue) -> Result<()>;

    /// Names of stored secrets starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
