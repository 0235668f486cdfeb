//! Read-only store over process environment variables.

use crate::error::{Error, Result};
use crate::store::SecretStore;
use crate::value::SecretValue;
use std::collections::BTreeMap;

/// Default variable prefix
pub const DEFAULT_PREFIX: &str = "KEEL_SECRET_";

/// Secrets injected as `KEEL_SECRET_<NAME>` variables.
///
/// Names are matched case-insensitively with `-` and `.` read as `_`, so
/// `db-password` resolves `KEEL_SECRET_DB_PASSWORD`. Variables are captured
/// once at construction.
pub struct EnvSecretStore {
    vars: BTreeMap<String, SecretValue>,
}

impl EnvSecretStore {
    /// Capture matching variables from the current process.
    pub fn from_env() -> Self {
        Self::from_vars(DEFAULT_PREFIX, std::env::vars())
    }

    /// Capture matching variables from an explicit list.
    pub fn from_vars<I>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .filter(|name| !name.is_empty())
                    .map(|name| (normalize(name), SecretValue::new(value)))
            })
            .collect();
        Self { vars }
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '.' | '/' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

impl SecretStore for EnvSecretStore {
    fn backend_name(&self) -> &'static str {
        "env"
    }

    fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(self.vars.get(&normalize(name)).cloned())
    }

    fn put(&self, _name: &str, _value: &SecretValue) -> Result<()> {
        Err(Error::ReadOnly {
            backend: "env".to_string(),
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = normalize(prefix);
        Ok(self
            .vars
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }
}
