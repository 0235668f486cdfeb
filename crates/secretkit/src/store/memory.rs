//! In-memory secret store.

use crate::error::Result;
use crate::store::SecretStore;
use crate::value::SecretValue;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Secret store backed by a map, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<String, SecretValue>>,
}

impl MemorySecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given secrets.
    pub fn with_secrets<I, K, V>(secrets: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SecretValue>,
    {
        let secrets = secrets
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            secrets: Mutex::new(secrets),
        }
    }

    fn secrets(&self) -> MutexGuard<'_, BTreeMap<String, SecretValue>> {
        self.secrets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SecretStore for MemorySecretStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(self.secrets().get(name).cloned())
    }

    fn put(&self, name: &str, value: &SecretValue) -> Result<()> {
        self.secrets().insert(name.to_string(), value.clone());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .secrets()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_overwrites() {
        let store = MemorySecretStore::new();
        store.put("DB_PASSWORD", &"one".into()).unwrap();
        store.put("DB_PASSWORD", &"two".into()).unwrap();

        assert_eq!(store.get("DB_PASSWORD").unwrap().unwrap().expose(), "two");
        assert!(store.get("MISSING").unwrap().is_none());
    }

    #[test]
    fn test_list_by_prefix() {
        let store = MemorySecretStore::with_secrets([
            ("prod/db", "a"),
            ("prod/cache", "b"),
            ("dev/db", "c"),
        ]);
        assert_eq!(store.list("prod/").unwrap(), vec!["prod/cache", "prod/db"]);
        assert_eq!(store.list("").unwrap().len(), 3);
    }
}
