//! JSON file secret store for local development.

use crate::error::Result;
use crate::fsutil::write_private;
use crate::store::SecretStore;
use crate::value::SecretValue;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Secret store kept in a JSON object file (`{"NAME": "value"}`).
///
/// Every write rewrites the file atomically with owner-only permissions.
pub struct FileSecretStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    /// Use the file at `path`; it is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, SecretValue>> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SecretStore for FileSecretStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(self.load()?.remove(name))
    }

    fn put(&self, name: &str, value: &SecretValue) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut secrets = self.load()?;
        secrets.insert(name.to_string(), value.clone());

        let plain: BTreeMap<&str, &str> = secrets
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose()))
            .collect();
        let mut json = serde_json::to_vec_pretty(&plain)?;
        json.push(b'\n');
        write_private(&self.path, &json)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .load()?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secrets.json"));
        assert!(store.get("ANY").unwrap().is_none());
        assert!(store.list("").unwrap().is_empty());
    }

    #[test]
    fn test_put_persists_real_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let store = FileSecretStore::new(&path);

        store.put("DB_PASSWORD", &"s3cr3t".into()).unwrap();
        store.put("API_KEY", &"k".into()).unwrap();

        let reopened = FileSecretStore::new(&path);
        assert_eq!(reopened.get("DB_PASSWORD").unwrap().unwrap().expose(), "s3cr3t");
        assert_eq!(reopened.list("").unwrap(), vec!["API_KEY", "DB_PASSWORD"]);
        assert!(fs::read_to_string(&path).unwrap().contains("s3cr3t"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        fs::write(&path, "not json").unwrap();

        let store = FileSecretStore::new(&path);
        assert!(store.get("ANY").is_err());
    }
}
