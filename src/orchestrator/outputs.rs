//! Resource outputs feeding secret mappings

use secretkit::{Error, MemorySecretStore, Result, SecretStore, SecretValue};
use serde_json::Value;
use std::sync::Arc;

/// Look up a dotted path (`connection.url`, `replicas.0.host`) in a payload
///
/// Strings are returned as-is; other values as compact JSON. `null` counts as
/// absent.
pub fn extract(payload: &Value, path: &str) -> Option<String> {
    let mut current = payload;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// The configured store with freshly extracted outputs layered on top
///
/// Outputs are written through to the base store. A read-only base (such as
/// the environment store) keeps them in the overlay for this run only.
pub struct OutputOverlay {
    base: Arc<dyn SecretStore>,
    outputs: MemorySecretStore,
}

impl OutputOverlay {
    pub fn new(base: Arc<dyn SecretStore>) -> Self {
        Self {
            base,
            outputs: MemorySecretStore::new(),
        }
    }

    /// Publish an output under `name`
    pub fn publish(&self, name: &str, value: &SecretValue) -> Result<()> {
        match self.base.put(name, value) {
            Ok(()) => {}
            Err(Error::ReadOnly { backend }) => {
                log::info!(
                    "Secret store '{backend}' is read-only; '{name}' is kept for this run only"
                );
            }
            Err(e) => return Err(e),
        }
        self.outputs.put(name, value)
    }
}

impl SecretStore for OutputOverlay {
    fn backend_name(&self) -> &'static str {
        self.base.backend_name()
    }

    fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        match self.outputs.get(name)? {
            Some(value) => Ok(Some(value)),
            None => self.base.get(name),
        }
    }

    fn put(&self, name: &str, value: &SecretValue) -> Result<()> {
        self.publish(name, value)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = self.base.list(prefix)?;
        names.extend(self.outputs.list(prefix)?);
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secretkit::EnvSecretStore;
    use serde_json::json;

    #[test]
    fn test_extract_paths() {
        let payload = json!({
            "connection": { "url": "postgres://db:5432/app", "port": 5432 },
            "replicas": [{ "host": "r1" }, { "host": "r2" }],
            "tags": { "team": null },
        });
        assert_eq!(
            extract(&payload, "connection.url").as_deref(),
            Some("postgres://db:5432/app")
        );
        assert_eq!(extract(&payload, "connection.port").as_deref(), Some("5432"));
        assert_eq!(extract(&payload, "replicas.1.host").as_deref(), Some("r2"));
        assert_eq!(
            extract(&payload, "connection").as_deref(),
            Some(r#"{"port":5432,"url":"postgres://db:5432/app"}"#)
        );
        assert_eq!(extract(&payload, "replicas.9.host"), None);
        assert_eq!(extract(&payload, "tags.team"), None);
        assert_eq!(extract(&payload, "connection.url.scheme"), None);
    }

    #[test]
    fn test_publish_writes_through() {
        let base = Arc::new(MemorySecretStore::new());
        let overlay = OutputOverlay::new(base.clone());
        overlay.publish("db_url", &SecretValue::new("postgres://x")).unwrap();
        assert_eq!(base.get("db_url").unwrap().unwrap().expose(), "postgres://x");
        assert_eq!(overlay.get("db_url").unwrap().unwrap().expose(), "postgres://x");
    }

    #[test]
    fn test_read_only_base_keeps_value_in_overlay() {
        let base = Arc::new(EnvSecretStore::from_vars(
            "KEEL_SECRET_",
            vec![("KEEL_SECRET_API_KEY".to_string(), "k".to_string())],
        ));
        let overlay = OutputOverlay::new(base);
        overlay.publish("db_url", &SecretValue::new("postgres://x")).unwrap();
        assert_eq!(overlay.get("db_url").unwrap().unwrap().expose(), "postgres://x");
        assert_eq!(overlay.get("api_key").unwrap().unwrap().expose(), "k");
    }
}
