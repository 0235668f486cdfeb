//! Secret store driven by an external secrets-manager CLI.

use crate::error::{Error, Result};
use crate::process::{self, render};
use crate::store::SecretStore;
use crate::value::SecretValue;
use std::time::Duration;
use zeroize::Zeroize;

/// Phrases a `get` program prints when the secret does not exist
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "no such",
    "does not exist",
    "resourcenotfoundexception",
];

/// Secret store that shells out to configured programs.
///
/// - `get` prints the value on stdout; a failing exit whose stderr says the
///   secret does not exist means "absent"
/// - `put` receives the value on stdin
/// - `list` prints one name per line
///
/// Arguments may contain `{name}`, replaced by the secret name.
pub struct CommandSecretStore {
    get: Vec<String>,
    put: Option<Vec<String>>,
    list: Option<Vec<String>>,
    timeout: Duration,
}

impl CommandSecretStore {
    /// Create a store with a `get` command only (read-only).
    pub fn new(get: Vec<String>) -> Self {
        Self {
            get,
            put: None,
            list: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Set the command used to write secrets.
    pub fn with_put(mut self, put: Vec<String>) -> Self {
        self.put = Some(put);
        self
    }

    /// Set the command used to list secret names.
    pub fn with_list(mut self, list: Vec<String>) -> Self {
        self.list = Some(list);
        self
    }

    /// Set the time budget for each invocation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl SecretStore for CommandSecretStore {
    fn backend_name(&self) -> &'static str {
        "command"
    }

    fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        let argv = render(&self.get, name);
        let output = process::run(&argv, None, self.timeout)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lower = stderr.to_lowercase();
            if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
                return Ok(None);
            }
            return Err(Error::from_command_output(&argv[0], &stderr, None));
        }

        let mut value = match String::from_utf8(output.stdout) {
            Ok(value) => value,
            Err(e) => {
                e.into_bytes().zeroize();
                return Err(Error::CommandFailed {
                    program: argv[0].clone(),
                    stderr: format!("value for '{name}' is not valid UTF-8"),
                });
            }
        };
        if value.ends_with('\n') {
            value.pop();
            if value.ends_with('\r') {
                value.pop();
            }
        }
        let value = SecretValue::new(value);
        Ok(Some(value))
    }

    fn put(&self, name: &str, value: &SecretValue) -> Result<()> {
        let Some(put) = &self.put else {
            return Err(Error::ReadOnly {
                backend: "command".to_string(),
            });
        };

        let argv = render(put, name);
        let output = process::run(&argv, Some(value.expose().as_bytes()), self.timeout)?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::from_command_output(&argv[0], &stderr, Some(value)))
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let Some(list) = &self.list else {
            return Ok(Vec::new());
        };

        let argv = render(list, prefix);
        let output = process::run(&argv, None, self.timeout)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::from_command_output(&argv[0], &stderr, None));
        }

        let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && l.starts_with(prefix))
            .map(ToString::to_string)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into(), "sh".into(), "{name}".into()]
    }

    #[test]
    fn test_get_reads_stdout() {
        let store = CommandSecretStore::new(sh(r#"printf 'value-for-%s\n' "$1""#));
        let value = store.get("API_KEY").unwrap().unwrap();
        assert_eq!(value.expose(), "value-for-API_KEY");
    }

    #[test]
    fn test_get_not_found_is_none() {
        let store = CommandSecretStore::new(sh(r#"echo "secret $1 not found" >&2; exit 1"#));
        assert!(store.get("API_KEY").unwrap().is_none());
    }

    #[test]
    fn test_get_rejects_non_utf8_value() {
        let store = CommandSecretStore::new(sh(r"printf 'ab\377cd'"));
        let err = store.get("API_KEY").unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(err.to_string().contains("not valid UTF-8"));
        assert!(!err.to_string().contains("ab"));
    }

    #[test]
    fn test_get_failure_is_error() {
        let store = CommandSecretStore::new(sh("echo 'HTTP 403 forbidden' >&2; exit 1"));
        let err = store.get("API_KEY").unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
    }

    #[test]
    fn test_put_sends_value_on_stdin_and_scrubs_errors() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("written");
        let script = format!("cat > {}", out.display());
        let store = CommandSecretStore::new(sh("exit 1")).with_put(sh(&script));

        store.put("TOKEN", &"tok-123".into()).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "tok-123");

        let failing = CommandSecretStore::new(sh("exit 1"))
            .with_put(sh(r#"v=$(cat); echo "rejected $v" >&2; exit 1"#));
        let err = failing.put("TOKEN", &"tok-123".into()).unwrap_err();
        assert!(!err.to_string().contains("tok-123"));
    }

    #[test]
    fn test_put_without_command_is_read_only() {
        let store = CommandSecretStore::new(sh("exit 0"));
        assert!(matches!(
            store.put("X", &"y".into()).unwrap_err(),
            Error::ReadOnly { .. }
        ));
    }

    #[test]
    fn test_list_filters_prefix() {
        let store = CommandSecretStore::new(sh("exit 0"))
            .with_list(sh("printf 'prod_b\\nprod_a\\ndev_a\\n'"));
        assert_eq!(store.list("prod_").unwrap(), vec!["prod_a", "prod_b"]);
    }
}
