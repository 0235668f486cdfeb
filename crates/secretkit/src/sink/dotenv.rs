//! Runtime environment injection through a dotenv file.

use crate::error::{Error, Result};
use crate::fsutil::write_private;
use crate::sink::SecretSink;
use crate::value::SecretValue;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Sink that maintains `NAME=value` lines in an env file.
///
/// Setting a name rewrites its line in place (or appends it), leaving
/// comments and other entries untouched. The file is only readable by its
/// owner.
pub struct DotenvSink {
    id: String,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DotenvSink {
    /// Create a sink writing to `path`.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the env file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Name defined by a dotenv line, if any
fn entry_name(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (name, _) = line.split_once('=')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote values that a dotenv parser would otherwise split or truncate.
fn encode(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.:/@+,%".contains(c));
    if plain {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '$' => out.push_str("\\$"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl SecretSink for DotenvSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn set(&self, name: &str, value: &SecretValue) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let content = self.read()?;
        let line = format!("{name}={}", encode(value.expose()));
        let mut replaced = false;
        let mut lines: Vec<String> = content
            .lines()
            .filter_map(|existing| {
                if entry_name(existing) != Some(name) {
                    return Some(existing.to_string());
                }
                if replaced {
                    None
                } else {
                    replaced = true;
                    Some(line.clone())
                }
            })
            .collect();
        if !replaced {
            lines.push(line);
        }

        let mut out = lines.join("\n");
        out.push('\n');
        write_private(&self.path, out.as_bytes())?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let content = self.read()?;
        let mut names: Vec<String> = content
            .lines()
            .filter_map(entry_name)
            .map(ToString::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if is_env_name(name) {
            Ok(())
        } else {
            Err(Error::InvalidName {
                name: name.to_string(),
                reason: "not a valid environment variable name".to_string(),
            })
        }
    }
}
