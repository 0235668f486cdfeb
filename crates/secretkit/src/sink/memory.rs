//! In-memory sink for tests and dry inspection.

use crate::error::{Error, Result};
use crate::sink::SecretSink;
use crate::value::SecretValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

/// Sink that keeps values in a map and counts writes.
pub struct MemorySink {
    id: String,
    values: Mutex<BTreeMap<String, SecretValue>>,
    rejected: BTreeSet<String>,
    writes: Mutex<usize>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: Mutex::new(BTreeMap::new()),
            rejected: BTreeSet::new(),
            writes: Mutex::new(0),
        }
    }

    /// Pre-populate names, as if written by an earlier run.
    pub fn with_existing<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            for name in names {
                values.insert(name.into(), SecretValue::new(""));
            }
        }
        self
    }

    /// Make `set` fail for `name`.
    pub fn rejecting(mut self, name: impl Into<String>) -> Self {
        self.rejected.insert(name.into());
        self
    }

    /// Current value for `name`.
    pub fn get(&self, name: &str) -> Option<SecretValue> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecretSink for MemorySink {
    fn id(&self) -> &str {
        &self.id
    }

    fn set(&self, name: &str, value: &SecretValue) -> Result<()> {
        if self.rejected.contains(name) {
            return Err(Error::CommandFailed {
                program: self.id.clone(),
                stderr: format!("sink refused {name}"),
            });
        }
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.clone());
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}
