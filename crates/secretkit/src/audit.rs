//! Drift detection between sinks and mappings.
//!
//! Compares each sink's secret names against the mappings that target it:
//! - Names present in the sink but not mapped (extra)
//! - Names mapped but absent from the sink (missing)

use crate::mapping::SecretMapping;
use crate::sink::SecretSink;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Drift for one sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkDrift {
    /// Sink identifier
    pub sink: String,
    /// In the sink, not mapped
    pub extra: Vec<String>,
    /// Mapped, not in the sink
    pub missing: Vec<String>,
    /// Set when the sink could not be listed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SinkDrift {
    /// Whether the sink matches its mappings.
    pub fn is_clean(&self) -> bool {
        self.extra.is_empty() && self.missing.is_empty() && self.error.is_none()
    }
}

/// Audit every sink against `mappings`.
pub(crate) fn audit(
    sinks: &BTreeMap<String, Arc<dyn SecretSink>>,
    mappings: &[SecretMapping],
) -> Vec<SinkDrift> {
    sinks
        .iter()
        .map(|(id, sink)| audit_sink(id, sink.as_ref(), mappings))
        .collect()
}

fn audit_sink(id: &str, sink: &dyn SecretSink, mappings: &[SecretMapping]) -> SinkDrift {
    let declared: BTreeSet<&str> = mappings
        .iter()
        .filter(|m| m.target.sink == id)
        .map(|m| m.target.name.as_str())
        .collect();

    let present = match sink.list() {
        Ok(names) => names,
        Err(e) => {
            log::warn!("Could not list sink '{id}': {e}");
            return SinkDrift {
                sink: id.to_string(),
                error: Some(e.to_string()),
                ..SinkDrift::default()
            };
        }
    };
    let present_set: BTreeSet<&str> = present.iter().map(String::as_str).collect();

    SinkDrift {
        sink: id.to_string(),
        extra: present_set
            .difference(&declared)
            .map(|s| (*s).to_string())
            .collect(),
        missing: declared
            .difference(&present_set)
            .map(|s| (*s).to_string())
            .collect(),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[test]
    fn test_extra_and_missing() {
        let sink: Arc<dyn SecretSink> =
            Arc::new(MemorySink::new("github").with_existing(["DB_URL", "LEGACY_TOKEN"]));
        let sinks = BTreeMap::from([("github".to_string(), sink)]);
        let mappings = vec![
            SecretMapping::new("db_url", "github", "DB_URL"),
            SecretMapping::new("api_key", "github", "API_KEY"),
            SecretMapping::new("other", "runtime", "OTHER"),
        ];

        let drift = audit(&sinks, &mappings);

        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].extra, vec!["LEGACY_TOKEN"]);
        assert_eq!(drift[0].missing, vec!["API_KEY"]);
        assert!(!drift[0].is_clean());
    }

    #[test]
    fn test_clean_sink() {
        let sink: Arc<dyn SecretSink> = Arc::new(MemorySink::new("runtime").with_existing(["A"]));
        let sinks = BTreeMap::from([("runtime".to_string(), sink)]);
        let drift = audit(&sinks, &[SecretMapping::new("a", "runtime", "A")]);
        assert!(drift[0].is_clean());
    }
}
