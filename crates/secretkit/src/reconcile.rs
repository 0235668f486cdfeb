//! Propagates secrets from the store to their sinks.

use crate::audit::{self, SinkDrift};
use crate::error::{Error, Result};
use crate::mapping::{FailureKind, MappingOutcome, MappingResult, SecretMapping, SinkTarget, SkipKind};
use crate::sink::SecretSink;
use crate::store::SecretStore;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Default number of mappings written concurrently
pub const DEFAULT_JOBS: usize = 4;

/// Reads each mapped secret from the store and sets it on its sink.
///
/// Mappings are independent: one failure never stops the others.
pub struct Reconciler {
    store: Arc<dyn SecretStore>,
    sinks: BTreeMap<String, Arc<dyn SecretSink>>,
    jobs: usize,
}

impl Reconciler {
    /// Create a reconciler with no sinks.
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            sinks: BTreeMap::new(),
            jobs: DEFAULT_JOBS,
        }
    }

    /// Register a sink under its id.
    pub fn with_sink(mut self, sink: Arc<dyn SecretSink>) -> Self {
        self.sinks.insert(sink.id().to_string(), sink);
        self
    }

    /// Limit concurrent sink writes.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// The store mappings read from.
    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Registered sink ids, sorted.
    pub fn sink_ids(&self) -> Vec<&str> {
        self.sinks.keys().map(String::as_str).collect()
    }

    /// Check a mapping set before any side effect.
    ///
    /// Rejects empty names, unknown sinks, names a sink refuses and two
    /// mappings writing the same sink target.
    pub fn validate(&self, mappings: &[SecretMapping]) -> Result<()> {
        let mut seen: HashSet<&SinkTarget> = HashSet::new();
        for mapping in mappings {
            if mapping.source_name.trim().is_empty() {
                return Err(Error::InvalidMapping(format!(
                    "mapping to {} has an empty source name",
                    mapping.target
                )));
            }
            let Some(sink) = self.sinks.get(&mapping.target.sink) else {
                return Err(Error::UnknownSink(mapping.target.sink.clone()));
            };
            sink.validate_name(&mapping.target.name)
                .map_err(|e| Error::InvalidMapping(format!("{}: {e}", mapping.target)))?;
            if !seen.insert(&mapping.target) {
                return Err(Error::InvalidMapping(format!(
                    "{} is targeted by more than one mapping",
                    mapping.target
                )));
            }
        }
        Ok(())
    }

    /// Propagate every mapping; outcomes keep the input order.
    pub fn sync(&self, mappings: &[SecretMapping]) -> Vec<MappingOutcome> {
        self.run_all(mappings, |m| self.sync_one(m))
    }

    /// Resolve every mapping against the store without writing any sink.
    pub fn plan(&self, mappings: &[SecretMapping]) -> Vec<MappingOutcome> {
        self.run_all(mappings, |m| match self.resolve(m) {
            Resolved::Found(_) => MappingOutcome::skipped(m, SkipKind::DryRun),
            Resolved::Done(outcome) => outcome,
        })
    }

    /// Compare each sink's contents against the mappings that target it.
    pub fn audit(&self, mappings: &[SecretMapping]) -> Vec<SinkDrift> {
        audit::audit(&self.sinks, mappings)
    }

    fn run_all<F>(&self, mappings: &[SecretMapping], f: F) -> Vec<MappingOutcome>
    where
        F: Fn(&SecretMapping) -> MappingOutcome + Send + Sync,
    {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|i| format!("reconcile-{i}"))
            .build()
        {
            Ok(pool) => pool.install(|| mappings.par_iter().map(&f).collect()),
            Err(e) => {
                log::warn!("Failed to create thread pool, reconciling sequentially: {e}");
                mappings.iter().map(f).collect()
            }
        }
    }

    fn resolve(&self, mapping: &SecretMapping) -> Resolved {
        if !self.sinks.contains_key(&mapping.target.sink) {
            return Resolved::Done(MappingOutcome::failed(
                mapping,
                FailureKind::SinkError,
                Error::UnknownSink(mapping.target.sink.clone()).to_string(),
            ));
        }

        match self.store.get(&mapping.source_name) {
            Ok(Some(value)) => Resolved::Found(value),
            Ok(None) if mapping.required => {
                log::error!("Required secret '{}' is missing", mapping.source_name);
                Resolved::Done(MappingOutcome::failed(
                    mapping,
                    FailureKind::MissingSecret,
                    format!("secret '{}' not found in store", mapping.source_name),
                ))
            }
            Ok(None) => {
                log::info!("Optional secret '{}' not configured", mapping.source_name);
                Resolved::Done(MappingOutcome::skipped(mapping, SkipKind::NotConfigured))
            }
            Err(e) => {
                log::error!("Failed to read secret '{}': {e}", mapping.source_name);
                Resolved::Done(MappingOutcome::failed(
                    mapping,
                    FailureKind::StoreError,
                    e.to_string(),
                ))
            }
        }
    }

    fn sync_one(&self, mapping: &SecretMapping) -> MappingOutcome {
        let value = match self.resolve(mapping) {
            Resolved::Found(value) => value,
            Resolved::Done(outcome) => return outcome,
        };
        let Some(sink) = self.sinks.get(&mapping.target.sink) else {
            return MappingOutcome::failed(
                mapping,
                FailureKind::SinkError,
                Error::UnknownSink(mapping.target.sink.clone()).to_string(),
            );
        };

        match sink.set(&mapping.target.name, &value) {
            Ok(()) => {
                log::info!("Synced {} -> {}", mapping.source_name, mapping.target);
                MappingOutcome::new(mapping, MappingResult::Succeeded)
            }
            Err(e) => {
                log::error!("Failed to write {}: {e}", mapping.target);
                MappingOutcome::failed(mapping, FailureKind::SinkError, e.to_string())
            }
        }
    }
}

enum Resolved {
    Found(crate::value::SecretValue),
    Done(MappingOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::store::MemorySecretStore;

    fn setup(secrets: &[(&str, &str)]) -> (Arc<MemorySink>, Reconciler) {
        let store = Arc::new(MemorySecretStore::with_secrets(secrets.iter().copied()));
        let sink = Arc::new(MemorySink::new("github"));
        let reconciler = Reconciler::new(store).with_sink(sink.clone());
        (sink, reconciler)
    }

    #[test]
    fn test_failure_does_not_stop_other_mappings() {
        let (sink, reconciler) = setup(&[("b_token", "bbb"), ("c_token", "ccc")]);
        let mappings = vec![
            SecretMapping::new("a_token", "github", "A_TOKEN"),
            SecretMapping::new("b_token", "github", "B_TOKEN").optional(),
            SecretMapping::new("c_token", "github", "C_TOKEN"),
        ];

        let outcomes = reconciler.sync(&mappings);

        let results: Vec<_> = outcomes.iter().map(|o| o.result.clone()).collect();
        assert_eq!(
            results,
            vec![
                MappingResult::Failed(FailureKind::MissingSecret),
                MappingResult::Succeeded,
                MappingResult::Succeeded,
            ]
        );
        assert!(outcomes[0].is_failure());
        assert_eq!(sink.get("B_TOKEN").unwrap().expose(), "bbb");
        assert_eq!(sink.get("C_TOKEN").unwrap().expose(), "ccc");
    }

    #[test]
    fn test_optional_missing_is_not_configured() {
        let (sink, reconciler) = setup(&[]);
        let mappings = vec![SecretMapping::new("sentry", "github", "SENTRY_DSN").optional()];

        let outcomes = reconciler.sync(&mappings);
        assert_eq!(
            outcomes[0].result,
            MappingResult::Skipped(SkipKind::NotConfigured)
        );
        assert_eq!(sink.write_count(), 0);
    }

    #[test]
    fn test_sink_error_recorded() {
        let store = Arc::new(MemorySecretStore::with_secrets([("api", "key")]));
        let sink = Arc::new(MemorySink::new("github").rejecting("API_KEY"));
        let reconciler = Reconciler::new(store).with_sink(sink);

        let outcomes = reconciler.sync(&[SecretMapping::new("api", "github", "API_KEY")]);
        assert_eq!(outcomes[0].result, MappingResult::Failed(FailureKind::SinkError));
        assert!(outcomes[0].error.as_deref().unwrap().contains("refused"));
    }

    #[test]
    fn test_outcomes_never_contain_values() {
        let (_sink, reconciler) = setup(&[("db", "hunter2-super-secret")]);
        let outcomes = reconciler.sync(&[SecretMapping::new("db", "github", "DB")]);
        let json = serde_json::to_string(&outcomes).unwrap();
        assert!(!json.contains("hunter2-super-secret"));
    }

    #[test]
    fn test_plan_writes_nothing() {
        let (sink, reconciler) = setup(&[("db", "x")]);
        let mappings = vec![
            SecretMapping::new("db", "github", "DB"),
            SecretMapping::new("missing", "github", "MISSING"),
        ];

        let outcomes = reconciler.plan(&mappings);
        assert_eq!(outcomes[0].result, MappingResult::Skipped(SkipKind::DryRun));
        assert_eq!(
            outcomes[1].result,
            MappingResult::Failed(FailureKind::MissingSecret)
        );
        assert_eq!(sink.write_count(), 0);
    }

    #[test]
    fn test_rerun_overwrites_unconditionally() {
        let (sink, reconciler) = setup(&[("db", "x")]);
        let mappings = vec![SecretMapping::new("db", "github", "DB")];
        reconciler.sync(&mappings);
        reconciler.sync(&mappings);
        assert_eq!(sink.write_count(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_mappings() {
        let (_sink, reconciler) = setup(&[]);

        let unknown = [SecretMapping::new("a", "vault", "A")];
        assert!(matches!(
            reconciler.validate(&unknown),
            Err(Error::UnknownSink(_))
        ));

        let empty_source = [SecretMapping::new(" ", "github", "A")];
        assert!(matches!(
            reconciler.validate(&empty_source),
            Err(Error::InvalidMapping(_))
        ));

        let bad_name = [SecretMapping::new("a", "github", "HAS SPACE")];
        assert!(matches!(
            reconciler.validate(&bad_name),
            Err(Error::InvalidMapping(_))
        ));

        let duplicate = [
            SecretMapping::new("a", "github", "A"),
            SecretMapping::new("b", "github", "A"),
        ];
        assert!(matches!(
            reconciler.validate(&duplicate),
            Err(Error::InvalidMapping(_))
        ));

        let ok = [
            SecretMapping::new("a", "github", "A"),
            SecretMapping::new("a", "github", "B"),
        ];
        assert!(reconciler.validate(&ok).is_ok());
    }

    #[test]
    fn test_many_mappings_keep_order() {
        let secrets: Vec<(String, String)> =
            (0..20).map(|i| (format!("s{i}"), format!("v{i}"))).collect();
        let store = Arc::new(MemorySecretStore::with_secrets(secrets));
        let sink = Arc::new(MemorySink::new("runtime"));
        let reconciler = Reconciler::new(store).with_sink(sink).with_jobs(3);

        let mappings: Vec<_> = (0..20)
            .map(|i| SecretMapping::new(format!("s{i}"), "runtime", format!("S{i}")))
            .collect();
        let outcomes = reconciler.sync(&mappings);

        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.source, format!("s{i}"));
            assert!(outcome.is_success());
        }
    }
}
