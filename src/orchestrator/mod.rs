//! Composes provisioning and secret reconciliation into one run
//!
//! A bootstrap provisions the resource graph first, publishes resource
//! outputs that mappings declare with `from`, then reconciles every mapping.
//! Both the graph and the mapping set are validated before anything runs.

pub mod outputs;
pub mod report;

use crate::config::{MappingConfig, OutputRef};
use crate::error::ValidationFailure;
use anyhow::{Context, Result};
use outputs::OutputOverlay;
use provision::{
    CancelToken, ExecuteOptions, GraphExecutor, ProgressCallback, ProvisionGraph, ResourceNode,
};
use report::{RunCommand, RunReport, RunReportBuilder};
use secretkit::{
    FailureKind, MappingOutcome, MemorySecretStore, Reconciler, SecretMapping, SecretSink,
    SecretStore, SecretValue, SinkDrift, SkipKind,
};
use statekit::{LockManager, StateBackend};
use std::collections::HashSet;
use std::sync::Arc;

/// A secret mapping, optionally fed by a resource output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundMapping {
    pub mapping: SecretMapping,
    pub from: Option<OutputRef>,
}

impl BoundMapping {
    pub fn new(mapping: SecretMapping) -> Self {
        Self {
            mapping,
            from: None,
        }
    }

    pub fn from_output(mut self, node: impl Into<String>, output: impl Into<String>) -> Self {
        self.from = Some(OutputRef {
            node: node.into(),
            output: output.into(),
        });
        self
    }
}

impl From<&MappingConfig> for BoundMapping {
    fn from(config: &MappingConfig) -> Self {
        let mapping = SecretMapping::new(&config.source, &config.sink, &config.name);
        Self {
            mapping: if config.required {
                mapping
            } else {
                mapping.optional()
            },
            from: config.from.clone(),
        }
    }
}

/// Top-level driver for `bootstrap`, `provision` and `sync-secrets`
pub struct Orchestrator {
    state: StateBackend,
    options: ExecuteOptions,
    secrets: Arc<dyn SecretStore>,
    sinks: Vec<Arc<dyn SecretSink>>,
    reconcile_jobs: usize,
    environment: String,
    config_digest: Option<String>,
    targets: Vec<String>,
}

impl Orchestrator {
    pub fn new(state: StateBackend, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            state,
            options: ExecuteOptions::default(),
            secrets,
            sinks: Vec::new(),
            reconcile_jobs: secretkit::DEFAULT_JOBS,
            environment: crate::config::DEFAULT_ENVIRONMENT.to_string(),
            config_digest: None,
            targets: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_sinks(mut self, sinks: impl IntoIterator<Item = Arc<dyn SecretSink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    pub fn with_reconcile_jobs(mut self, jobs: usize) -> Self {
        self.reconcile_jobs = jobs;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_config_digest(mut self, digest: impl Into<String>) -> Self {
        self.config_digest = Some(digest.into());
        self
    }

    /// Restrict provisioning to these resources and their dependencies
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    /// Provision the graph, publish outputs, then reconcile every mapping
    pub fn bootstrap<P: ProgressCallback>(
        &self,
        nodes: Vec<ResourceNode>,
        mappings: &[BoundMapping],
        cancel: &CancelToken,
        progress: &mut P,
    ) -> Result<RunReport> {
        let graph = ProvisionGraph::build(nodes).map_err(ValidationFailure::from)?;
        let overlay = Arc::new(OutputOverlay::new(self.secrets.clone()));
        let reconciler = self.reconciler(overlay.clone());
        validate_mappings(&reconciler, mappings, Some(&graph))?;
        let graph = self.select(graph)?;
        let selected: HashSet<String> = graph.nodes().iter().map(|n| n.name.clone()).collect();

        let mut builder = self.builder(RunCommand::Bootstrap);
        log::info!(
            "Bootstrap {} in '{}': {} resources, {} mappings",
            builder.run_id(),
            self.environment,
            graph.len(),
            mappings.len()
        );

        let graph_report = self
            .executor()
            .run_graph(graph, cancel, progress)
            .context("Provisioning failed to start")?;
        let cancelled = graph_report.cancelled || cancel.is_cancelled();
        let aborted_by = graph_report.aborted_by.clone();
        builder.record_graph(graph_report);

        if cancelled {
            log::warn!("Run cancelled; secrets were not reconciled");
            builder.mark_cancelled();
            builder.record_mappings(skip_all(mappings, &SkipKind::Cancelled));
            return Ok(builder.finish());
        }
        if let Some(node) = aborted_by {
            log::error!("Run aborted by critical resource '{node}'; secrets were not reconciled");
            builder.record_mappings(skip_all(mappings, &SkipKind::Aborted { node }));
            return Ok(builder.finish());
        }

        let outcomes = self.reconcile(&reconciler, &overlay, mappings, |node| {
            if !selected.contains(node) {
                None
            } else if self.options.dry_run {
                Some(SkipKind::DryRun)
            } else if builder.node_succeeded(node) {
                None
            } else {
                Some(SkipKind::UpstreamFailure {
                    node: node.to_string(),
                })
            }
        });
        builder.record_mappings(outcomes);
        Ok(builder.finish())
    }

    /// Provision the graph only
    pub fn provision<P: ProgressCallback>(
        &self,
        nodes: Vec<ResourceNode>,
        cancel: &CancelToken,
        progress: &mut P,
    ) -> Result<RunReport> {
        let graph = ProvisionGraph::build(nodes).map_err(ValidationFailure::from)?;
        let graph = self.select(graph)?;
        let mut builder = self.builder(RunCommand::Provision);
        let graph_report = self
            .executor()
            .run_graph(graph, cancel, progress)
            .context("Provisioning failed to start")?;
        builder.record_graph(graph_report);
        Ok(builder.finish())
    }

    /// Reconcile mappings against current state, without provisioning
    ///
    /// `from` outputs are read from the latest recorded state of their resource.
    pub fn sync_secrets(&self, mappings: &[BoundMapping], cancel: &CancelToken) -> Result<RunReport> {
        let overlay = Arc::new(OutputOverlay::new(self.secrets.clone()));
        let reconciler = self.reconciler(overlay.clone());
        validate_mappings(&reconciler, mappings, None)?;

        let mut builder = self.builder(RunCommand::SyncSecrets);
        if cancel.is_cancelled() {
            builder.mark_cancelled();
            builder.record_mappings(skip_all(mappings, &SkipKind::Cancelled));
            return Ok(builder.finish());
        }

        let outcomes = self.reconcile(&reconciler, &overlay, mappings, |_| None);
        builder.record_mappings(outcomes);
        Ok(builder.finish())
    }

    fn select(&self, graph: ProvisionGraph) -> Result<ProvisionGraph, ValidationFailure> {
        if self.targets.is_empty() {
            return Ok(graph);
        }
        let selected = graph.select(&self.targets)?;
        log::info!(
            "Selected {} of the declared resources for {}",
            selected.len(),
            self.targets.join(", ")
        );
        Ok(selected)
    }

    fn executor(&self) -> GraphExecutor {
        GraphExecutor::new(
            self.state.store.clone(),
            LockManager::new(self.state.locks.clone()),
            self.options.clone(),
        )
    }

    fn reconciler(&self, store: Arc<dyn SecretStore>) -> Reconciler {
        reconciler_for(store, &self.sinks).with_jobs(self.reconcile_jobs)
    }

    fn builder(&self, command: RunCommand) -> RunReportBuilder {
        RunReportBuilder::new(command, &self.environment)
            .dry_run(self.options.dry_run)
            .degraded(self.state.degraded.clone())
            .config_digest(self.config_digest.clone())
            .state_backend(self.state.store.backend_name())
    }

    /// Publish `from` outputs, then sync (or plan) whatever is left
    ///
    /// `gate` returns a skip reason for mappings whose producing node must
    /// not be read. Outcomes keep the order of `mappings`.
    fn reconcile<G>(
        &self,
        reconciler: &Reconciler,
        overlay: &OutputOverlay,
        mappings: &[BoundMapping],
        gate: G,
    ) -> Vec<MappingOutcome>
    where
        G: Fn(&str) -> Option<SkipKind>,
    {
        let mut outcomes: Vec<Option<MappingOutcome>> = mappings
            .iter()
            .map(|bound| {
                let from = bound.from.as_ref()?;
                if let Some(skip) = gate(&from.node) {
                    return Some(MappingOutcome::skipped(&bound.mapping, skip));
                }
                self.publish_output(overlay, &bound.mapping, from)
            })
            .collect();

        let pending: Vec<usize> = (0..mappings.len())
            .filter(|&i| outcomes[i].is_none())
            .collect();
        let batch: Vec<SecretMapping> = pending
            .iter()
            .map(|&i| mappings[i].mapping.clone())
            .collect();
        let results = if self.options.dry_run {
            reconciler.plan(&batch)
        } else {
            reconciler.sync(&batch)
        };
        for (i, outcome) in pending.into_iter().zip(results) {
            outcomes[i] = Some(outcome);
        }

        outcomes.into_iter().flatten().collect()
    }

    /// `None` when the value is in the overlay and the mapping can be synced
    fn publish_output(
        &self,
        overlay: &OutputOverlay,
        mapping: &SecretMapping,
        from: &OutputRef,
    ) -> Option<MappingOutcome> {
        let record = match self.state.store.get(&from.node) {
            Ok(record) => record,
            Err(e) => {
                return Some(MappingOutcome::failed(
                    mapping,
                    FailureKind::StoreError,
                    format!("failed to read state of '{}': {e}", from.node),
                ));
            }
        };

        let value = record
            .as_ref()
            .and_then(|r| outputs::extract(&r.payload, &from.output));
        let Some(value) = value else {
            let missing = format!("resource '{}' has no output '{}'", from.node, from.output);
            return Some(if mapping.required {
                log::error!("{missing}");
                MappingOutcome::failed(mapping, FailureKind::MissingSecret, missing)
            } else {
                log::info!("{missing}; optional mapping skipped");
                MappingOutcome::skipped(mapping, SkipKind::NotConfigured)
            });
        };

        if self.options.dry_run {
            return Some(MappingOutcome::skipped(mapping, SkipKind::DryRun));
        }

        let value = SecretValue::new(value);
        match overlay.publish(&mapping.source_name, &value) {
            Ok(()) => {
                log::debug!(
                    "Published {}.{} as '{}'",
                    from.node,
                    from.output,
                    mapping.source_name
                );
                None
            }
            Err(e) => Some(MappingOutcome::failed(
                mapping,
                FailureKind::StoreError,
                e.to_string(),
            )),
        }
    }
}

/// Validate a graph and its mappings without touching state, store or sinks
pub fn validate_plan(
    nodes: Vec<ResourceNode>,
    mappings: &[BoundMapping],
    sinks: &[Arc<dyn SecretSink>],
) -> Result<ProvisionGraph, ValidationFailure> {
    let graph = ProvisionGraph::build(nodes)?;
    let reconciler = reconciler_for(Arc::new(MemorySecretStore::new()), sinks);
    validate_mappings(&reconciler, mappings, Some(&graph))?;
    Ok(graph)
}

/// Drift between each sink and the mappings targeting it
pub fn audit(
    store: Arc<dyn SecretStore>,
    sinks: &[Arc<dyn SecretSink>],
    mappings: &[BoundMapping],
) -> Result<Vec<SinkDrift>, ValidationFailure> {
    let reconciler = reconciler_for(store, sinks);
    validate_mappings(&reconciler, mappings, None)?;
    let plain: Vec<SecretMapping> = mappings.iter().map(|b| b.mapping.clone()).collect();
    Ok(reconciler.audit(&plain))
}

fn reconciler_for(store: Arc<dyn SecretStore>, sinks: &[Arc<dyn SecretSink>]) -> Reconciler {
    sinks
        .iter()
        .fold(Reconciler::new(store), |r, sink| r.with_sink(sink.clone()))
}

fn validate_mappings(
    reconciler: &Reconciler,
    mappings: &[BoundMapping],
    graph: Option<&ProvisionGraph>,
) -> Result<(), ValidationFailure> {
    let plain: Vec<SecretMapping> = mappings.iter().map(|b| b.mapping.clone()).collect();
    reconciler
        .validate(&plain)
        .map_err(|e| ValidationFailure::Mapping(e.to_string()))?;

    if let Some(graph) = graph {
        for bound in mappings {
            if let Some(from) = &bound.from
                && graph.node(&from.node).is_none()
            {
                return Err(ValidationFailure::Mapping(format!(
                    "'{}' reads from unknown resource '{}'",
                    bound.mapping.source_name, from.node
                )));
            }
        }
    }
    Ok(())
}

fn skip_all(mappings: &[BoundMapping], kind: &SkipKind) -> Vec<MappingOutcome> {
    mappings
        .iter()
        .map(|b| MappingOutcome::skipped(&b.mapping, kind.clone()))
        .collect()
}
