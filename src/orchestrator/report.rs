//! Structured record of one run

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use provision::{ExecuteSummary, GraphReport, NodeOutcome, NodeStatus};
use secretkit::MappingOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Which half (or both) of the engine a run exercised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunCommand {
    Bootstrap,
    Provision,
    SyncSecrets,
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bootstrap => "bootstrap",
            Self::Provision => "provision",
            Self::SyncSecrets => "sync-secrets",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Nothing required failed, but optional mappings failed or state was ephemeral
    SucceededWithWarnings,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededWithWarnings)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::SucceededWithWarnings => "succeeded with warnings",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Counts over a report's mapping outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
}

/// What happened during a run. Immutable once finished.
///
/// Holds names, statuses and error messages only; payloads and secret values
/// never enter a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub command: RunCommand,
    pub environment: String,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
    pub state_backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Planned execution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
    /// Node outcomes in the order they reached a terminal state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<String>,
    /// Mapping outcomes in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<MappingOutcome>,
}

impl RunReport {
    /// 0 on success (warnings included), 1 otherwise
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.status.is_success())
    }

    pub fn node_summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for outcome in &self.nodes {
            summary.add(outcome);
        }
        summary
    }

    pub fn mapping_summary(&self) -> MappingSummary {
        let mut summary = MappingSummary::default();
        for outcome in &self.mappings {
            if outcome.is_success() {
                summary.succeeded += 1;
            } else if outcome.is_failure() {
                summary.failed += 1;
            } else if outcome.is_warning() {
                summary.warnings += 1;
            } else {
                summary.skipped += 1;
            }
        }
        summary
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Write as pretty JSON, creating parent directories
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Persist under `dir` as `<run_id>.json`
    pub fn save_in(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.json", self.run_id));
        self.write_to(&path)?;
        Ok(path)
    }
}

/// Collects outcomes while a run is in progress
#[derive(Debug)]
pub struct RunReportBuilder {
    run_id: String,
    command: RunCommand,
    environment: String,
    dry_run: bool,
    degraded: Option<String>,
    config_digest: Option<String>,
    state_backend: String,
    started_at: DateTime<Utc>,
    order: Vec<String>,
    nodes: Vec<NodeOutcome>,
    aborted_by: Option<String>,
    cancelled: bool,
    mappings: Vec<MappingOutcome>,
}

impl RunReportBuilder {
    pub fn new(command: RunCommand, environment: impl Into<String>) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: new_run_id(started_at),
            command,
            environment: environment.into(),
            dry_run: false,
            degraded: None,
            config_digest: None,
            state_backend: String::new(),
            started_at,
            order: Vec::new(),
            nodes: Vec::new(),
            aborted_by: None,
            cancelled: false,
            mappings: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn degraded(mut self, reason: Option<String>) -> Self {
        self.degraded = reason;
        self
    }

    pub fn config_digest(mut self, digest: Option<String>) -> Self {
        self.config_digest = digest;
        self
    }

    pub fn state_backend(mut self, backend: impl Into<String>) -> Self {
        self.state_backend = backend.into();
        self
    }

    pub fn record_graph(&mut self, report: GraphReport) {
        self.order = report.order;
        self.nodes.extend(report.outcomes);
        if report.aborted_by.is_some() {
            self.aborted_by = report.aborted_by;
        }
        self.cancelled |= report.cancelled;
    }

    pub fn record_mappings(&mut self, outcomes: impl IntoIterator<Item = MappingOutcome>) {
        self.mappings.extend(outcomes);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Whether the given node finished successfully in this run
    pub fn node_succeeded(&self, name: &str) -> bool {
        self.nodes
            .iter()
            .any(|o| o.name == name && o.status == NodeStatus::Succeeded)
    }

    pub fn finish(self) -> RunReport {
        let status = self.status();
        RunReport {
            run_id: self.run_id,
            command: self.command,
            environment: self.environment,
            dry_run: self.dry_run,
            degraded: self.degraded,
            config_digest: self.config_digest,
            state_backend: self.state_backend,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            order: self.order,
            nodes: self.nodes,
            aborted_by: self.aborted_by,
            mappings: self.mappings,
        }
    }

    fn status(&self) -> RunStatus {
        if self.cancelled {
            return RunStatus::Cancelled;
        }
        let node_failed = self.nodes.iter().any(|o| o.status == NodeStatus::Failed);
        let mapping_failed = self.mappings.iter().any(MappingOutcome::is_failure);
        if node_failed || mapping_failed || self.aborted_by.is_some() {
            return RunStatus::Failed;
        }
        let warnings =
            self.degraded.is_some() || self.mappings.iter().any(MappingOutcome::is_warning);
        if warnings {
            RunStatus::SucceededWithWarnings
        } else {
            RunStatus::Succeeded
        }
    }
}

fn new_run_id(started_at: DateTime<Utc>) -> String {
    let seed = format!(
        "{}:{}:{:?}",
        started_at.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id(),
        std::thread::current().id()
    );
    let hash = blake3::hash(seed.as_bytes()).to_hex();
    format!("{}-{}", started_at.format("%Y%m%dT%H%M%SZ"), &hash.as_str()[..8])
}
