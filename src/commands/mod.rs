//! Command implementations

pub mod audit;
pub mod lock;
pub mod run;
pub mod state;
pub mod validate;

use anyhow::{Context as _, Result};
use provision::{ExecuteOptions, ResourceNode};
use statekit::StateBackend;

use crate::Context;
use crate::actions;
use crate::config::{KeelConfig, LoadedConfig, Settings};
use crate::orchestrator::BoundMapping;
use crate::orchestrator::report::{RunReport, RunStatus};
use crate::paths;
use crate::ui;

/// Lock key shared by resources that do not name a state resource
pub const GLOBAL_LOCK_KEY: &str = "global";

/// A loaded config with the settings for the selected environment
pub struct Workspace {
    pub loaded: LoadedConfig,
    pub settings: Settings,
}

impl Workspace {
    pub fn load(ctx: &Context) -> Result<Self> {
        let loaded = KeelConfig::load(ctx.config.as_deref())?;
        let state_dir = paths::state_dir()?;
        let settings = loaded
            .config
            .settings(ctx.environment.as_deref(), &state_dir)?;
        log::debug!(
            "Loaded {} (digest {}) for environment '{}'",
            loaded.path.display(),
            loaded.digest,
            settings.environment
        );
        Ok(Self { loaded, settings })
    }

    /// Open state for a run, falling back to memory where the environment allows it
    pub fn open_state(&self) -> Result<StateBackend> {
        StateBackend::open_or_ephemeral(
            &self.settings.state_path,
            self.settings.allow_ephemeral_state,
        )
        .with_context(|| format!("Cannot open state for '{}'", self.settings.environment))
    }

    /// Open the durable state only; operator commands never act on ephemeral state
    pub fn open_durable_state(&self) -> Result<StateBackend> {
        StateBackend::sqlite(&self.settings.state_path).with_context(|| {
            format!(
                "Cannot open state at {}",
                self.settings.state_path.display()
            )
        })
    }

    pub fn nodes(&self) -> Vec<ResourceNode> {
        actions::build_nodes(&self.loaded, &self.settings)
    }

    pub fn mappings(&self) -> Vec<BoundMapping> {
        self.loaded
            .config
            .mappings
            .iter()
            .map(BoundMapping::from)
            .collect()
    }

    /// Lock key guarding a resource's state
    pub fn lock_key_for(&self, resource: &str) -> String {
        self.loaded
            .config
            .resources
            .iter()
            .find(|r| r.name == resource)
            .and_then(|r| r.state.clone())
            .unwrap_or_else(|| GLOBAL_LOCK_KEY.to_string())
    }

    /// Every lock key the configured resources can take
    pub fn lock_keys(&self) -> Vec<String> {
        let mut keys = vec![GLOBAL_LOCK_KEY.to_string()];
        for resource in &self.loaded.config.resources {
            if let Some(state) = &resource.state
                && !keys.contains(state)
            {
                keys.push(state.clone());
            }
        }
        keys
    }
}

/// Executor options for one run
pub fn execute_options(settings: &Settings, dry_run: bool) -> ExecuteOptions {
    ExecuteOptions {
        jobs: settings.jobs,
        lock_ttl: settings.lock_ttl,
        global_lock_key: GLOBAL_LOCK_KEY.to_string(),
        holder_id: holder_id(&settings.environment, "run"),
        action_timeout: Some(settings.action_timeout),
        retry: settings.retry.clone(),
        dry_run,
    }
}

/// Lock holder identity for this process
pub fn holder_id(environment: &str, purpose: &str) -> String {
    format!("keel-{purpose}-{environment}-{}", std::process::id())
}

/// Ask before a destructive operation
fn confirm(prompt: &str) -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmed)
}

// ============================================================================
// Report output
// ============================================================================

/// Print the mapping lines and the run summary
pub fn print_report(ctx: &Context, report: &RunReport) {
    if !report.mappings.is_empty() && !ctx.quiet {
        ui::section("Secrets");
        for outcome in &report.mappings {
            println!("  {}", ui::mapping_line(outcome));
        }
    }

    let nodes = report.node_summary();
    let mappings = report.mapping_summary();
    ui::section("Summary");
    ui::kv("Run", &report.run_id);
    ui::kv(
        "Resources",
        &format!(
            "{} changed, {} unchanged, {} failed, {} skipped",
            nodes.changed, nodes.unchanged, nodes.failed, nodes.skipped
        ),
    );
    ui::kv(
        "Secrets",
        &format!(
            "{} synced, {} failed, {} warnings, {} skipped",
            mappings.succeeded, mappings.failed, mappings.warnings, mappings.skipped
        ),
    );
    ui::kv("Duration", &ui::format_duration(report.duration()));
    if let Some(node) = &report.aborted_by {
        ui::error(&format!("Aborted: critical resource '{node}' failed"));
    }
    if let Some(reason) = &report.degraded {
        ui::warn(&format!("Degraded: {reason}"));
    }

    println!();
    let status = format!("{}", report.status);
    match report.status {
        RunStatus::Succeeded => ui::success(&status),
        RunStatus::SucceededWithWarnings => ui::warn(&status),
        _ => ui::error(&status),
    }
}
