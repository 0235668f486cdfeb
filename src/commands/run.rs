//! `provision`, `sync-secrets` and `bootstrap`

use anyhow::Result;
use std::process::ExitCode;

use super::{Workspace, execute_options, print_report};
use crate::Context;
use crate::cli::RunArgs;
use crate::config;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::report::{RunCommand, RunReport};
use crate::progress::BarProgress;
use crate::ui;

pub fn run(ctx: &Context, command: RunCommand, args: RunArgs) -> Result<ExitCode> {
    let workspace = Workspace::load(ctx)?;
    let settings = workspace
        .settings
        .clone()
        .with_overrides(args.jobs, args.lock_ttl)?;

    if !ctx.quiet {
        ui::header(&format!("keel {command} · {}", settings.environment));
        if args.dry_run {
            ui::info("Dry run: no actions run and no sinks are written");
        }
    }

    let state = workspace.open_state()?;
    if let Some(reason) = &state.degraded {
        ui::warn(&format!("Degraded: {reason}"));
    }
    let secrets = config::build_store(&workspace.loaded);
    let sinks = config::build_sinks(&workspace.loaded)?;

    let orchestrator = Orchestrator::new(state, secrets)
        .with_options(execute_options(&settings, args.dry_run))
        .with_sinks(sinks)
        .with_reconcile_jobs(settings.reconcile_jobs)
        .with_environment(&settings.environment)
        .with_config_digest(&workspace.loaded.digest)
        .with_targets(args.targets);

    let mappings = workspace.mappings();
    let report = {
        let mut progress = BarProgress::new(ctx.quiet);
        match command {
            RunCommand::Bootstrap => orchestrator.bootstrap(
                workspace.nodes(),
                &mappings,
                &ctx.cancel,
                &mut progress,
            )?,
            RunCommand::Provision => {
                orchestrator.provision(workspace.nodes(), &ctx.cancel, &mut progress)?
            }
            RunCommand::SyncSecrets => orchestrator.sync_secrets(&mappings, &ctx.cancel)?,
        }
    };

    print_report(ctx, &report);
    persist(&report, &settings.reports_dir, args.report.as_deref())?;
    Ok(ExitCode::from(report.exit_code()))
}

/// Keep a copy under the reports dir; write `--report` when given
///
/// A failure to keep the copy only warns. A failure to write the requested
/// report is an error.
fn persist(
    report: &RunReport,
    reports_dir: &std::path::Path,
    requested: Option<&std::path::Path>,
) -> Result<()> {
    if !report.dry_run {
        match report.save_in(reports_dir) {
            Ok(path) => log::info!("Run report saved to {}", path.display()),
            Err(e) => ui::warn(&format!("Could not keep run report: {e:#}")),
        }
    }
    if let Some(path) = requested {
        report.write_to(path)?;
        ui::dim(&format!("Report written to {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::report::RunReportBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_persist_keeps_copy_and_requested_report() {
        let temp = TempDir::new().unwrap();
        let reports = temp.path().join("reports");
        let requested = temp.path().join("out/report.json");
        let report = RunReportBuilder::new(RunCommand::Provision, "staging").finish();

        persist(&report, &reports, Some(&requested)).unwrap();

        assert!(reports.join(format!("{}.json", report.run_id)).exists());
        let loaded: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&requested).unwrap()).unwrap();
        assert_eq!(loaded.run_id, report.run_id);
    }

    #[test]
    fn test_dry_run_reports_are_not_kept() {
        let temp = TempDir::new().unwrap();
        let reports = temp.path().join("reports");
        let report = RunReportBuilder::new(RunCommand::Bootstrap, "staging")
            .dry_run(true)
            .finish();

        persist(&report, &reports, None).unwrap();

        assert!(!reports.exists());
    }
}
