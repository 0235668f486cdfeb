//! `audit`: compare each sink's secret names against its mappings

use anyhow::Result;
use colored::Colorize;
use secretkit::SinkDrift;
use std::process::ExitCode;

use super::Workspace;
use crate::Context;
use crate::config;
use crate::error::EXIT_FAILURE;
use crate::orchestrator;
use crate::ui;

pub fn run(ctx: &Context) -> Result<ExitCode> {
    let workspace = Workspace::load(ctx)?;
    let store = config::build_store(&workspace.loaded);
    let sinks = config::build_sinks(&workspace.loaded)?;
    let drift = orchestrator::audit(store, &sinks, &workspace.mappings())?;

    ui::header(&format!("Sink audit · {}", workspace.settings.environment));
    for sink in &drift {
        print_drift(sink);
    }

    println!();
    if drift.iter().all(SinkDrift::is_clean) {
        ui::success("Every sink matches its mappings");
        Ok(ExitCode::SUCCESS)
    } else {
        ui::warn("Drift found");
        Ok(ExitCode::from(EXIT_FAILURE))
    }
}

fn print_drift(drift: &SinkDrift) {
    ui::section(&drift.sink);
    if let Some(error) = &drift.error {
        println!("  {} {}", "✗".red(), error);
        return;
    }
    if drift.is_clean() {
        println!("  {} in sync", "✓".green());
        return;
    }
    for name in &drift.missing {
        println!("  {} {name} {}", "-".red(), "(mapped, not in sink)".dimmed());
    }
    for name in &drift.extra {
        println!("  {} {name} {}", "+".yellow(), "(in sink, not mapped)".dimmed());
    }
}
