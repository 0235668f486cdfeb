//! `validate`: check config, graph and mappings without side effects

use anyhow::Result;
use std::path::Path;
use std::process::{Command, ExitCode, Stdio};

use super::Workspace;
use crate::Context;
use crate::config::{self, ResourceConfig};
use crate::orchestrator;
use crate::ui;

pub fn run(ctx: &Context) -> Result<ExitCode> {
    let workspace = Workspace::load(ctx)?;
    let sinks = config::build_sinks(&workspace.loaded)?;
    let graph = orchestrator::validate_plan(workspace.nodes(), &workspace.mappings(), &sinks)?;

    let settings = &workspace.settings;
    ui::header("Configuration");
    ui::kv("File", &workspace.loaded.path.display().to_string());
    ui::kv("Environment", &settings.environment);
    ui::kv("State", &settings.state_path.display().to_string());
    ui::kv("Jobs", &settings.jobs.to_string());
    ui::kv("Lock TTL", &format!("{}s", settings.lock_ttl.as_secs()));
    ui::kv(
        "Ephemeral fallback",
        if settings.allow_ephemeral_state {
            "allowed"
        } else {
            "refused"
        },
    );

    if !ctx.quiet {
        ui::section("Provisioning order");
        for (i, name) in graph.topological_order().iter().enumerate() {
            let deps = graph
                .node(name)
                .map(|n| n.depends_on.iter().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            if deps.is_empty() {
                println!("  {:>2}. {name}", i + 1);
            } else {
                println!("  {:>2}. {name} (after {deps})", i + 1);
            }
        }
    }

    let base = workspace.loaded.path.parent().unwrap_or(Path::new("."));
    let missing: Vec<String> = workspace
        .loaded
        .config
        .resources
        .iter()
        .filter_map(|resource| missing_program(&workspace, base, resource))
        .collect();
    for warning in &missing {
        ui::warn(warning);
    }

    println!();
    ui::success(&format!(
        "{} resources, {} mappings, {} sinks are valid",
        graph.len(),
        workspace.loaded.config.mappings.len(),
        sinks.len()
    ));
    Ok(ExitCode::SUCCESS)
}

/// Warn about a resource whose program cannot be found
fn missing_program(workspace: &Workspace, base: &Path, resource: &ResourceConfig) -> Option<String> {
    let program = resource.command.as_ref()?.first()?;
    let resolved = if program.contains(std::path::MAIN_SEPARATOR) {
        let cwd = resource
            .cwd
            .as_deref()
            .map_or_else(|| base.to_path_buf(), |cwd| workspace.loaded.resolve_path(cwd));
        cwd.join(program).display().to_string()
    } else {
        program.clone()
    };
    if command_exists(&resolved) {
        None
    } else {
        Some(format!(
            "Resource '{}': program '{program}' not found",
            resource.name
        ))
    }
}

/// Whether `cmd` names an existing path or a program on `PATH`
fn command_exists(cmd: &str) -> bool {
    if cmd.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(cmd).exists();
    }
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(command_exists("/bin/sh"));
        assert!(!command_exists("keel-no-such-program"));
        assert!(!command_exists("/nonexistent/keel"));
    }
}
