//! `state list`, `state history` and `state rollback`

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use statekit::{LockManager, StateBackend, StateRecord};
use std::process::ExitCode;
use std::time::Duration;

use super::{Workspace, confirm, holder_id};
use crate::Context;
use crate::ui;

pub fn list(ctx: &Context) -> Result<ExitCode> {
    let workspace = Workspace::load(ctx)?;
    let state = workspace.open_durable_state()?;
    let records = state.store.list()?;

    ui::header(&format!("State · {}", workspace.settings.environment));
    if records.is_empty() {
        ui::dim("No resources recorded");
        return Ok(ExitCode::SUCCESS);
    }
    let width = records
        .iter()
        .map(|r| r.resource_name.len())
        .max()
        .unwrap_or(0);
    for record in &records {
        println!(
            "  {:<width$}  {}  {}",
            record.resource_name,
            format!("v{}", record.version).cyan(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn history(ctx: &Context, resource: &str, payload: bool) -> Result<ExitCode> {
    let workspace = Workspace::load(ctx)?;
    let state = workspace.open_durable_state()?;
    let records = state.store.history(resource)?;
    if records.is_empty() {
        bail!("No state recorded for '{resource}'");
    }

    ui::header(&format!("{resource} · {} versions", records.len()));
    for record in &records {
        print_record(record, payload)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn print_record(record: &StateRecord, payload: bool) -> Result<()> {
    println!(
        "  {}  {}",
        format!("v{}", record.version).cyan(),
        record.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
    );
    if payload {
        let json = serde_json::to_string_pretty(&record.payload)?;
        for line in json.lines() {
            println!("      {line}");
        }
    }
    Ok(())
}

pub fn rollback(ctx: &Context, resource: &str, to_version: u64, yes: bool) -> Result<ExitCode> {
    let workspace = Workspace::load(ctx)?;
    let state = workspace.open_durable_state()?;
    let current = state
        .store
        .get(resource)?
        .with_context(|| format!("No state recorded for '{resource}'"))?;

    if current.version == to_version {
        ui::info(&format!("'{resource}' is already at v{to_version}"));
        return Ok(ExitCode::SUCCESS);
    }

    ui::warn(&format!(
        "Roll back '{resource}' from v{} to the payload of v{to_version}",
        current.version
    ));
    ui::dim("A new version is appended; history is kept");
    if !yes && !confirm("Continue?")? {
        ui::info("Rollback cancelled");
        return Ok(ExitCode::SUCCESS);
    }

    let record = rollback_locked(
        &state,
        &workspace.lock_key_for(resource),
        &holder_id(&workspace.settings.environment, "rollback"),
        workspace.settings.lock_ttl,
        resource,
        to_version,
    )?;
    ui::success(&format!(
        "'{resource}' is now v{} (payload of v{to_version})",
        record.version
    ));
    Ok(ExitCode::SUCCESS)
}

/// Roll back while holding the resource's lock, so no run writes concurrently
fn rollback_locked(
    state: &StateBackend,
    lock_key: &str,
    holder: &str,
    ttl: Duration,
    resource: &str,
    to_version: u64,
) -> Result<StateRecord> {
    let locks = LockManager::new(state.locks.clone());
    let handle = locks
        .acquire(lock_key, holder, ttl)
        .with_context(|| format!("Cannot lock '{lock_key}' for rollback"))?;
    let result = state.store.rollback(resource, to_version);
    if let Err(e) = locks.release(&handle) {
        log::warn!("Failed to release lock '{lock_key}': {e}");
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend_with_history() -> StateBackend {
        let state = StateBackend::ephemeral("test");
        state.store.put("database", 0, json!({ "size": "small" })).unwrap();
        state.store.put("database", 1, json!({ "size": "large" })).unwrap();
        state
    }

    #[test]
    fn test_rollback_appends_version() {
        let state = backend_with_history();
        let record = rollback_locked(
            &state,
            "global",
            "tester",
            Duration::from_secs(60),
            "database",
            1,
        )
        .unwrap();

        assert_eq!(record.version, 3);
        assert_eq!(record.payload, json!({ "size": "small" }));
        assert_eq!(state.store.history("database").unwrap().len(), 3);

        let locks = LockManager::new(state.locks.clone());
        assert!(locks.status("global").unwrap().is_none());
    }

    #[test]
    fn test_rollback_refused_while_locked() {
        let state = backend_with_history();
        let locks = LockManager::new(state.locks.clone());
        locks
            .acquire("global", "other-run", Duration::from_secs(60))
            .unwrap();

        let err = rollback_locked(
            &state,
            "global",
            "tester",
            Duration::from_secs(60),
            "database",
            1,
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("other-run"));
        assert_eq!(state.store.get("database").unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_rollback_unknown_version_releases_lock() {
        let state = backend_with_history();
        let err = rollback_locked(
            &state,
            "global",
            "tester",
            Duration::from_secs(60),
            "database",
            9,
        )
        .unwrap_err();

        assert!(err.to_string().contains("no version 9"));
        let locks = LockManager::new(state.locks.clone());
        assert!(locks.status("global").unwrap().is_none());
    }
}
