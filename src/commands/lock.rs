//! `lock status` and `lock release`

use anyhow::{Result, bail};
use chrono::Utc;
use colored::Colorize;
use statekit::{LockHandle, LockManager};
use std::process::ExitCode;

use super::{Workspace, confirm};
use crate::Context;
use crate::ui;

pub fn status(ctx: &Context, keys: Vec<String>) -> Result<ExitCode> {
    let workspace = Workspace::load(ctx)?;
    let state = workspace.open_durable_state()?;
    let locks = LockManager::new(state.locks.clone());
    let keys = if keys.is_empty() {
        workspace.lock_keys()
    } else {
        keys
    };

    ui::header(&format!("Locks · {}", workspace.settings.environment));
    let width = keys.iter().map(String::len).max().unwrap_or(0);
    for key in &keys {
        match locks.status(key)? {
            Some(handle) => println!("  {key:<width$}  {}", describe(&handle).yellow()),
            None => println!("  {key:<width$}  {}", "free".dimmed()),
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn release(ctx: &Context, key: &str, force: bool, yes: bool) -> Result<ExitCode> {
    if !force {
        bail!("Releasing another holder's lease needs --force");
    }
    let workspace = Workspace::load(ctx)?;
    let state = workspace.open_durable_state()?;
    let locks = LockManager::new(state.locks.clone());

    let Some(handle) = locks.status(key)? else {
        ui::info(&format!("Lock '{key}' is not held"));
        return Ok(ExitCode::SUCCESS);
    };
    ui::warn(&format!("Lock '{key}' is {}", describe(&handle)));
    ui::dim("Only break it if that run is gone; a live run would lose mutual exclusion");
    if !yes && !confirm("Release it?")? {
        ui::info("Release cancelled");
        return Ok(ExitCode::SUCCESS);
    }

    if locks.force_release(key)? {
        ui::success(&format!("Released lock '{key}'"));
    } else {
        ui::info(&format!("Lock '{key}' was already gone"));
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(handle: &LockHandle) -> String {
    let left = (handle.expires_at - Utc::now()).num_seconds().max(0);
    format!("held by {} ({left}s left)", handle.holder_id)
}
