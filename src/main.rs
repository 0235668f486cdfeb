mod actions;
mod cli;
mod commands;
mod config;
mod error;
mod orchestrator;
mod paths;
mod progress;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command, LockCommand, StateCommand};
use orchestrator::report::RunCommand;
use provision::CancelToken;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: Option<PathBuf>,
    pub environment: Option<String>,
    pub cancel: CancelToken,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
        environment: cli.environment,
        cancel: CancelToken::new(),
    };
    log::trace!("Verbosity {}", ctx.verbose);

    match dispatch(&ctx, cli.command) {
        Ok(code) => code,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            error::exit_code_for(&e)
        }
    }
}

fn dispatch(ctx: &Context, command: Command) -> Result<ExitCode> {
    match command {
        Command::Provision(args) => {
            watch_interrupt(&ctx.cancel);
            commands::run::run(ctx, RunCommand::Provision, args)
        }
        Command::SyncSecrets(args) => {
            watch_interrupt(&ctx.cancel);
            commands::run::run(ctx, RunCommand::SyncSecrets, args)
        }
        Command::Bootstrap(args) => {
            watch_interrupt(&ctx.cancel);
            commands::run::run(ctx, RunCommand::Bootstrap, args)
        }
        Command::Validate => commands::validate::run(ctx),
        Command::State(cmd) => match cmd {
            StateCommand::List => commands::state::list(ctx),
            StateCommand::History { resource, payload } => {
                commands::state::history(ctx, &resource, payload)
            }
            StateCommand::Rollback {
                resource,
                to_version,
                yes,
            } => commands::state::rollback(ctx, &resource, to_version, yes),
        },
        Command::Lock(cmd) => match cmd {
            LockCommand::Status { keys } => commands::lock::status(ctx, keys),
            LockCommand::Release { key, force, yes } => {
                commands::lock::release(ctx, &key, force, yes)
            }
        },
        Command::Audit => commands::audit::run(ctx),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "keel", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Cancel the run on the first Ctrl-C
///
/// Running nodes finish their current attempt; nothing new starts.
fn watch_interrupt(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let spawned = std::thread::Builder::new()
        .name("keel-signal".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::warn!("Ctrl-C handling unavailable: {e}");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                ui::warn("Interrupted: waiting for running resources to finish");
                cancel.cancel();
            }
        });
    if let Err(e) = spawned {
        log::warn!("Ctrl-C handling unavailable: {e}");
    }
}
