use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Provision infrastructure in dependency order and reconcile its secrets", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: <config dir>/keel.toml)
    #[arg(short, long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Environment to run against
    #[arg(short, long, global = true, env = "KEEL_ENVIRONMENT")]
    pub environment: Option<String>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision resources in dependency order
    Provision(RunArgs),

    /// Propagate secrets from the store to their sinks
    SyncSecrets(RunArgs),

    /// Provision resources, then propagate secrets (including resource outputs)
    Bootstrap(RunArgs),

    /// Validate the config, resource graph and secret mappings
    Validate,

    /// Inspect and roll back recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Inspect and release locks
    #[command(subcommand)]
    Lock(LockCommand),

    /// Compare sink contents against the declared mappings
    Audit,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Run arguments
// ============================================================================

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Validate and resolve everything without running actions or writing sinks
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Lock lease in seconds
    #[arg(long, value_name = "SECS")]
    pub lock_ttl: Option<u64>,

    /// Maximum resources provisioned concurrently
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Write the run report as JSON to this path
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Only these resources and their dependencies (repeatable)
    #[arg(short, long = "target", value_name = "RESOURCE")]
    pub targets: Vec<String>,
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// Latest recorded version of every resource
    List,

    /// Every recorded version of a resource
    History {
        /// Resource name
        resource: String,

        /// Print payloads as well
        #[arg(long)]
        payload: bool,
    },

    /// Re-publish an earlier version as the latest
    Rollback {
        /// Resource name
        resource: String,

        /// Version to restore
        #[arg(long = "to", value_name = "VERSION")]
        to_version: u64,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

// ============================================================================
// Lock Commands
// ============================================================================

#[derive(Subcommand)]
pub enum LockCommand {
    /// Show live leases for configured lock keys
    Status {
        /// Lock keys to check (default: every key in the config)
        keys: Vec<String>,
    },

    /// Break a lease held by another run
    Release {
        /// Lock key
        key: String,

        /// Release even though another holder owns the lease
        #[arg(long)]
        force: bool,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bootstrap_flags() {
        let cli = Cli::try_parse_from([
            "keel",
            "--environment",
            "staging",
            "bootstrap",
            "--dry-run",
            "--lock-ttl",
            "120",
            "--jobs",
            "2",
            "--report",
            "out.json",
            "-t",
            "database",
        ])
        .unwrap();
        assert_eq!(cli.environment.as_deref(), Some("staging"));
        let Command::Bootstrap(args) = cli.command else {
            panic!("expected bootstrap");
        };
        assert!(args.dry_run);
        assert_eq!(args.lock_ttl, Some(120));
        assert_eq!(args.jobs, Some(2));
        assert_eq!(args.report, Some(PathBuf::from("out.json")));
        assert_eq!(args.targets, vec!["database".to_string()]);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["keel", "sync-secrets", "-vv", "-e", "prod"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.environment.as_deref(), Some("prod"));
        assert!(matches!(cli.command, Command::SyncSecrets(_)));
    }

    #[test]
    fn test_force_release_flags() {
        let cli = Cli::try_parse_from(["keel", "lock", "release", "network", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Lock(LockCommand::Release { force: true, .. })
        ));
    }

    #[test]
    fn test_rollback_args() {
        let cli =
            Cli::try_parse_from(["keel", "state", "rollback", "database", "--to", "3", "-y"])
                .unwrap();
        let Command::State(StateCommand::Rollback {
            resource,
            to_version,
            yes,
        }) = cli.command
        else {
            panic!("expected rollback");
        };
        assert_eq!((resource.as_str(), to_version, yes), ("database", 3, true));
    }
}
