//! keel.toml: settings, state, secrets, sinks, resources and mappings
//!
//! ```toml
//! environment = "staging"
//! jobs = 4
//! lock_ttl_secs = 900
//!
//! [environments.production]
//! jobs = 2
//! allow_ephemeral_state = false
//!
//! [secrets.store]
//! type = "command"
//! get = ["vault", "kv", "get", "-field=value", "secret/{name}"]
//!
//! [[sinks]]
//! id = "github"
//! type = "github"
//! repo = "acme/api"
//!
//! [[resources]]
//! name = "database"
//! depends_on = ["vpc"]
//! command = ["./infra/database.sh"]
//!
//! [[mappings]]
//! source = "database_url"
//! sink = "github"
//! name = "DATABASE_URL"
//! from = { node = "database", output = "connection.url" }
//! ```

use crate::error::ValidationFailure;
use crate::paths;
use anyhow::{Context, Result};
use provision::RetryConfig;
use regex::Regex;
use secretkit::{
    CommandSecretStore, CommandSink, DotenvSink, EnvSecretStore, FileSecretStore,
    MemorySecretStore, SecretSink, SecretStore,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment used when neither the CLI nor the file names one
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// The only environment that refuses ephemeral state by default
pub const PRODUCTION: &str = "production";

const DEFAULT_JOBS: usize = 4;
const DEFAULT_LOCK_TTL_SECS: u64 = 900;
const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const MAX_JOBS: usize = 64;
const MAX_RETRIES: u32 = 10;
const ENVIRONMENT_PLACEHOLDER: &str = "{environment}";

const NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]*$";

// ============================================================================
// Schema
// ============================================================================

/// Root of keel.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    /// Environment to run against when `--environment` is not given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    #[serde(flatten)]
    pub tunables: Tunables,

    /// Per-environment overrides of the top-level tunables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, Tunables>,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sinks: Vec<SinkConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<MappingConfig>,
}

/// Knobs that can be set globally and overridden per environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_ephemeral_state: Option<bool>,
}

impl Tunables {
    /// Fields set in `over` win
    fn merged(&self, over: Option<&Self>) -> Self {
        let Some(over) = over else {
            return self.clone();
        };
        Self {
            jobs: over.jobs.or(self.jobs),
            lock_ttl_secs: over.lock_ttl_secs.or(self.lock_ttl_secs),
            action_timeout_secs: over.action_timeout_secs.or(self.action_timeout_secs),
            max_retries: over.max_retries.or(self.max_retries),
            retry_delay_secs: over.retry_delay_secs.or(self.retry_delay_secs),
            allow_ephemeral_state: over.allow_ephemeral_state.or(self.allow_ephemeral_state),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// SQLite database path; `{environment}` is substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub store: StoreConfig,

    /// Concurrent sink writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
}

/// Authoritative secret store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// `KEEL_SECRET_<NAME>` variables (read-only)
    Env {
        #[serde(default = "default_env_prefix")]
        prefix: String,
    },
    /// JSON map on disk
    File { path: String },
    /// External programs; `{name}` is substituted in every argument
    Command {
        get: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        put: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        list: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// In-process only; useful for dry runs and demos
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Env {
            prefix: default_env_prefix(),
        }
    }
}

fn default_env_prefix() -> String {
    secretkit::store::env::DEFAULT_PREFIX.to_string()
}

/// A consumer of secret material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: SinkKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkKind {
    /// Repository secrets through the `gh` CLI
    Github { repo: String },
    /// Arbitrary program reading the value on stdin
    Command {
        set: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        list: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name_pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// `NAME=value` env file injected at runtime
    Dotenv { path: String },
}

/// How a command resource's stdout becomes its payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// One provisionable resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Lock key of the state resource this node mutates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// A failure here or upstream aborts the run
    #[serde(default)]
    pub critical: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Program and arguments that converge the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub output: OutputFormat,

    /// Known payload, used instead of a command
    #[serde(
        default,
        rename = "static",
        skip_serializing_if = "Option::is_none"
    )]
    pub static_payload: Option<serde_json::Value>,
}

/// Where a secret comes from and where it goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub source: String,
    pub sink: String,
    pub name: String,

    #[serde(default = "default_true")]
    pub required: bool,

    /// Fill `source` from a resource's output before reconciling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<OutputRef>,
}

fn default_true() -> bool {
    true
}

/// Dotted path into a resource's latest payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: String,
    pub output: String,
}

// ============================================================================
// Loading
// ============================================================================

/// A parsed config file with what reports need to identify it
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: KeelConfig,
    pub path: PathBuf,
    /// BLAKE3 of the file contents
    pub digest: String,
}

impl LoadedConfig {
    /// Resolve a configured path: `~` and variables expanded, relative
    /// paths taken from the config file's directory
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = paths::expand(raw);
        if expanded.is_absolute() {
            return expanded;
        }
        self.path
            .parent()
            .map_or_else(|| expanded.clone(), |dir| dir.join(&expanded))
    }
}

impl KeelConfig {
    /// Load a config file, or the default `keel.toml`
    pub fn load(path: Option<&Path>) -> Result<LoadedConfig> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => paths::config_file()?,
        };
        if !path.exists() {
            return Err(ValidationFailure::config(format!(
                "{} not found (pass --config or set {})",
                path.display(),
                paths::ENV_CONFIG_DIR
            ))
            .into());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        log::debug!(
            "Loaded {} ({} resources, {} mappings)",
            path.display(),
            config.resources.len(),
            config.mappings.len()
        );

        Ok(LoadedConfig {
            digest: blake3::hash(content.as_bytes()).to_hex().to_string(),
            config,
            path,
        })
    }

    /// Parse TOML and validate the result
    pub fn parse(content: &str) -> Result<Self, ValidationFailure> {
        let config: Self =
            toml::from_str(content).map_err(|e| ValidationFailure::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field before anything uses it
    pub fn validate(&self) -> Result<(), ValidationFailure> {
        let names = Regex::new(NAME_PATTERN).map_err(|e| ValidationFailure::config(e.to_string()))?;

        if let Some(env) = &self.environment {
            check_name(&names, "environment", env)?;
        }
        check_tunables("top level", &self.tunables)?;
        for (env, tunables) in &self.environments {
            check_name(&names, "environment", env)?;
            check_tunables(&format!("[environments.{env}]"), tunables)?;
        }
        if let Some(jobs) = self.secrets.jobs
            && !(1..=MAX_JOBS).contains(&jobs)
        {
            return Err(ValidationFailure::config(format!(
                "secrets.jobs must be between 1 and {MAX_JOBS}"
            )));
        }

        self.validate_store()?;
        self.validate_sinks(&names)?;
        self.validate_resources(&names)?;
        self.validate_mappings()
    }

    fn validate_store(&self) -> Result<(), ValidationFailure> {
        match &self.secrets.store {
            StoreConfig::File { path } if path.trim().is_empty() => Err(
                ValidationFailure::config("secrets.store.path must not be empty"),
            ),
            StoreConfig::Command { get, put, list, .. } => {
                check_argv("secrets.store.get", get)?;
                if let Some(put) = put {
                    check_argv("secrets.store.put", put)?;
                }
                if let Some(list) = list {
                    check_argv("secrets.store.list", list)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn validate_sinks(&self, names: &Regex) -> Result<(), ValidationFailure> {
        let mut seen = HashSet::new();
        for sink in &self.sinks {
            check_name(names, "sink id", &sink.id)?;
            if !seen.insert(sink.id.as_str()) {
                return Err(ValidationFailure::config(format!(
                    "sink '{}' is declared twice",
                    sink.id
                )));
            }
            let field = |f: &str| format!("sink '{}' {f}", sink.id);
            match &sink.kind {
                SinkKind::Github { repo } => {
                    if repo.split('/').filter(|p| !p.is_empty()).count() != 2 {
                        return Err(ValidationFailure::config(format!(
                            "{} must look like owner/name, got '{repo}'",
                            field("repo")
                        )));
                    }
                }
                SinkKind::Command {
                    set,
                    list,
                    name_pattern,
                    ..
                } => {
                    check_argv(&field("set"), set)?;
                    if let Some(list) = list {
                        check_argv(&field("list"), list)?;
                    }
                    if let Some(pattern) = name_pattern {
                        Regex::new(pattern).map_err(|e| {
                            ValidationFailure::config(format!("{}: {e}", field("name_pattern")))
                        })?;
                    }
                }
                SinkKind::Dotenv { path } => {
                    if path.trim().is_empty() {
                        return Err(ValidationFailure::config(format!(
                            "{} must not be empty",
                            field("path")
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_resources(&self, names: &Regex) -> Result<(), ValidationFailure> {
        for resource in &self.resources {
            check_name(names, "resource name", &resource.name)?;
            if let Some(state) = &resource.state {
                check_name(names, "state resource", state)?;
            }
            match (&resource.command, &resource.static_payload) {
                (Some(argv), None) => {
                    check_argv(&format!("resource '{}' command", resource.name), argv)?;
                }
                (None, Some(_)) => {}
                _ => {
                    return Err(ValidationFailure::config(format!(
                        "resource '{}' needs exactly one of `command` or `static`",
                        resource.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_mappings(&self) -> Result<(), ValidationFailure> {
        let resources: HashSet<&str> = self.resources.iter().map(|r| r.name.as_str()).collect();
        for mapping in &self.mappings {
            if let Some(from) = &mapping.from {
                if !resources.contains(from.node.as_str()) {
                    return Err(ValidationFailure::Mapping(format!(
                        "'{}' reads from unknown resource '{}'",
                        mapping.source, from.node
                    )));
                }
                if from.output.split('.').any(str::is_empty) {
                    return Err(ValidationFailure::Mapping(format!(
                        "'{}' has a malformed output path '{}'",
                        mapping.source, from.output
                    )));
                }
            }
        }
        Ok(())
    }

    /// Effective settings for one environment
    ///
    /// `environment` (from the CLI) wins over the file's `environment`.
    pub fn settings(
        &self,
        environment: Option<&str>,
        state_dir: &Path,
    ) -> Result<Settings, ValidationFailure> {
        let environment = environment
            .or(self.environment.as_deref())
            .unwrap_or(DEFAULT_ENVIRONMENT)
            .to_string();
        let names = Regex::new(NAME_PATTERN).map_err(|e| ValidationFailure::config(e.to_string()))?;
        check_name(&names, "environment", &environment)?;

        let tunables = self.tunables.merged(self.environments.get(&environment));
        let retry = RetryConfig {
            max_attempts: tunables.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay: Duration::from_secs(
                tunables.retry_delay_secs.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
            ),
            ..RetryConfig::default()
        };
        let state_path = match &self.state.path {
            Some(p) => paths::expand(&p.replace(ENVIRONMENT_PLACEHOLDER, &environment)),
            None => paths::state_db(state_dir, &environment),
        };

        Ok(Settings {
            jobs: tunables.jobs.unwrap_or(DEFAULT_JOBS),
            lock_ttl: Duration::from_secs(tunables.lock_ttl_secs.unwrap_or(DEFAULT_LOCK_TTL_SECS)),
            action_timeout: Duration::from_secs(
                tunables
                    .action_timeout_secs
                    .unwrap_or(DEFAULT_ACTION_TIMEOUT_SECS),
            ),
            retry,
            allow_ephemeral_state: tunables
                .allow_ephemeral_state
                .unwrap_or(environment != PRODUCTION),
            reconcile_jobs: self.secrets.jobs.unwrap_or(secretkit::DEFAULT_JOBS),
            reports_dir: paths::reports_dir(state_dir, &environment),
            state_path,
            environment,
        })
    }
}

fn check_name(pattern: &Regex, what: &str, name: &str) -> Result<(), ValidationFailure> {
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(ValidationFailure::config(format!(
            "{what} '{name}' must match {NAME_PATTERN}"
        )))
    }
}

fn check_argv(what: &str, argv: &[String]) -> Result<(), ValidationFailure> {
    match argv.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(ValidationFailure::config(format!(
            "{what} must name a program"
        ))),
    }
}

fn check_tunables(scope: &str, t: &Tunables) -> Result<(), ValidationFailure> {
    let fail = |msg: String| Err(ValidationFailure::config(format!("{scope}: {msg}")));
    if let Some(jobs) = t.jobs
        && !(1..=MAX_JOBS).contains(&jobs)
    {
        return fail(format!("jobs must be between 1 and {MAX_JOBS}"));
    }
    if t.lock_ttl_secs == Some(0) {
        return fail("lock_ttl_secs must be at least 1".into());
    }
    if t.action_timeout_secs == Some(0) {
        return fail("action_timeout_secs must be at least 1".into());
    }
    if let Some(n) = t.max_retries
        && !(1..=MAX_RETRIES).contains(&n)
    {
        return fail(format!("max_retries must be between 1 and {MAX_RETRIES}"));
    }
    if let Some(delay) = t.retry_delay_secs
        && delay > 3600
    {
        return fail("retry_delay_secs must be at most 3600".into());
    }
    Ok(())
}

// ============================================================================
// Effective settings
// ============================================================================

/// Settings for one run after merging defaults, file and overrides
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: String,
    pub jobs: usize,
    pub lock_ttl: Duration,
    pub action_timeout: Duration,
    pub retry: RetryConfig,
    pub allow_ephemeral_state: bool,
    pub reconcile_jobs: usize,
    pub state_path: PathBuf,
    pub reports_dir: PathBuf,
}

impl Settings {
    /// Apply `--jobs` and `--lock-ttl`
    pub fn with_overrides(
        mut self,
        jobs: Option<usize>,
        lock_ttl_secs: Option<u64>,
    ) -> Result<Self, ValidationFailure> {
        let cli = Tunables {
            jobs,
            lock_ttl_secs,
            ..Tunables::default()
        };
        check_tunables("command line", &cli)?;
        if let Some(jobs) = jobs {
            self.jobs = jobs;
        }
        if let Some(ttl) = lock_ttl_secs {
            self.lock_ttl = Duration::from_secs(ttl);
        }
        Ok(self)
    }
}

// ============================================================================
// Secret backends
// ============================================================================

/// Build the configured secret store
pub fn build_store(loaded: &LoadedConfig) -> Arc<dyn SecretStore> {
    match &loaded.config.secrets.store {
        StoreConfig::Env { prefix } => Arc::new(EnvSecretStore::from_vars(prefix, std::env::vars())),
        StoreConfig::File { path } => Arc::new(FileSecretStore::new(loaded.resolve_path(path))),
        StoreConfig::Command {
            get,
            put,
            list,
            timeout_secs,
        } => {
            let mut store = CommandSecretStore::new(get.clone());
            if let Some(put) = put {
                store = store.with_put(put.clone());
            }
            if let Some(list) = list {
                store = store.with_list(list.clone());
            }
            if let Some(secs) = timeout_secs {
                store = store.with_timeout(Duration::from_secs(*secs));
            }
            Arc::new(store)
        }
        StoreConfig::Memory => Arc::new(MemorySecretStore::new()),
    }
}

/// Build every configured sink
pub fn build_sinks(loaded: &LoadedConfig) -> Result<Vec<Arc<dyn SecretSink>>> {
    loaded
        .config
        .sinks
        .iter()
        .map(|sink| -> Result<Arc<dyn SecretSink>> {
            Ok(match &sink.kind {
                SinkKind::Github { repo } => Arc::new(
                    CommandSink::github(&sink.id, repo)
                        .with_context(|| format!("Invalid sink '{}'", sink.id))?,
                ),
                SinkKind::Command {
                    set,
                    list,
                    name_pattern,
                    timeout_secs,
                } => {
                    let mut built = CommandSink::new(&sink.id, set.clone());
                    if let Some(list) = list {
                        built = built.with_list(list.clone());
                    }
                    if let Some(pattern) = name_pattern {
                        built = built
                            .with_name_pattern(pattern)
                            .map_err(|e| ValidationFailure::config(format!("sink '{}': {e}", sink.id)))?;
                    }
                    if let Some(secs) = timeout_secs {
                        built = built.with_timeout(Duration::from_secs(*secs));
                    }
                    Arc::new(built)
                }
                SinkKind::Dotenv { path } => {
                    Arc::new(DotenvSink::new(&sink.id, loaded.resolve_path(path)))
                }
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
environment = "staging"
jobs = 8
lock_ttl_secs = 600

[environments.production]
jobs = 2

[state]
path = "/var/lib/keel/{environment}.db"

[secrets.store]
type = "command"
get = ["vault", "read", "{name}"]
timeout_secs = 10

[[sinks]]
id = "github"
type = "github"
repo = "acme/api"

[[sinks]]
id = "runtime"
type = "dotenv"
path = "deploy/.env"

[[resources]]
name = "vpc"
critical = true
static = { id = "vpc-1" }

[[resources]]
name = "database"
depends_on = ["vpc"]
state = "data"
command = ["./db.sh", "apply"]
env = { REGION = "us-east-1" }

[[mappings]]
source = "database_url"
sink = "github"
name = "DATABASE_URL"
from = { node = "database", output = "connection.url" }

[[mappings]]
source = "sentry_dsn"
sink = "runtime"
name = "SENTRY_DSN"
required = false
"#;

    fn state_dir() -> PathBuf {
        PathBuf::from("/tmp/keel-state")
    }

    #[test]
    fn test_parse_full_config() {
        let config = KeelConfig::parse(FULL).unwrap();
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert_eq!(config.tunables.jobs, Some(8));
        assert_eq!(config.sinks.len(), 2);
        assert_eq!(
            config.sinks[0].kind,
            SinkKind::Github {
                repo: "acme/api".into()
            }
        );
        assert_eq!(config.resources.len(), 2);
        assert_eq!(
            config.resources[0].static_payload,
            Some(serde_json::json!({"id": "vpc-1"}))
        );
        assert_eq!(config.resources[1].state.as_deref(), Some("data"));
        assert_eq!(config.resources[1].env["REGION"], "us-east-1");
        assert!(config.mappings[0].required);
        assert!(!config.mappings[1].required);
        assert_eq!(
            config.mappings[0].from.as_ref().map(|f| f.output.as_str()),
            Some("connection.url")
        );
    }

    #[test]
    fn test_defaults() {
        let config = KeelConfig::parse("").unwrap();
        let settings = config.settings(None, &state_dir()).unwrap();
        assert_eq!(settings.environment, "development");
        assert_eq!(settings.jobs, 4);
        assert_eq!(settings.lock_ttl, Duration::from_secs(900));
        assert_eq!(settings.action_timeout, Duration::from_secs(300));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.base_delay, Duration::from_secs(5));
        assert!(settings.allow_ephemeral_state);
        assert_eq!(settings.state_path, state_dir().join("development.db"));
        assert!(matches!(config.secrets.store, StoreConfig::Env { .. }));
    }

    #[test]
    fn test_production_refuses_ephemeral_by_default() {
        let config = KeelConfig::parse("").unwrap();
        let settings = config.settings(Some("production"), &state_dir()).unwrap();
        assert!(!settings.allow_ephemeral_state);

        let config = KeelConfig::parse("allow_ephemeral_state = true").unwrap();
        let settings = config.settings(Some("production"), &state_dir()).unwrap();
        assert!(settings.allow_ephemeral_state);
    }

    #[test]
    fn test_environment_overrides() {
        let config = KeelConfig::parse(FULL).unwrap();

        let staging = config.settings(None, &state_dir()).unwrap();
        assert_eq!(staging.environment, "staging");
        assert_eq!(staging.jobs, 8);
        assert_eq!(staging.state_path, PathBuf::from("/var/lib/keel/staging.db"));

        let production = config.settings(Some("production"), &state_dir()).unwrap();
        assert_eq!(production.jobs, 2);
        assert_eq!(production.lock_ttl, Duration::from_secs(600));
        assert_eq!(
            production.state_path,
            PathBuf::from("/var/lib/keel/production.db")
        );
    }

    #[test]
    fn test_cli_overrides_are_validated() {
        let settings = KeelConfig::default().settings(None, &state_dir()).unwrap();
        let settings = settings.with_overrides(Some(2), Some(30)).unwrap();
        assert_eq!(settings.jobs, 2);
        assert_eq!(settings.lock_ttl, Duration::from_secs(30));
        assert!(settings.clone().with_overrides(Some(0), None).is_err());
        assert!(settings.with_overrides(None, Some(0)).is_err());
    }

    #[test]
    fn test_rejects_bad_tunables() {
        assert!(KeelConfig::parse("jobs = 0").is_err());
        assert!(KeelConfig::parse("max_retries = 0").is_err());
        assert!(KeelConfig::parse("[environments.prod]\nlock_ttl_secs = 0").is_err());
        assert!(KeelConfig::parse("environment = \"bad env\"").is_err());
    }

    #[test]
    fn test_rejects_resource_without_action() {
        let err = KeelConfig::parse("[[resources]]\nname = \"vpc\"").unwrap_err();
        assert!(err.to_string().contains("exactly one of"));

        let both = "[[resources]]\nname = \"vpc\"\ncommand = [\"x\"]\nstatic = { a = 1 }";
        assert!(KeelConfig::parse(both).is_err());

        let empty = "[[resources]]\nname = \"vpc\"\ncommand = []";
        assert!(KeelConfig::parse(empty).is_err());
    }

    #[test]
    fn test_rejects_mapping_from_unknown_resource() {
        let toml = r#"
[[mappings]]
source = "db_url"
sink = "github"
name = "DB_URL"
from = { node = "database", output = "url" }
"#;
        let err = KeelConfig::parse(toml).unwrap_err();
        assert!(matches!(err, ValidationFailure::Mapping(_)));
    }

    #[test]
    fn test_rejects_duplicate_sinks_and_bad_patterns() {
        let dup = r#"
[[sinks]]
id = "a"
type = "dotenv"
path = ".env"

[[sinks]]
id = "a"
type = "dotenv"
path = ".env2"
"#;
        assert!(KeelConfig::parse(dup).is_err());

        let pattern = r#"
[[sinks]]
id = "ci"
type = "command"
set = ["ci-secret", "set", "{name}"]
name_pattern = "(["
"#;
        assert!(KeelConfig::parse(pattern).is_err());

        let repo = "[[sinks]]\nid = \"gh\"\ntype = \"github\"\nrepo = \"no-owner\"";
        assert!(KeelConfig::parse(repo).is_err());
    }

    #[test]
    fn test_unknown_sink_type_is_validation_error() {
        let toml = "[[sinks]]\nid = \"x\"\ntype = \"carrier-pigeon\"";
        assert!(matches!(
            KeelConfig::parse(toml),
            Err(ValidationFailure::Config(_))
        ));
    }

    #[test]
    fn test_load_computes_digest_and_resolves_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keel.toml");
        fs::write(&path, FULL).unwrap();

        let loaded = KeelConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.digest, blake3::hash(FULL.as_bytes()).to_hex().to_string());
        assert_eq!(loaded.resolve_path("deploy/.env"), dir.path().join("deploy/.env"));
        assert_eq!(loaded.resolve_path("/abs/x"), PathBuf::from("/abs/x"));

        let sinks = build_sinks(&loaded).unwrap();
        let ids: Vec<&str> = sinks.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["github", "runtime"]);
    }

    #[test]
    fn test_missing_file_is_validation_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = KeelConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.downcast_ref::<ValidationFailure>().is_some());
    }
}
