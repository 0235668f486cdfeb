//! Provisioning actions built from `[[resources]]`

use crate::config::{LoadedConfig, OutputFormat, ResourceConfig, Settings};
use provision::{ActionContext, ActionError, ProvisionAction, ResourceNode, with_retry_in};
use secretkit::process::{self, RunError};
use serde_json::{Value, json};
use statekit::StateRecord;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

/// Current payload as JSON, empty when the resource has never been provisioned
pub const ENV_CURRENT_STATE: &str = "KEEL_CURRENT_STATE";
/// Current version, `0` when the resource has never been provisioned
pub const ENV_CURRENT_VERSION: &str = "KEEL_CURRENT_VERSION";
/// Name of the resource being converged
pub const ENV_RESOURCE: &str = "KEEL_RESOURCE";
/// Environment the run targets
pub const ENV_ENVIRONMENT: &str = "KEEL_ENVIRONMENT";

const STDERR_TAIL: usize = 400;

/// Failure texts worth another attempt
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "throttl",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "service unavailable",
    "try again",
    "503",
    "429",
];

/// Runs a program that converges one resource and prints its payload
#[derive(Debug, Clone)]
pub struct CommandAction {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    output: OutputFormat,
    description: String,
}

impl CommandAction {
    pub fn new(argv: Vec<String>) -> Self {
        let description = argv.join(" ");
        Self {
            argv,
            cwd: None,
            env: BTreeMap::new(),
            output: OutputFormat::Json,
            description,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn command(&self, current: Option<&StateRecord>, ctx: &ActionContext) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.env);
        cmd.env(ENV_RESOURCE, &ctx.node);
        cmd.env(
            ENV_CURRENT_STATE,
            current.map(|r| r.payload.to_string()).unwrap_or_default(),
        );
        cmd.env(
            ENV_CURRENT_VERSION,
            current.map_or(0, |r| r.version).to_string(),
        );
        cmd
    }

    fn attempt(
        &self,
        current: Option<&StateRecord>,
        ctx: &ActionContext,
        attempt: u32,
    ) -> Result<Value, ActionError> {
        if attempt > 0 {
            log::debug!("{}: attempt {}", ctx.node, attempt + 1);
        }
        let out = match process::run_command(self.command(current, ctx), None, ctx.deadline) {
            Ok(out) => out,
            Err(RunError::TimedOut { after, .. }) => return Err(ActionError::TimedOut { after }),
            Err(e @ RunError::Spawn { .. }) => return Err(ActionError::permanent(e.to_string())),
            Err(e @ RunError::Io { .. }) => return Err(ActionError::transient(e.to_string())),
        };

        if !out.status.success() {
            let code = out
                .status
                .code()
                .map_or_else(|| "a signal".to_string(), |c| format!("status {c}"));
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stderr = tail(stderr.trim(), STDERR_TAIL);
            // stderr may echo secret inputs; only its size is logged
            log::debug!("{}: {} wrote {} bytes to stderr", ctx.node, self.argv[0], out.stderr.len());
            return Err(classify(
                &format!("{} exited with {code}", self.argv[0]),
                stderr,
            ));
        }

        let stdout = String::from_utf8(out.stdout).map_err(|_| {
            ActionError::permanent(format!("{} printed output that is not UTF-8", self.argv[0]))
        })?;
        parse_payload(&stdout, self.output)
    }
}

impl ProvisionAction for CommandAction {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn provision(
        &self,
        current: Option<&StateRecord>,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        if self.argv.is_empty() {
            return Err(ActionError::permanent("no command configured"));
        }
        with_retry_in(ctx, |attempt| self.attempt(current, ctx, attempt))
    }
}

/// A resource whose outputs are known up front
#[derive(Debug, Clone)]
pub struct StaticAction {
    payload: Value,
    description: String,
}

impl StaticAction {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            description: "record static outputs".to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl ProvisionAction for StaticAction {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn provision(
        &self,
        _current: Option<&StateRecord>,
        _ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        Ok(self.payload.clone())
    }
}

/// Judge retryability from the program's stderr, reporting only `message`
fn classify(message: &str, stderr: &str) -> ActionError {
    let lower = stderr.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ActionError::transient(message)
    } else {
        ActionError::permanent(message)
    }
}

fn parse_payload(stdout: &str, format: OutputFormat) -> Result<Value, ActionError> {
    let trimmed = stdout.trim();
    match format {
        OutputFormat::Text => Ok(json!({ "stdout": trimmed })),
        OutputFormat::Json if trimmed.is_empty() => Ok(json!({})),
        OutputFormat::Json => serde_json::from_str(trimmed).map_err(|e| {
            ActionError::permanent(format!("output is not valid JSON ({e}); use output = \"text\""))
        }),
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Build graph nodes for every configured resource
pub fn build_nodes(loaded: &LoadedConfig, settings: &Settings) -> Vec<ResourceNode> {
    loaded
        .config
        .resources
        .iter()
        .map(|resource| {
            let action = build_action(loaded, settings, resource);
            let mut node = ResourceNode::new(&resource.name, action)
                .depends_on(resource.depends_on.iter().cloned())
                .critical(resource.critical);
            if let Some(state) = &resource.state {
                node = node.state_resource(state);
            }
            node
        })
        .collect()
}

fn build_action(
    loaded: &LoadedConfig,
    settings: &Settings,
    resource: &ResourceConfig,
) -> Arc<dyn ProvisionAction> {
    if let Some(payload) = &resource.static_payload {
        let mut action = StaticAction::new(payload.clone());
        if let Some(description) = &resource.description {
            action = action.with_description(description);
        }
        return Arc::new(action);
    }

    let argv = resource.command.clone().unwrap_or_default();
    let mut action = CommandAction::new(argv)
        .with_output(resource.output)
        .with_env(ENV_ENVIRONMENT, &settings.environment);
    for (key, value) in &resource.env {
        action = action.with_env(key, value);
    }
    match &resource.cwd {
        Some(cwd) => action = action.with_cwd(loaded.resolve_path(cwd)),
        None => {
            if let Some(dir) = loaded.path.parent() {
                action = action.with_cwd(dir);
            }
        }
    }
    if let Some(description) = &resource.description {
        action = action.with_description(description);
    }
    Arc::new(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use provision::RetryConfig;
    use std::time::{Duration, Instant};

    fn ctx() -> ActionContext {
        let mut ctx = ActionContext::new("database");
        ctx.retry = RetryConfig::new(3, Duration::from_millis(10), 1.0);
        ctx
    }

    fn sh(script: &str) -> CommandAction {
        CommandAction::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn test_classify() {
        assert!(classify("api exited with status 1", "HTTP 429 Too Many Requests").is_retryable());
        assert!(classify("api exited with status 1", "read: connection reset by peer").is_retryable());
        assert!(classify("api exited with status 1", "Rate limit exceeded").is_retryable());
        let err = classify("api exited with status 1", "AccessDenied: not authorized");
        assert!(!err.is_retryable());
        assert!(!err.to_string().contains("AccessDenied"));
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(
            parse_payload("{\"host\": \"db\"}\n", OutputFormat::Json).unwrap(),
            json!({"host": "db"})
        );
        assert_eq!(parse_payload("  ", OutputFormat::Json).unwrap(), json!({}));
        assert_eq!(
            parse_payload("vpc-123\n", OutputFormat::Text).unwrap(),
            json!({"stdout": "vpc-123"})
        );
        assert!(matches!(
            parse_payload("not json", OutputFormat::Json),
            Err(ActionError::Permanent { .. })
        ));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ééé", 3), "é");
    }

    #[test]
    fn test_static_action() {
        let action = StaticAction::new(json!({"id": "vpc-1"}));
        assert_eq!(action.provision(None, &ctx()).unwrap(), json!({"id": "vpc-1"}));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_sees_current_state() {
        let record = StateRecord::next("database", Some(1), json!({"host": "old"}), Utc::now());
        let action = sh(
            "printf '{\"seen\": %s, \"version\": %s, \"node\": \"%s\"}' \
             \"$KEEL_CURRENT_STATE\" \"$KEEL_CURRENT_VERSION\" \"$KEEL_RESOURCE\"",
        );
        let payload = action.provision(Some(&record), &ctx()).unwrap();
        assert_eq!(
            payload,
            json!({"seen": {"host": "old"}, "version": 2, "node": "database"})
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_command_env_and_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = sh("printf '{\"region\": \"%s\", \"dir\": \"%s\"}' \"$REGION\" \"$(pwd)\"")
            .with_env("REGION", "eu-west-1")
            .with_cwd(dir.path());
        let payload = action.provision(None, &ctx()).unwrap();
        assert_eq!(payload["region"], "eu-west-1");
        let seen = PathBuf::from(payload["dir"].as_str().unwrap());
        assert_eq!(
            seen.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_transient_failure_is_retried() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("attempted");
        let script = format!(
            "if [ -f '{0}' ]; then echo '{{\"ok\": true}}'; else touch '{0}'; echo 'rate limit exceeded' >&2; exit 1; fi",
            marker.display()
        );
        let payload = sh(&script).provision(None, &ctx()).unwrap();
        assert_eq!(payload, json!({"ok": true}));
    }

    #[cfg(unix)]
    #[test]
    fn test_permanent_failure_is_not_retried() {
        let dir = tempfile::TempDir::new().unwrap();
        let counter = dir.path().join("count");
        let script = format!(
            "echo x >> '{}'; echo 'AccessDenied' >&2; exit 2",
            counter.display()
        );
        let err = sh(&script).provision(None, &ctx()).unwrap_err();
        assert!(matches!(err, ActionError::Permanent { .. }));
        assert!(err.to_string().contains("status 2"));
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_message_omits_stderr() {
        let action = sh("echo \"token=$KEEL_TEST_TOKEN rejected\" >&2; exit 1")
            .with_env("KEEL_TEST_TOKEN", "hunter2-sekrit");
        let err = action.provision(None, &ctx()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("status 1"));
        assert!(!message.contains("hunter2-sekrit"));
        assert!(!message.contains("rejected"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_output_is_permanent() {
        let err = sh("printf '\\377'").provision(None, &ctx()).unwrap_err();
        assert!(matches!(err, ActionError::Permanent { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_deadline_kills_command() {
        let mut ctx = ctx();
        ctx.deadline = Some(Instant::now() + Duration::from_millis(200));
        let err = sh("sleep 5").provision(None, &ctx).unwrap_err();
        assert!(matches!(err, ActionError::TimedOut { .. }));
    }

    #[test]
    fn test_missing_program_is_permanent() {
        let action = CommandAction::new(vec!["keel-no-such-program".into()]);
        assert!(matches!(
            action.provision(None, &ctx()),
            Err(ActionError::Permanent { .. })
        ));
    }

    #[test]
    fn test_build_nodes() {
        let toml = r#"
[[resources]]
name = "vpc"
critical = true
static = { id = "vpc-1" }

[[resources]]
name = "database"
depends_on = ["vpc"]
state = "data"
description = "managed postgres"
command = ["./db.sh"]
"#;
        let config = crate::config::KeelConfig::parse(toml).unwrap();
        let settings = config
            .settings(None, std::path::Path::new("/tmp/keel"))
            .unwrap();
        let loaded = LoadedConfig {
            config,
            path: PathBuf::from("/srv/infra/keel.toml"),
            digest: String::new(),
        };
        let nodes = build_nodes(&loaded, &settings);
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].critical);
        assert_eq!(nodes[0].description(), "record static outputs");
        assert!(nodes[1].depends_on.contains("vpc"));
        assert_eq!(nodes[1].lock_key("global"), "data");
        assert_eq!(nodes[1].description(), "managed postgres");
    }
}
