//! Sink driven by an external CLI such as `gh secret set`.

use crate::error::{Error, Result};
use crate::process::{self, render};
use crate::sink::{SecretSink, check_basic_name};
use crate::value::SecretValue;
use regex::Regex;
use std::time::Duration;

/// GitHub Actions secret names: letters, digits and underscores, not
/// starting with a digit
const GITHUB_NAME_PATTERN: &str = "^[A-Za-z_][A-Za-z0-9_]*$";

/// Sink that shells out to a configured program.
///
/// The value is written to the program's stdin. `{name}` in arguments is
/// replaced with the secret name.
pub struct CommandSink {
    id: String,
    set: Vec<String>,
    list: Option<Vec<String>>,
    name_pattern: Option<Regex>,
    reserved_prefixes: Vec<String>,
    timeout: Duration,
}

impl CommandSink {
    /// Create a sink with the given `set` command.
    pub fn new(id: impl Into<String>, set: Vec<String>) -> Self {
        Self {
            id: id.into(),
            set,
            list: None,
            name_pattern: None,
            reserved_prefixes: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    /// GitHub Actions repository secrets through the `gh` CLI.
    pub fn github(id: impl Into<String>, repo: &str) -> Result<Self> {
        let argv = |parts: &[&str]| parts.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
        Ok(Self::new(id, argv(&["gh", "secret", "set", "{name}", "--repo", repo]))
            .with_list(argv(&["gh", "secret", "list", "--repo", repo]))
            .with_name_pattern(GITHUB_NAME_PATTERN)?
            .with_reserved_prefix("GITHUB_"))
    }

    /// Set the command used to list names (first column of each line).
    pub fn with_list(mut self, list: Vec<String>) -> Self {
        self.list = Some(list);
        self
    }

    /// Only accept names matching `pattern`.
    pub fn with_name_pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            Error::InvalidMapping(format!("invalid name pattern for sink '{}': {e}", self.id))
        })?;
        self.name_pattern = Some(regex);
        Ok(self)
    }

    /// Reject names starting with `prefix` (case-insensitive).
    pub fn with_reserved_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.reserved_prefixes.push(prefix.into().to_ascii_uppercase());
        self
    }

    /// Set the time budget for each invocation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl SecretSink for CommandSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn set(&self, name: &str, value: &SecretValue) -> Result<()> {
        let argv = render(&self.set, name);
        let output = process::run(&argv, Some(value.expose().as_bytes()), self.timeout)?;
        if output.status.success() {
            log::debug!("{}: set {name}", self.id);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::from_command_output(&argv[0], &stderr, Some(value)))
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let Some(list) = &self.list else {
            return Ok(Vec::new());
        };

        let output = process::run(list, None, self.timeout)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::from_command_output(&list[0], &stderr, None));
        }

        let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(ToString::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        check_basic_name(name)?;

        if let Some(pattern) = &self.name_pattern
            && !pattern.is_match(name)
        {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: format!("does not match {}", pattern.as_str()),
            });
        }

        let upper = name.to_ascii_uppercase();
        if let Some(prefix) = self.reserved_prefixes.iter().find(|p| upper.starts_with(p.as_str())) {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: format!("prefix {prefix} is reserved"),
            });
        }
        Ok(())
    }
}
