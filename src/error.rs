//! Errors that map to a distinct exit code.

use std::process::ExitCode;
use thiserror::Error;

/// Exit code for a run with failed nodes or mappings, or a runtime error
pub const EXIT_FAILURE: u8 = 1;

/// Exit code for invalid input detected before any side effect
pub const EXIT_VALIDATION: u8 = 2;

/// Input rejected before anything was provisioned or written.
///
/// `main` looks for this in the error chain and exits with [`EXIT_VALIDATION`].
#[derive(Error, Debug)]
pub enum ValidationFailure {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid resource graph: {0}")]
    Graph(#[from] provision::ValidationError),

    #[error("invalid secret mapping: {0}")]
    Mapping(String),
}

impl ValidationFailure {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Exit code for an error returned from a command
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let validation = err
        .chain()
        .any(|cause| cause.downcast_ref::<ValidationFailure>().is_some());
    if validation {
        ExitCode::from(EXIT_VALIDATION)
    } else {
        ExitCode::from(EXIT_FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_validation_anywhere_in_chain_exits_2() {
        let err: anyhow::Result<()> = Err(ValidationFailure::config("jobs must be at least 1"))
            .context("Failed to load keel.toml");
        let err = err.unwrap_err();
        assert_eq!(exit_code_for(&err), ExitCode::from(EXIT_VALIDATION));
    }

    #[test]
    fn test_runtime_error_exits_1() {
        let err = anyhow::anyhow!("sqlite is locked");
        assert_eq!(exit_code_for(&err), ExitCode::from(EXIT_FAILURE));
    }

    #[test]
    fn test_cycle_message() {
        let err = ValidationFailure::from(provision::ValidationError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        });
        assert!(err.to_string().contains("a -> b -> a"));
    }
}
