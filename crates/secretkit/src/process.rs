//! Child process execution with a deadline.
//!
//! Command-backed stores and sinks pass secret values on stdin, never in
//! argv, so they do not show up in process listings. The `keel` binary runs
//! its provisioning commands through [`run_command`] as well.

use crate::error::{Error, Result};
use std::io::{self, ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Placeholder replaced by the secret name in command templates
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Why a command produced no exit status
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    /// The program could not be started
    #[error("failed to execute {program}: {source}")]
    Spawn {
        /// Program that was run
        program: String,
        /// Underlying spawn error
        #[source]
        source: io::Error,
    },

    /// The deadline passed and the child was killed
    #[error("{program} did not finish within {}s and was killed", .after.as_secs())]
    TimedOut {
        /// Program that was run
        program: String,
        /// Time spent before the kill
        after: Duration,
    },

    /// Waiting on or writing to the child failed
    #[error("IO error while running {program}: {source}")]
    Io {
        /// Program that was run
        program: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

impl From<RunError> for Error {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Spawn { program, source } => Self::Spawn {
                program,
                message: source.to_string(),
            },
            RunError::TimedOut { program, after } => Self::Timeout {
                program,
                secs: after.as_secs(),
            },
            RunError::Io { source, .. } => Self::Io(source),
        }
    }
}

/// Substitute `{name}` in every argument.
pub(crate) fn render(args: &[String], name: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace(NAME_PLACEHOLDER, name))
        .collect()
}

/// Run `cmd` with captured output, feeding `input` on stdin (closed otherwise)
///
/// The child is killed once `deadline` passes. Cancellation is not observed:
/// a started command runs to completion or to its deadline.
pub fn run_command(
    mut cmd: Command,
    input: Option<&[u8]>,
    deadline: Option<Instant>,
) -> std::result::Result<Output, RunError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let started = Instant::now();

    let mut child = cmd
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
        match stdin.write_all(bytes) {
            Ok(()) => {}
            // The program exited without reading its input; its status tells the story.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunError::Io { program, source });
            }
        }
    }

    let status = match wait_until(&mut child, deadline) {
        Ok(Some(status)) => status,
        Ok(None) => {
            log::warn!("{program} passed its deadline; killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::TimedOut {
                program,
                after: started.elapsed(),
            });
        }
        Err(source) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::Io { program, source });
        }
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

/// Run `argv` for a store or sink backend with a time budget.
pub(crate) fn run(argv: &[String], input: Option<&[u8]>, timeout: Duration) -> Result<Output> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Spawn {
            program: String::new(),
            message: "empty command".to_string(),
        });
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(run_command(cmd, input, Some(Instant::now() + timeout))?)
}

/// `None` when the deadline passed first
fn wait_until(child: &mut Child, deadline: Option<Instant>) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn test_render_substitutes_name() {
        let args = render(&argv(&["secret", "set", "{name}", "--env={name}"]), "API_KEY");
        assert_eq!(args, argv(&["secret", "set", "API_KEY", "--env=API_KEY"]));
    }

    #[test]
    fn test_run_pipes_stdin() {
        let output = run(&argv(&["cat"]), Some(b"value"), Duration::from_secs(5)).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"value");
    }

    #[test]
    fn test_captures_both_streams_and_status() {
        let output = run_command(sh("echo out; echo err >&2; exit 3"), None, None).unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
    }

    #[test]
    fn test_kills_at_deadline() {
        let started = Instant::now();
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = run_command(sh("sleep 5"), None, Some(deadline)).unwrap_err();
        assert!(matches!(err, RunError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_run_times_out() {
        let err = run(&argv(&["sleep", "5"]), None, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_missing_program() {
        let err = run(&argv(&["keel-no-such-program"]), None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        let err = run_command(Command::new("keel-no-such-program"), None, None).unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }
}
