//! External command runner.
//!
//! Wraps `tokio::process` with a fixed argument list, captured output, a
//! timeout and a cancellation token. The child is killed on timeout, on
//! cancellation, or when the returned future is dropped.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs_f32())]
    Timeout { program: String, timeout: Duration },

    #[error("{program} cancelled")]
    Cancelled { program: String },
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<OsString>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub async fn run(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let t0 = Instant::now();
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CommandError::Cancelled { program: self.program.clone() });
            }
            _ = tokio::time::sleep(timeout) => {
                return Err(CommandError::Timeout { program: self.program.clone(), timeout });
            }
            waited = child.wait_with_output() => waited.map_err(|source| CommandError::Spawn {
                program: self.program.clone(),
                source,
            })?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(
            "{} exited with {:?} in {:.0}ms",
            self.program,
            output.status.code(),
            t0.elapsed().as_secs_f64() * 1000.0
        );

        if !output.status.success() {
            let skip = stderr.chars().count().saturating_sub(STDERR_TAIL_CHARS);
            return Err(CommandError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: stderr.chars().skip(skip).collect(),
            });
        }

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr,
        })
    }
}
