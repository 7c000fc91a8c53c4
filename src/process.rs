//! Bounded subprocess execution.
//!
//! The tunnel probe and the iptables backend both shell out. Every call
//! here carries its own timeout and is never retried; the state machine is
//! the only retry authority.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program is not installed.
    #[error("Command '{program}' not found")]
    NotFound {
        /// Program name.
        program: String,
    },

    /// The program could not be started.
    #[error("Failed to execute '{cmd}': {source}")]
    Spawn {
        /// The full command line.
        cmd: String,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The program did not finish in time and was killed.
    #[error("Command '{cmd}' timed out after {timeout:?}")]
    Timeout {
        /// The full command line.
        cmd: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The program exited unsuccessfully.
    #[error("Command '{cmd}' failed ({code}): {stderr}")]
    Failed {
        /// The full command line.
        cmd: String,
        /// Exit code, or -1 when killed by a signal.
        code: i32,
        /// Captured stderr.
        stderr: String,
    },
}

impl CommandError {
    /// True when the program itself is missing, which no retry can fix.
    pub fn is_missing_tool(&self) -> bool {
        matches!(self, CommandError::NotFound { .. })
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// The full command line, for error messages.
    pub cmd: String,
    /// Exit code, or -1 when killed by a signal.
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit into [`CommandError::Failed`].
    pub fn check(self) -> Result<Self, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                cmd: self.cmd,
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `program args...`, waiting at most `timeout`.
///
/// A non-zero exit is not an error here; callers that care use
/// [`CommandOutput::check`].
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let cmd_str = if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    };
    debug!("Running: {}", cmd_str);

    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CommandError::NotFound {
                program: program.to_string(),
            });
        }
        Ok(Err(e)) => {
            return Err(CommandError::Spawn {
                cmd: cmd_str,
                source: e,
            });
        }
        Err(_) => {
            return Err(CommandError::Timeout {
                cmd: cmd_str,
                timeout,
            });
        }
    };

    Ok(CommandOutput {
        cmd: cmd_str,
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
