//! Bounded execution of external management binaries
//!
//! Every kernel change goes through a [`CommandExecutor`]. Exit code 0 is the
//! only success signal; anything else is classified into a [`CommandError`]
//! with the captured output attached for diagnostics.

use crate::core::error::CommandError;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-invocation timeout for packet-filter commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Captured output of a successful invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs one binary with a fixed prefix of arguments and a timeout
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    prefix_args: Vec<String>,
    elevate: bool,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            elevate: false,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Executor for an iptables binary, elevated through [`crate::elevation`]
    pub fn iptables(program: impl Into<String>) -> Self {
        Self::new(program).elevated(true)
    }

    /// Arguments placed before every call's own arguments
    pub fn with_prefix<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = prefix.into_iter().map(Into::into).collect();
        self
    }

    pub fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn display_command(&self, args: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.prefix_args.iter().map(String::as_str))
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build_command(&self, args: &[String]) -> Result<tokio::process::Command, CommandError> {
        let all_args: Vec<&str> = self
            .prefix_args
            .iter()
            .chain(args.iter())
            .map(String::as_str)
            .collect();

        let mut cmd = if self.elevate {
            crate::elevation::create_elevated_iptables_command(&self.program, &all_args)?
        } else {
            let mut cmd = tokio::process::Command::new(&self.program);
            cmd.args(&all_args);
            cmd
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Runs the program with `args`, waiting at most the configured timeout
    ///
    /// # Errors
    ///
    /// - [`CommandError::Timeout`] if the process outlives the timeout (it is killed)
    /// - [`CommandError::BinaryNotFound`] if the program (or its elevation wrapper) is missing
    /// - [`CommandError::NonZeroExit`] with captured stdout/stderr otherwise
    pub async fn run(&self, args: &[String]) -> Result<CommandOutput, CommandError> {
        let command = self.display_command(args);
        debug!("Running: {command}");

        let child = self
            .build_command(args)?
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CommandError::BinaryNotFound(self.program.clone()),
                _ => CommandError::Io {
                    command: command.clone(),
                    source: e,
                },
            })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| CommandError::Io {
                command: command.clone(),
                source: e,
            })?,
            Err(_) => {
                warn!("Command timed out after {:?}: {command}", self.timeout);
                return Err(CommandError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            debug!("Command succeeded: {command}");
            Ok(CommandOutput { stdout, stderr })
        } else {
            debug!(
                "Command failed ({:?}): {command}: {stderr}",
                output.status.code()
            );
            Err(CommandError::NonZeroExit {
                command,
                exit_code: output.status.code(),
                stdout,
                stderr,
            })
        }
    }
}
