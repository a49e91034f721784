//! Command execution boundary.
//!
//! Every build/test stage invokes an external program with an argument
//! list; exit status 0 is success and output streams are captured so a
//! failure report can carry them. Execution goes through the
//! [`CommandRunner`] trait so pipeline logic is testable without
//! spawning processes.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command cancelled")]
    Cancelled,
}

/// A fully resolved command: placeholders substituted, environment and
/// working directory decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl std::fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of one command run. `status` is `None` when the
/// process was killed by a signal.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, or until `cancel` fires.
    async fn run(
        &self,
        command: &ResolvedCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// Real process execution via tokio. Cancellation kills the child.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &ResolvedCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .current_dir(&command.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        tokio::select! {
            result = &mut wait => {
                let output = result.map_err(|source| CommandError::Spawn {
                    program: command.program.clone(),
                    source,
                })?;
                Ok(CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            // Dropping the wait future drops the child, and kill_on_drop
            // terminates the process.
            () = cancel.cancelled() => Err(CommandError::Cancelled),
        }
    }
}

/// Replace `${name}` placeholders with their values.
pub fn substitute(input: &str, vars: &[(&str, String)]) -> String {
    let mut out = input.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}
