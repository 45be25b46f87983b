//! Remote shell channel for VM-backed nodes.
//!
//! Uses `tokio::process::Command` to shell out to `ssh`. Keys must be
//! pre-configured for the target user; `BatchMode` keeps a missing key from
//! hanging the run on a password prompt.

use std::time::Duration;
use thiserror::Error;

/// Errors from SSH operations.
#[derive(Debug, Error)]
pub enum SshError {
    /// SSH command failed to execute (process spawn error).
    #[error("ssh spawn error: {0}")]
    Spawn(#[from] std::io::Error),

    /// `ssh` itself could not reach the host (exit code 255).
    #[error("ssh to {host} failed: {stderr}")]
    Unreachable {
        /// Target host.
        host: String,
        /// Standard error output.
        stderr: String,
    },

    /// Remote command returned non-zero exit code.
    #[error("ssh command failed on {host}: exit={exit_code}, stderr={stderr}")]
    CommandFailed {
        /// Target host.
        host: String,
        /// Exit code.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },
}

/// Result of executing a command via SSH.
#[derive(Debug, Clone)]
pub struct SshResult {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (0 = success).
    pub exit_code: i32,
}

impl SshResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Exit code `ssh` uses for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// SSH target machine.
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// Host address.
    pub host: String,
    /// SSH username.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl SshTarget {
    /// Create a target with the given connect timeout.
    pub fn new(host: &str, user: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            connect_timeout,
        }
    }

    /// Build the `ssh` argument vector for a remote command.
    pub fn ssh_args(&self, cmd: &str) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".into(),
            "BatchMode=yes".into(),
            "-p".into(),
            self.port.to_string(),
            format!("{}@{}", self.user, self.host),
            cmd.to_string(),
        ]
    }

    /// Execute a command on the remote machine via SSH.
    ///
    /// Returns the raw result including exit code, stdout, and stderr.
    /// Does NOT fail on non-zero exit of the remote command (use `exec_ok`),
    /// but does fail when `ssh` could not connect at all.
    pub async fn exec(&self, cmd: &str) -> Result<SshResult, SshError> {
        tracing::debug!(host = %self.host, cmd, "ssh exec");
        let output = tokio::process::Command::new("ssh")
            .args(self.ssh_args(cmd))
            .kill_on_drop(true)
            .output()
            .await?;

        let result = SshResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if result.exit_code == SSH_CONNECTION_FAILURE {
            return Err(SshError::Unreachable {
                host: self.host.clone(),
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    /// Execute a command on the remote machine, failing on non-zero exit.
    pub async fn exec_ok(&self, cmd: &str) -> Result<SshResult, SshError> {
        let result = self.exec(cmd).await?;
        if !result.success() {
            return Err(SshError::CommandFailed {
                host: self.host.clone(),
                exit_code: result.exit_code,
                stderr: result.stderr.clone(),
            });
        }
        Ok(result)
    }

    /// Whether the host accepts SSH connections right now.
    pub async fn is_reachable(&self) -> bool {
        matches!(self.exec("true").await, Ok(r) if r.success())
    }
}
