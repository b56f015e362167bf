//! Remote command execution over SSH.
//!
//! Every machine the harness provisions is driven through the system `ssh`
//! client. Connections are transient: each command spawns its own `ssh`
//! process, so there is no connection pool to manage and nothing to leak
//! when a caller gives up on a command.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Authentication | Key-based only (`BatchMode=yes`) |
//! | Stdin | Supported via [`SshClient::run_with_input`] |
//! | Deadlines | Per command via [`SshClient::run_with_timeout`] |
//! | Cancellation | Child processes are killed when their future is dropped |
//!
//! # Exit codes
//!
//! `ssh` itself exits with status 255 when the session could not be
//! established. That status is reported as [`SshError::Connection`]; any
//! other non-zero status is the remote command's own and is reported as
//! [`SshError::CommandFailed`].
//!
//! # Example
//!
//! ```no_run
//! use kola::ssh::{SshClient, SshTarget};
//!
//! # async fn example() -> Result<(), kola::ssh::SshError> {
//! let client = SshClient::new("core").with_key("~/.ssh/id_ed25519");
//! let target = SshTarget::new("203.0.113.10", 22);
//!
//! let out = client.run(&target, "uname -r").await?;
//! println!("kernel: {}", out.stdout_str().trim());
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::SshConfig;
use crate::util;

/// Exit status used by the `ssh` client for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Errors produced while running a command on a remote machine.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// The session could not be established (refused, auth, DNS, reset).
    #[error("SSH connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// The remote command ran and exited non-zero.
    #[error("command `{command}` on {target} exited with status {status}: {stderr}")]
    CommandFailed {
        target: String,
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    /// The command did not finish before its deadline.
    #[error("command `{command}` on {target} timed out after {timeout:?}")]
    Timeout {
        target: String,
        command: String,
        timeout: Duration,
    },

    /// The local `ssh` process could not be spawned or talked to.
    #[error("failed to run ssh: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Returns `true` if the failure happened before the remote command ran.
    pub fn is_connection(&self) -> bool {
        matches!(self, SshError::Connection { .. })
    }

    /// Returns `true` for deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SshError::Timeout { .. })
    }
}

/// Network endpoint of a machine's SSH daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Captured output of a successful remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
}

impl SshOutput {
    /// Standard output decoded lossily as UTF-8.
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Standard error decoded lossily as UTF-8.
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Runs commands on remote hosts with the system `ssh` binary.
///
/// The client is cheap to clone and holds no connections; all state is the
/// option set passed to every `ssh` invocation.
#[derive(Debug, Clone)]
pub struct SshClient {
    user: String,
    key_path: Option<PathBuf>,
    port: u16,
    connect_timeout: Duration,
    disable_host_key_check: bool,
    program: String,
}

impl SshClient {
    /// Creates a client logging in as `user` with default options.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key_path: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            disable_host_key_check: true,
            program: "ssh".to_string(),
        }
    }

    /// Builds a client from the `[ssh]` configuration section.
    pub fn from_config(config: &SshConfig) -> Self {
        let mut client = Self::new(config.user.clone())
            .with_port(config.port)
            .with_connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .with_host_key_check(!config.disable_host_key_check);
        if let Some(key) = &config.key_path {
            client = client.with_key(key);
        }
        client
    }

    /// Uses the given private key; `~` is expanded.
    pub fn with_key(mut self, path: impl AsRef<Path>) -> Self {
        let expanded = shellexpand::tilde(&path.as_ref().to_string_lossy()).into_owned();
        self.key_path = Some(PathBuf::from(expanded));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_host_key_check(mut self, enabled: bool) -> Self {
        self.disable_host_key_check = !enabled;
        self
    }

    /// Overrides the `ssh` executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Target for `host` on the configured default port.
    pub fn target(&self, host: impl Into<String>) -> SshTarget {
        SshTarget::new(host, self.port)
    }

    fn options(&self, target: &SshTarget) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=10".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];

        if self.disable_host_key_check {
            opts.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }

        if let Some(key) = &self.key_path {
            opts.push("-i".to_string());
            opts.push(key.to_string_lossy().into_owned());
        }

        opts.push("-p".to_string());
        opts.push(target.port.to_string());
        opts.push(format!("{}@{}", self.user, target.host));
        opts
    }

    /// Builds the `ssh` process for `remote_cmd` without starting it.
    ///
    /// The child is killed if its handle is dropped, so abandoning the
    /// returned command's future never leaves a session behind.
    pub fn command(&self, target: &SshTarget, remote_cmd: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.options(target));
        cmd.arg(remote_cmd);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Runs `cmd` and waits for it to finish.
    pub async fn run(&self, target: &SshTarget, cmd: &str) -> Result<SshOutput, SshError> {
        debug!("ssh {}: {}", target, cmd);
        let output = self.command(target, cmd).output().await?;
        finish(target, cmd, output)
    }

    /// Runs `cmd` with `input` written to its standard input.
    pub async fn run_with_input(
        &self,
        target: &SshTarget,
        cmd: &str,
        input: &[u8],
    ) -> Result<SshOutput, SshError> {
        debug!("ssh {} ({} bytes stdin): {}", target, input.len(), cmd);
        let mut command = self.command(target, cmd);
        command.stdin(Stdio::piped());
        let mut child = command.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        finish(target, cmd, output)
    }

    /// Runs `cmd` under a deadline; on expiry the session is killed.
    pub async fn run_with_timeout(
        &self,
        target: &SshTarget,
        cmd: &str,
        timeout: Duration,
    ) -> Result<SshOutput, SshError> {
        match util::with_timeout(timeout, self.run(target, cmd)).await {
            Ok(result) => result,
            Err(_) => Err(SshError::Timeout {
                target: target.to_string(),
                command: cmd.to_string(),
                timeout,
            }),
        }
    }
}

fn finish(
    target: &SshTarget,
    cmd: &str,
    output: std::process::Output,
) -> Result<SshOutput, SshError> {
    let status = output.status.code().unwrap_or(-1);

    if status == SSH_CLIENT_FAILURE {
        return Err(SshError::Connection {
            target: target.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    if status != 0 {
        return Err(SshError::CommandFailed {
            target: target.to_string(),
            command: cmd.to_string(),
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(SshOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_include_key_port_and_destination() {
        let client = SshClient::new("core")
            .with_key("/keys/id_rsa")
            .with_port(2222);
        let opts = client.options(&client.target("10.0.0.5"));

        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"StrictHostKeyChecking=no".to_string()));
        let key_idx = opts.iter().position(|o| o == "-i").unwrap();
        assert_eq!(opts[key_idx + 1], "/keys/id_rsa");
        let port_idx = opts.iter().position(|o| o == "-p").unwrap();
        assert_eq!(opts[port_idx + 1], "2222");
        assert_eq!(opts.last().unwrap(), "core@10.0.0.5");
    }

    #[test]
    fn test_host_key_check_enabled() {
        let client = SshClient::new("core").with_host_key_check(true);
        let opts = client.options(&SshTarget::new("h", 22));
        assert!(!opts.iter().any(|o| o.starts_with("StrictHostKeyChecking")));
    }

    #[tokio::test]
    async fn test_exit_255_is_connection_error() {
        // `sh -c 'exit 255'` stands in for an ssh client failure.
        let target = SshTarget::new("ignored", 22);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo refused >&2; exit 255")
            .output()
            .await
            .unwrap();

        let err = finish(&target, "true", output).unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn test_nonzero_status_is_command_failure() {
        let target = SshTarget::new("h", 22);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo out; echo err >&2; exit 3")
            .output()
            .await
            .unwrap();

        match finish(&target, "false", output).unwrap_err() {
            SshError::CommandFailed {
                status,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(status, 3);
                assert_eq!(stdout, "out\n");
                assert_eq!(stderr, "err");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
