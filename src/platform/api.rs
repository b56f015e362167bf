//! Bridge to cloud provider command-line tools.
//!
//! Cloud backends do not link vendor SDKs; they drive each vendor's CLI
//! (`aws`, `gcloud`, `doctl`, `oci`, `govc`, `metal`) and parse its JSON
//! output. [`CliApi`] wraps one such tool with:
//!
//! - fixed leading arguments (profile, region, output format)
//! - extra environment (credentials files, tokens)
//! - a per-call timeout
//! - a concurrency limit shared by every cluster on the platform, so a
//!   parallel run does not trip the provider's rate limits
//! - classification of "resource does not exist" responses into
//!   [`ProviderError::NotFound`]
//!
//! Only responses matching one of the configured not-found markers are
//! classified as missing. Anything else, including ambiguous "not found or
//! not authorized" replies a backend chooses not to list, stays an
//! [`ProviderError::Api`] error.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::platform::{ProviderError, ProviderResult};

/// One vendor CLI, shared by all clusters of a provider.
#[derive(Debug, Clone)]
pub struct CliApi {
    command: Vec<String>,
    trailing: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Duration,
    not_found: Vec<String>,
    permits: Arc<Semaphore>,
}

impl CliApi {
    /// `command` may carry arguments, e.g. `"aws --no-cli-pager"`.
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        // Split command string into parts, respecting quotes
        let command = shell_words::split(&command).unwrap_or_else(|_| vec![command]);
        Self {
            command,
            trailing: Vec::new(),
            env: Vec::new(),
            timeout: Duration::from_secs(600),
            not_found: Vec::new(),
            permits: Arc::new(Semaphore::new(4)),
        }
    }

    /// Arguments appended to every call.
    pub fn with_trailing_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trailing.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Maximum calls in flight at once.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Error output containing `marker` means the resource is gone.
    pub fn with_not_found_marker(mut self, marker: impl Into<String>) -> Self {
        self.not_found.push(marker.into());
        self
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Runs the tool with `args` and returns its standard output.
    pub async fn run(&self, args: &[&str]) -> ProviderResult<String> {
        let Some((program, leading)) = self.command.split_first() else {
            return Err(ProviderError::Api("empty CLI command".to_string()));
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Api("CLI semaphore closed".to_string()))?;

        debug!("{} {}", program, args.join(" "));

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(leading);
        cmd.args(args);
        cmd.args(&self.trailing);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!(
                    "{} {} timed out after {:?}",
                    program,
                    args.first().unwrap_or(&""),
                    self.timeout
                ))
            })?
            .map_err(|e| ProviderError::Api(format!("failed to run {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!("{} stdout: {}", program, stdout);

        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = format!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            if stderr.is_empty() { stdout.trim() } else { stderr.as_str() }
        );

        if self
            .not_found
            .iter()
            .any(|marker| stderr.contains(marker.as_str()) || stdout.contains(marker.as_str()))
        {
            return Err(ProviderError::NotFound(message));
        }
        Err(ProviderError::Api(message))
    }

    /// Runs the tool and parses its output as JSON.
    pub async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> ProviderResult<T> {
        let stdout = self.run(args).await?;
        serde_json::from_str(&stdout).map_err(|e| {
            ProviderError::Api(format!(
                "unexpected output from {} {}: {}",
                self.program(),
                args.first().unwrap_or(&""),
                e
            ))
        })
    }
}

/// Treats "already gone" as success for idempotent deletes.
pub fn ignore_not_found(result: ProviderResult<String>) -> ProviderResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!("resource already gone: {}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
