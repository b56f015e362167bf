//! The handle a test body receives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{error, info};

use crate::conf::BootPayload;
use crate::config::Platform;
use crate::platform::{BatchError, Cluster, Machine, ProviderResult};
use crate::ssh::{SshError, SshOutput};
use crate::util;

use super::TestAbort;

/// Per-test verdict state shared between the handle and the harness.
#[derive(Debug, Default)]
pub(crate) struct Verdict {
    failed: AtomicBool,
    diagnostics: Mutex<Vec<String>>,
}

impl Verdict {
    pub(crate) fn push(&self, message: String) {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    pub(crate) fn fail(&self, message: String) {
        self.failed.store(true, Ordering::SeqCst);
        self.push(message);
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn take_diagnostics(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .diagnostics
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// A cluster as seen from inside one test.
///
/// Cheap to clone; clones may be moved into tasks the body spawns, and
/// every clone records into the same verdict.
#[derive(Clone)]
pub struct TestCluster {
    name: Arc<str>,
    platform: Platform,
    distro: Arc<str>,
    user_data: BootPayload,
    cluster: Arc<dyn Cluster>,
    verdict: Arc<Verdict>,
}

impl TestCluster {
    pub(crate) fn new(
        name: &str,
        platform: Platform,
        distro: &str,
        user_data: BootPayload,
        cluster: Arc<dyn Cluster>,
        verdict: Arc<Verdict>,
    ) -> Self {
        Self {
            name: name.into(),
            platform,
            distro: distro.into(),
            user_data,
            cluster,
            verdict,
        }
    }

    /// Name of the running test.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn distro(&self) -> &str {
        &self.distro
    }

    /// The test's boot payload for the selected distribution.
    pub fn user_data(&self) -> &BootPayload {
        &self.user_data
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.cluster.machines()
    }

    /// Adds a machine to the cluster; it is torn down with the test.
    pub async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        self.cluster.new_machine(payload).await
    }

    pub async fn new_machines(
        &self,
        payload: &BootPayload,
        count: usize,
    ) -> Result<Vec<Arc<dyn Machine>>, BatchError> {
        self.cluster.new_machines(payload, count).await
    }

    pub async fn ssh(&self, machine: &dyn Machine, cmd: &str) -> Result<SshOutput, SshError> {
        machine.ssh(cmd).await
    }

    /// Runs `cmd` and returns its trimmed stdout; any error aborts the test.
    pub async fn must_ssh(&self, machine: &dyn Machine, cmd: &str) -> Result<String, TestAbort> {
        match machine.ssh(cmd).await {
            Ok(output) => Ok(output.stdout_str().trim().to_string()),
            Err(e) => Err(self.fatal(format!("{}: {}", machine.id(), e))),
        }
    }

    /// Like [`ssh`](Self::ssh), bounded by `timeout`.
    pub async fn ssh_timeout(
        &self,
        machine: &dyn Machine,
        cmd: &str,
        timeout: Duration,
    ) -> Result<SshOutput, SshError> {
        util::with_timeout(timeout, machine.ssh(cmd))
            .await
            .unwrap_or_else(|_| {
                Err(SshError::Timeout {
                    target: machine.ssh_target().to_string(),
                    command: cmd.to_string(),
                    timeout,
                })
            })
    }

    /// Records a failure and lets the test continue.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.verdict.fail(message);
    }

    /// Builds the abort that ends the test as fatal: `return Err(c.fatal(..))`.
    pub fn fatal(&self, message: impl Into<String>) -> TestAbort {
        TestAbort::Fatal(message.into())
    }

    pub fn skip(&self, reason: impl Into<String>) -> TestAbort {
        TestAbort::Skip(reason.into())
    }

    /// Attaches a note to the result without affecting the verdict.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.verdict.push(message);
    }
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("distro", &self.distro)
            .field("cluster", &self.cluster.name())
            .finish()
    }
}
