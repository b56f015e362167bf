//! Provider contract: platforms create clusters, clusters create machines.
//!
//! Every provisioning backend (cloud APIs, bare metal, local QEMU) plugs in
//! through three traits:
//!
//! - [`Provider`] - Factory that creates clusters for one platform
//! - [`Cluster`] - A named group of machines owned by a single test
//! - [`Machine`] - One provisioned instance, driven over SSH
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Provider                              │
//! │  new_cluster(ClusterConfig) ───► Cluster                     │
//! └────────────────────────────────────┼────────────────────────┘
//!                                      │
//!                                      ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Cluster                              │
//! │  new_machine(BootPayload) ───► Machine                       │
//! │  machines()   destroy()                                      │
//! └────────────────────────────────────┼────────────────────────┘
//!                                      │
//!                                      ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Machine                              │
//! │  id() ip() private_ip()                                      │
//! │  ssh(cmd)  reboot()  console_output()  destroy()             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Platforms
//!
//! | Platform | Module | Driven through |
//! |----------|--------|----------------|
//! | `aws` | [`machine::aws`] | `aws` CLI |
//! | `do` | [`machine::digitalocean`] | `doctl` |
//! | `esx` | [`machine::esx`] | `govc` |
//! | `gce` | [`machine::gce`] | `gcloud` |
//! | `oci` | [`machine::oci`] | `oci` CLI |
//! | `packet` | [`machine::packet`] | `metal` CLI |
//! | `qemu` | [`machine::qemu`] | local `qemu-system-*` processes |
//!
//! # Cluster lifecycle
//!
//! ```text
//! Created ──► Populating ──► Running ──► TearingDown ──► Destroyed
//! ```
//!
//! Machines can only be added before teardown starts. Once a cluster is
//! tearing down, [`BaseCluster::add_machine`] refuses new members and the
//! backend destroys the instance it just created, so nothing provisioned
//! escapes cleanup. A machine leaves the cluster's live set exactly once,
//! when it is destroyed.
//!
//! # Implementing a Backend
//!
//! A backend implements [`Machine`] for its instance handle, [`Cluster`]
//! for a struct holding an `Arc<BaseCluster>`, and [`Provider`] to create
//! that cluster. Shared behaviour (SSH, reboot, teardown, batch creation)
//! comes from default methods; a backend only writes what its API needs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use kola::conf::BootPayload;
//! use kola::platform::*;
//!
//! struct MyCluster { base: Arc<BaseCluster> }
//!
//! #[async_trait]
//! impl Cluster for MyCluster {
//!     fn base(&self) -> &BaseCluster { &self.base }
//!     async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
//!         todo!()
//!     }
//! }
//!
//! struct MyProvider;
//!
//! #[async_trait]
//! impl Provider for MyProvider {
//!     type Cluster = MyCluster;
//!     fn name(&self) -> &str { "mine" }
//!     async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<MyCluster>> {
//!         Ok(Arc::new(MyCluster { base: BaseCluster::new(config) }))
//!     }
//! }
//! ```

pub mod api;
#[cfg(test)]
pub(crate) mod fake;
pub mod journal;
pub mod machine;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::conf::BootPayload;
use crate::config::{Config, Platform};
use crate::ssh::{SshClient, SshError, SshOutput, SshTarget};

pub use journal::Journal;
pub use machine::{install_file, reboot_machine, transfer_file};

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur while provisioning or driving machines.
///
/// Errors are categorized to enable appropriate handling strategies:
/// - **Transient**: `Timeout`, `Api`, SSH connection failures - may succeed on retry
/// - **Permanent**: `CreateFailed`, `NotFound`, `ClusterDestroyed`
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The backend refused or failed to create an instance.
    #[error("Failed to create machine: {0}")]
    CreateFailed(String),

    /// A provider API call failed (non-zero CLI exit, bad response).
    #[error("Provider API error: {0}")]
    Api(String),

    /// The provider reports the resource does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A machine was requested from a cluster that is being torn down.
    #[error("Cluster {0} is being torn down")]
    ClusterDestroyed(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider-specific error not covered by other variants.
    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Api(_) | ProviderError::Timeout(_) => true,
            ProviderError::Ssh(e) => e.is_connection() || e.is_timeout(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Per-run settings every machine in a cluster shares.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub platform: Platform,
    pub ssh: SshClient,
    /// Where journals and console logs for this cluster go.
    pub output_dir: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub retry_interval: Duration,
    pub reboot_attempts: usize,
    pub reboot_interval: Duration,
    pub journal: bool,
    /// `{KEY}` substitutions applied to boot payloads.
    pub bindings: BTreeMap<String, String>,
}

impl RuntimeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            platform: config.kola.platform,
            ssh: SshClient::from_config(&config.ssh),
            output_dir: Some(config.kola.output_dir.clone()),
            startup_timeout: Duration::from_secs(config.ssh.startup_timeout_secs),
            retry_interval: Duration::from_secs(config.ssh.retry_interval_secs.max(1)),
            reboot_attempts: config.reboot.attempts,
            reboot_interval: Duration::from_secs(config.reboot.interval_secs),
            journal: config.ssh.journal,
            bindings: config.kola.bindings.clone(),
        }
    }
}

/// Everything a provider needs to create one cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique, DNS-safe name; machine names are derived from it.
    pub name: String,
    pub runtime: RuntimeConfig,
}

impl ClusterConfig {
    /// Config for a cluster labelled `label` (usually a test name).
    ///
    /// The output directory becomes `<output_dir>/<label>` and the name
    /// `<basename>-<label>-<suffix>`, sanitized for cloud resource names.
    pub fn for_label(config: &Config, label: &str) -> Self {
        let mut runtime = RuntimeConfig::from_config(config);
        runtime.output_dir = runtime.output_dir.map(|dir| dir.join(label));

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = sanitize_name(&format!("{}-{}", config.kola.basename, label), 40);
        Self {
            name: format!("{}-{}", name, &suffix[..8]),
            runtime,
        }
    }
}

/// Lowercases and replaces anything outside `[a-z0-9-]`, capped at `max`.
pub fn sanitize_name(raw: &str, max: usize) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '-' }
        })
        .take(max)
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// Where a cluster is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterPhase {
    Created,
    Populating,
    Running,
    TearingDown,
    Destroyed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::Created => "created",
            ClusterPhase::Populating => "populating",
            ClusterPhase::Running => "running",
            ClusterPhase::TearingDown => "tearing down",
            ClusterPhase::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

struct ClusterState {
    phase: ClusterPhase,
    machines: Vec<Arc<dyn Machine>>,
}

/// Bookkeeping shared by every backend's cluster type.
///
/// Holds the live machine set and the lifecycle phase behind a single lock,
/// so membership changes and the teardown transition are atomic with
/// respect to each other.
pub struct BaseCluster {
    name: String,
    runtime: Arc<RuntimeConfig>,
    state: Mutex<ClusterState>,
}

impl BaseCluster {
    pub fn new(config: &ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            runtime: Arc::new(config.runtime.clone()),
            state: Mutex::new(ClusterState {
                phase: ClusterPhase::Created,
                machines: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime(&self) -> &Arc<RuntimeConfig> {
        &self.runtime
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> ClusterPhase {
        self.lock().phase
    }

    /// Marks the cluster as handed to its test. No-op once teardown began.
    pub fn mark_running(&self) {
        let mut state = self.lock();
        if state.phase < ClusterPhase::Running {
            state.phase = ClusterPhase::Running;
        }
    }

    /// Fresh machine name within this cluster.
    pub fn machine_name(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.name, &suffix[..8])
    }

    /// Renders `payload` with the run's bindings plus this cluster's name.
    pub fn render(&self, payload: &BootPayload) -> BootPayload {
        let mut bindings = self.runtime.bindings.clone();
        bindings
            .entry("CLUSTER".to_string())
            .or_insert_with(|| self.name.clone());
        payload.render(&bindings)
    }

    /// Registers a newly provisioned machine.
    ///
    /// Fails with [`ProviderError::ClusterDestroyed`] once teardown has
    /// started; the caller still owns the instance and must destroy it.
    pub fn add_machine(&self, machine: Arc<dyn Machine>) -> ProviderResult<()> {
        let mut state = self.lock();
        if state.phase >= ClusterPhase::TearingDown {
            return Err(ProviderError::ClusterDestroyed(self.name.clone()));
        }
        if state.phase == ClusterPhase::Created {
            state.phase = ClusterPhase::Populating;
        }
        state.machines.push(machine);
        Ok(())
    }

    /// Removes `id` from the live set. Returns whether it was present.
    pub fn del_machine(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.machines.len();
        state.machines.retain(|m| m.id() != id);
        state.machines.len() != before
    }

    /// Snapshot of the live machines in creation order.
    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.lock().machines.clone()
    }

    /// Per-machine output directory, if output is being kept.
    pub fn machine_dir(&self, id: &str) -> Option<PathBuf> {
        self.runtime.output_dir.as_ref().map(|dir| dir.join(id))
    }

    fn begin_teardown(&self) -> Vec<Arc<dyn Machine>> {
        let mut state = self.lock();
        if state.phase < ClusterPhase::TearingDown {
            state.phase = ClusterPhase::TearingDown;
        }
        state.machines.clone()
    }

    fn finish_teardown(&self) {
        self.lock().phase = ClusterPhase::Destroyed;
    }
}

impl fmt::Debug for BaseCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BaseCluster")
            .field("name", &self.name)
            .field("phase", &state.phase)
            .field("machines", &state.machines.len())
            .finish()
    }
}

/// Partial result of [`Cluster::new_machines`].
///
/// Machines created before the failure stay registered with the cluster
/// and are destroyed with it.
#[derive(Debug, thiserror::Error)]
#[error("created {} of {requested} machines: {source}", .created.len())]
pub struct BatchError {
    pub requested: usize,
    pub created: Vec<Arc<dyn Machine>>,
    #[source]
    pub source: ProviderError,
}

/// One provisioned instance.
///
/// Backends implement identity, teardown and console access; command
/// execution and reboot are shared default methods on top of
/// [`Machine::ssh_target`] and [`Machine::runtime`].
#[async_trait]
pub trait Machine: Send + Sync {
    fn id(&self) -> &str;

    /// Address the harness reaches the machine on.
    fn ip(&self) -> &str;

    /// Address other machines in the cluster reach it on.
    fn private_ip(&self) -> &str;

    fn ssh_target(&self) -> SshTarget;

    fn runtime(&self) -> &RuntimeConfig;

    fn journal(&self) -> &Journal;

    /// Releases the instance and unregisters it from its cluster.
    ///
    /// Calling this on an already destroyed machine is not an error.
    async fn destroy(&self) -> ProviderResult<()>;

    /// Serial console contents, or an empty string when unavailable.
    async fn console_output(&self) -> String;

    async fn ssh(&self, cmd: &str) -> Result<SshOutput, SshError> {
        self.runtime().ssh.run(&self.ssh_target(), cmd).await
    }

    async fn ssh_with_input(&self, cmd: &str, input: &[u8]) -> Result<SshOutput, SshError> {
        self.runtime()
            .ssh
            .run_with_input(&self.ssh_target(), cmd, input)
            .await
    }

    /// Reboots and waits until the machine is reachable on its new boot.
    async fn reboot(&self) -> ProviderResult<()> {
        reboot_machine(self).await
    }
}

impl fmt::Debug for dyn Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id())
            .field("ip", &self.ip())
            .finish()
    }
}

/// A named group of machines owned by one test.
#[async_trait]
pub trait Cluster: Send + Sync {
    fn base(&self) -> &BaseCluster;

    /// Provisions one machine, waits until it is reachable over SSH, and
    /// registers it with the cluster.
    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.base().machines()
    }

    /// Creates `count` machines one after another.
    ///
    /// Stops at the first failure; machines already created remain
    /// registered and are reported in the error.
    async fn new_machines(
        &self,
        payload: &BootPayload,
        count: usize,
    ) -> Result<Vec<Arc<dyn Machine>>, BatchError> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            match self.new_machine(payload).await {
                Ok(machine) => created.push(machine),
                Err(source) => {
                    return Err(BatchError {
                        requested: count,
                        created,
                        source,
                    });
                }
            }
        }
        Ok(created)
    }

    /// Destroys every machine, including ones registered while teardown
    /// is in progress, and returns the errors encountered.
    ///
    /// A machine whose destroy fails is still dropped from the live set
    /// so teardown always terminates; its error is returned for reporting.
    async fn destroy(&self) -> Vec<ProviderError> {
        let base = self.base();
        let mut errors = Vec::new();

        loop {
            let pending = base.begin_teardown();
            if pending.is_empty() {
                break;
            }
            for machine in pending {
                debug!("destroying machine {}", machine.id());
                machine.journal().stop().await;
                if let Err(e) = machine.destroy().await {
                    warn!("failed to destroy machine {}: {}", machine.id(), e);
                    errors.push(e);
                }
                base.del_machine(machine.id());
            }
        }

        base.finish_teardown();
        info!("cluster {} destroyed", base.name());
        errors
    }
}

/// Factory for clusters on one platform.
#[async_trait]
pub trait Provider: Send + Sync {
    type Cluster: Cluster + 'static;

    fn name(&self) -> &str;

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<Self::Cluster>>;
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeCluster, FakeMachine, FakeProvider};
    use super::*;

    fn cluster_config() -> ClusterConfig {
        ClusterConfig::for_label(&Config::default(), "unit")
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("kola-cl.basic.Reachability", 63), "kola-cl-basic-reachability");
        assert_eq!(sanitize_name("a.b.", 10), "a-b");
        assert_eq!(sanitize_name("abcdef", 3), "abc");
    }

    #[test]
    fn test_cluster_name_is_unique_and_labelled() {
        let config = Config::default();
        let a = ClusterConfig::for_label(&config, "docker.torcx");
        let b = ClusterConfig::for_label(&config, "docker.torcx");
        assert!(a.name.starts_with("kola-docker-torcx-"));
        assert_ne!(a.name, b.name);
        assert_eq!(
            a.runtime.output_dir.unwrap(),
            PathBuf::from("_kola_temp/docker.torcx")
        );
    }

    #[test]
    fn test_add_machine_after_teardown_is_rejected() {
        let base = BaseCluster::new(&cluster_config());
        let first: Arc<dyn Machine> = FakeMachine::standalone("m1");
        base.add_machine(first).unwrap();
        assert_eq!(base.phase(), ClusterPhase::Populating);

        let snapshot = base.begin_teardown();
        assert_eq!(snapshot.len(), 1);
        let late: Arc<dyn Machine> = FakeMachine::standalone("m2");
        assert!(matches!(
            base.add_machine(late),
            Err(ProviderError::ClusterDestroyed(_))
        ));
        assert_eq!(base.machines().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_empties_cluster_and_is_idempotent() {
        let provider = FakeProvider::new();
        let cluster = provider.new_cluster(&cluster_config()).await.unwrap();
        cluster
            .new_machines(&BootPayload::empty(), 3)
            .await
            .unwrap();
        assert_eq!(cluster.machines().len(), 3);

        assert!(cluster.destroy().await.is_empty());
        assert!(cluster.machines().is_empty());
        assert_eq!(cluster.base().phase(), ClusterPhase::Destroyed);
        assert_eq!(provider.destroyed().len(), 3);

        // Nothing left to destroy the second time around.
        assert!(cluster.destroy().await.is_empty());
        assert_eq!(provider.destroyed().len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_failure_still_removes_machine() {
        let provider = FakeProvider::new().fail_destroy_of(2);
        let cluster = provider.new_cluster(&cluster_config()).await.unwrap();
        cluster
            .new_machines(&BootPayload::empty(), 3)
            .await
            .unwrap();

        let errors = cluster.destroy().await;
        assert_eq!(errors.len(), 1);
        assert!(cluster.machines().is_empty());
    }

    #[tokio::test]
    async fn test_batch_partial_failure_keeps_created_machines() {
        let provider = FakeProvider::new().fail_create_at(3);
        let cluster = provider.new_cluster(&cluster_config()).await.unwrap();

        let err = cluster
            .new_machines(&BootPayload::empty(), 5)
            .await
            .unwrap_err();
        assert_eq!(err.requested, 5);
        assert_eq!(err.created.len(), 2);
        assert!(matches!(err.source, ProviderError::CreateFailed(_)));
        assert_eq!(cluster.machines().len(), 2);

        assert!(cluster.destroy().await.is_empty());
        assert!(cluster.machines().is_empty());
        assert_eq!(provider.destroyed().len(), 2);
    }

    #[tokio::test]
    async fn test_machine_created_during_teardown_is_destroyed() {
        let provider = FakeProvider::new();
        let cluster: Arc<FakeCluster> = provider.new_cluster(&cluster_config()).await.unwrap();
        cluster.destroy().await;

        let err = cluster.new_machine(&BootPayload::empty()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ClusterDestroyed(_)));
        // The backend released the instance it could not register.
        assert_eq!(provider.destroyed().len(), 1);
        assert!(cluster.machines().is_empty());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout("x".into()).is_transient());
        assert!(ProviderError::Api("throttled".into()).is_transient());
        assert!(!ProviderError::NotFound("i-1".into()).is_transient());
        assert!(!ProviderError::CreateFailed("quota".into()).is_transient());
    }
}
