//! In-memory provider for exercising the harness without real machines.
//!
//! Machines answer a small set of shell commands against a simulated
//! filesystem and boot counter. A non-empty boot payload runs "first boot
//! provisioning" once at creation, which leaves `/etc/ignition-ran` behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::conf::BootPayload;
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::{SshError, SshOutput, SshTarget};

pub(crate) const FIRST_BOOT_MARKER: &str = "/etc/ignition-ran";

#[derive(Default)]
struct Shared {
    created: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
    live_clusters: AtomicUsize,
    max_live_clusters: AtomicUsize,
    clusters_created: AtomicUsize,
}

#[derive(Clone, Default)]
struct Behaviour {
    fail_create_at: Option<usize>,
    fail_destroy_of: Option<usize>,
    fail_cluster: bool,
    unreachable: bool,
    ignore_reboot: bool,
    create_delay: Duration,
    responses: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeProvider {
    shared: Arc<Shared>,
    behaviour: Behaviour,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `n`th machine created (1-based, across clusters) fails.
    pub fn fail_create_at(mut self, n: usize) -> Self {
        self.behaviour.fail_create_at = Some(n);
        self
    }

    /// The `n`th machine created fails to destroy.
    pub fn fail_destroy_of(mut self, n: usize) -> Self {
        self.behaviour.fail_destroy_of = Some(n);
        self
    }

    pub fn fail_cluster_creation(mut self) -> Self {
        self.behaviour.fail_cluster = true;
        self
    }

    /// SSH never answers.
    pub fn unreachable(mut self) -> Self {
        self.behaviour.unreachable = true;
        self
    }

    /// `systemctl reboot` is accepted but nothing happens.
    pub fn ignore_reboot(mut self) -> Self {
        self.behaviour.ignore_reboot = true;
        self
    }

    pub fn create_delay(mut self, delay: Duration) -> Self {
        self.behaviour.create_delay = delay;
        self
    }

    /// Canned stdout for an exact command.
    pub fn respond(mut self, cmd: &str, stdout: &str) -> Self {
        self.behaviour
            .responses
            .insert(cmd.to_string(), stdout.to_string());
        self
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.shared
            .destroyed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn max_live_clusters(&self) -> usize {
        self.shared.max_live_clusters.load(Ordering::SeqCst)
    }

    pub fn live_clusters(&self) -> usize {
        self.shared.live_clusters.load(Ordering::SeqCst)
    }

    pub fn clusters_created(&self) -> usize {
        self.shared.clusters_created.load(Ordering::SeqCst)
    }

    pub fn machines_created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    type Cluster = FakeCluster;

    fn name(&self) -> &str {
        "fake"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<FakeCluster>> {
        if self.behaviour.fail_cluster {
            return Err(ProviderError::Api("simulated quota exhaustion".to_string()));
        }

        let mut config = config.clone();
        config.runtime.journal = false;

        self.shared.clusters_created.fetch_add(1, Ordering::SeqCst);
        let live = self.shared.live_clusters.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared
            .max_live_clusters
            .fetch_max(live, Ordering::SeqCst);

        Ok(Arc::new(FakeCluster {
            base: BaseCluster::new(&config),
            shared: self.shared.clone(),
            behaviour: self.behaviour.clone(),
        }))
    }
}

pub(crate) struct FakeCluster {
    base: Arc<BaseCluster>,
    shared: Arc<Shared>,
    behaviour: Behaviour,
}

impl Drop for FakeCluster {
    fn drop(&mut self) {
        self.shared.live_clusters.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let n = self.shared.created.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.behaviour.create_delay.is_zero() {
            tokio::time::sleep(self.behaviour.create_delay).await;
        }
        if self.behaviour.fail_create_at == Some(n) {
            return Err(ProviderError::CreateFailed(format!(
                "simulated failure creating machine {}",
                n
            )));
        }

        let mut files = BTreeMap::new();
        if !payload.is_empty() {
            files.insert(FIRST_BOOT_MARKER.to_string(), Vec::new());
        }

        let machine = Arc::new(FakeMachine {
            id: format!("{}-{}", self.base.name(), n),
            runtime: self.base.runtime().clone(),
            base: Arc::downgrade(&self.base),
            journal: Journal::default(),
            shared: Some(self.shared.clone()),
            behaviour: self.behaviour.clone(),
            fail_destroy: self.behaviour.fail_destroy_of == Some(n),
            destroyed: AtomicBool::new(false),
            os: Mutex::new(FakeOs { boot: 1, files }),
        });
        commission(&self.base, machine).await
    }
}

struct FakeOs {
    boot: u32,
    files: BTreeMap<String, Vec<u8>>,
}

pub(crate) struct FakeMachine {
    id: String,
    runtime: Arc<RuntimeConfig>,
    base: Weak<BaseCluster>,
    journal: Journal,
    shared: Option<Arc<Shared>>,
    behaviour: Behaviour,
    fail_destroy: bool,
    destroyed: AtomicBool,
    os: Mutex<FakeOs>,
}

impl FakeMachine {
    /// A machine outside any provider or cluster.
    pub fn standalone(id: &str) -> Arc<Self> {
        let config = ClusterConfig::for_label(&crate::config::Config::default(), "standalone");
        Arc::new(Self {
            id: id.to_string(),
            runtime: Arc::new(config.runtime),
            base: Weak::new(),
            journal: Journal::default(),
            shared: None,
            behaviour: Behaviour::default(),
            fail_destroy: false,
            destroyed: AtomicBool::new(false),
            os: Mutex::new(FakeOs {
                boot: 1,
                files: BTreeMap::new(),
            }),
        })
    }

    fn failed(&self, cmd: &str, status: i32, stderr: &str) -> SshError {
        SshError::CommandFailed {
            target: self.id.clone(),
            command: cmd.to_string(),
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn execute(&self, cmd: &str, input: &[u8]) -> Result<SshOutput, SshError> {
        if self.behaviour.unreachable || self.destroyed.load(Ordering::SeqCst) {
            return Err(SshError::Connection {
                target: self.id.clone(),
                message: "Connection refused".to_string(),
            });
        }
        if let Some(stdout) = self.behaviour.responses.get(cmd) {
            return Ok(ok(stdout.as_bytes()));
        }

        let words = shell_words::split(cmd).unwrap_or_default();
        let words: Vec<&str> = words
            .iter()
            .map(String::as_str)
            .filter(|w| *w != "sudo")
            .collect();
        let mut os = self.os.lock().unwrap_or_else(|e| e.into_inner());

        match words.as_slice() {
            ["true"] => Ok(ok(b"")),
            ["false"] => Err(self.failed(cmd, 1, "")),
            ["cat", "/proc/sys/kernel/random/boot_id"] => {
                Ok(ok(format!("boot-{}\n", os.boot).as_bytes()))
            }
            ["systemctl", "reboot"] => {
                if !self.behaviour.ignore_reboot {
                    os.boot += 1;
                }
                Err(SshError::Connection {
                    target: self.id.clone(),
                    message: "Connection closed by remote host".to_string(),
                })
            }
            ["cat", path] => match os.files.get(*path) {
                Some(data) => Ok(ok(data)),
                None => Err(self.failed(cmd, 1, "No such file or directory")),
            },
            ["rm", path] => match os.files.remove(*path) {
                Some(_) => Ok(ok(b"")),
                None => Err(self.failed(cmd, 1, "No such file or directory")),
            },
            ["test", "!", "-e", path] if os.files.contains_key(*path) => {
                Err(self.failed(cmd, 1, ""))
            }
            ["test", "-e", path] if !os.files.contains_key(*path) => Err(self.failed(cmd, 1, "")),
            ["test", ..] => Ok(ok(b"")),
            _ => {
                if let Some(pos) = words.iter().position(|w| *w == "tee") {
                    if let Some(path) = words.get(pos + 1) {
                        os.files.insert(path.to_string(), input.to_vec());
                    }
                }
                Ok(ok(b""))
            }
        }
    }
}

fn ok(stdout: &[u8]) -> SshOutput {
    SshOutput {
        stdout: stdout.to_vec(),
        stderr: Vec::new(),
        status: 0,
    }
}

#[async_trait]
impl Machine for FakeMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        "192.0.2.10"
    }

    fn private_ip(&self) -> &str {
        "10.0.0.10"
    }

    fn ssh_target(&self) -> SshTarget {
        SshTarget::new(self.ip(), 22)
    }

    fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }

    async fn destroy(&self) -> ProviderResult<()> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            if let Some(shared) = &self.shared {
                shared
                    .destroyed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(self.id.clone());
            }
        }
        unregister(&self.base, &self.id);
        if self.fail_destroy {
            return Err(ProviderError::Api(format!(
                "simulated failure destroying {}",
                self.id
            )));
        }
        Ok(())
    }

    async fn console_output(&self) -> String {
        format!("fake console for {}\n", self.id)
    }

    async fn ssh(&self, cmd: &str) -> Result<SshOutput, SshError> {
        self.execute(cmd, &[])
    }

    async fn ssh_with_input(&self, cmd: &str, input: &[u8]) -> Result<SshOutput, SshError> {
        self.execute(cmd, input)
    }
}
