//! Local QEMU virtual machines.
//!
//! Every machine is a `qemu-system-*` child process booting the configured
//! disk image in snapshot mode, so the image on disk is never modified and
//! any number of machines can share it. Networking is QEMU's user-mode
//! stack: the guest's SSH port is forwarded to a free port on 127.0.0.1,
//! and every guest sees itself as 10.0.2.15.
//!
//! The boot payload is passed through the firmware config device, where
//! the guest's first-boot agent looks for it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rand::Rng;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::conf::BootPayload;
use crate::config::QemuConfig;
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::SshTarget;

const FW_CFG_NAME: &str = "opt/org.flatcar-linux/config";
const GUEST_ADDRESS: &str = "10.0.2.15";

pub struct QemuProvider {
    config: QemuConfig,
    board: String,
}

impl QemuProvider {
    pub fn new(config: QemuConfig, board: &str) -> Self {
        Self {
            config,
            board: board.to_string(),
        }
    }
}

#[async_trait]
impl Provider for QemuProvider {
    type Cluster = QemuCluster;

    fn name(&self) -> &str {
        "qemu"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<QemuCluster>> {
        let disk = self.config.disk_image(&self.board);
        if !disk.exists() {
            return Err(ProviderError::NotFound(format!(
                "disk image {}",
                disk.display()
            )));
        }
        Ok(Arc::new(QemuCluster {
            base: BaseCluster::new(config),
            config: self.config.clone(),
            board: self.board.clone(),
        }))
    }
}

pub struct QemuCluster {
    base: Arc<BaseCluster>,
    config: QemuConfig,
    board: String,
}

/// Locally administered unicast MAC in QEMU's OUI.
fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.r#gen::<u8>(),
        rng.r#gen::<u8>(),
        rng.r#gen::<u8>()
    )
}

/// Asks the kernel for an unused local TCP port.
fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

struct QemuArgs<'a> {
    config: &'a QemuConfig,
    board: &'a str,
    name: &'a str,
    ssh_port: u16,
    mac: &'a str,
    console: &'a Path,
    payload: Option<&'a Path>,
}

impl QemuArgs<'_> {
    fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |a: &str, b: String| {
            args.push(a.to_string());
            args.push(b);
        };

        match self.board {
            "arm64-usr" => {
                push("-machine", "virt,accel=kvm:tcg".to_string());
                push("-cpu", "max".to_string());
            }
            _ => push("-machine", "accel=kvm:tcg".to_string()),
        }
        push("-m", self.config.memory_mb.to_string());
        push("-smp", self.config.cpus.to_string());
        push("-bios", self.config.bios_image(self.board).display().to_string());
        push(
            "-drive",
            format!(
                "if=virtio,file={},cache=unsafe",
                self.config.disk_image(self.board).display()
            ),
        );
        push(
            "-netdev",
            format!(
                "user,id=eth0,hostname={},hostfwd=tcp:127.0.0.1:{}-:22",
                self.name, self.ssh_port
            ),
        );
        push(
            "-device",
            format!("virtio-net-pci,netdev=eth0,mac={}", self.mac),
        );
        push("-serial", format!("file:{}", self.console.display()));
        push("-display", "none".to_string());
        push("-monitor", "none".to_string());
        if let Some(payload) = self.payload {
            push(
                "-fw_cfg",
                format!("name={},file={}", FW_CFG_NAME, payload.display()),
            );
        }
        args.push("-snapshot".to_string());
        args
    }
}

#[async_trait]
impl Cluster for QemuCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let id = uuid::Uuid::new_v4().to_string();
        let payload = self.base.render(payload);

        let dir = tempfile::Builder::new().prefix("kola-qemu-").tempdir()?;
        let console = dir.path().join("console.txt");
        let config_path = dir.path().join("config");
        let payload_path = if payload.is_empty() {
            None
        } else {
            payload.write_to(&config_path).await?;
            Some(config_path.as_path())
        };

        let ssh_port = free_port()?;
        let mac = random_mac();
        let name = self.base.machine_name();
        let args = QemuArgs {
            config: &self.config,
            board: &self.board,
            name: &name,
            ssh_port,
            mac: &mac,
            console: &console,
            payload: payload_path,
        }
        .build();

        let binary = self.config.binary(&self.board);
        debug!("{} {}", binary, args.join(" "));
        let child = tokio::process::Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::CreateFailed(format!("starting {}: {}", binary, e)))?;
        info!("started qemu machine {} (ssh on port {})", id, ssh_port);

        let machine = Arc::new(QemuMachine {
            target: SshTarget::new("127.0.0.1", ssh_port),
            id,
            console,
            process: Mutex::new(Some(child)),
            dir: Mutex::new(Some(dir)),
            cluster: Arc::downgrade(&self.base),
            runtime: self.base.runtime().clone(),
            journal: Journal::default(),
        });
        commission(&self.base, machine).await
    }
}

pub struct QemuMachine {
    id: String,
    target: SshTarget,
    console: PathBuf,
    process: Mutex<Option<Child>>,
    dir: Mutex<Option<tempfile::TempDir>>,
    cluster: Weak<BaseCluster>,
    runtime: Arc<RuntimeConfig>,
    journal: Journal,
}

#[async_trait]
impl Machine for QemuMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        "127.0.0.1"
    }

    /// Every guest sees itself as the same user-mode address, and no guest
    /// can reach another one: QEMU machines in a cluster are isolated.
    fn private_ip(&self) -> &str {
        GUEST_ADDRESS
    }

    fn ssh_target(&self) -> SshTarget {
        self.target.clone()
    }

    fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }

    async fn destroy(&self) -> ProviderResult<()> {
        self.journal.stop().await;

        let child = self.process.lock().await.take();
        let result = match child {
            Some(mut child) => {
                // An emulator that already exited is fine; kill only fails then.
                if let Err(e) = child.start_kill() {
                    debug!("qemu for {} already gone: {}", self.id, e);
                }
                child.wait().await.map(|_| ()).map_err(ProviderError::Io)
            }
            None => Ok(()),
        };

        // Dropping the tempdir removes the payload and console log.
        if let Some(dir) = self.dir.lock().await.take() {
            if let Err(e) = dir.close() {
                warn!("could not remove scratch dir of {}: {}", self.id, e);
            }
        }

        unregister(&self.cluster, &self.id);
        result
    }

    async fn console_output(&self) -> String {
        tokio::fs::read_to_string(&self.console)
            .await
            .unwrap_or_default()
    }
}
