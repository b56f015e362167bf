//! Bare-metal devices on Equinix Metal (formerly Packet), driven through
//! the `metal` CLI.
//!
//! Devices boot a custom iPXE script that installs the OS and then hands
//! the boot payload to it as user data. Provisioning takes minutes, so
//! creation polls the device state until it is active.

use std::io::Write;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::conf::BootPayload;
use crate::config::PacketConfig;
use crate::platform::api::{CliApi, ignore_not_found};
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::SshTarget;
use crate::util;

/// Device state polls before giving up (at the run's retry interval).
const ACTIVE_POLL_ATTEMPTS: usize = 180;

pub struct PacketProvider {
    api: Arc<CliApi>,
    config: PacketConfig,
    board: String,
}

impl PacketProvider {
    pub fn new(config: PacketConfig, board: &str, api_concurrency: usize) -> Self {
        let mut api = CliApi::new("metal")
            .with_concurrency(api_concurrency)
            .with_not_found_marker("404");
        if let Some(key) = &config.api_key {
            api = api.with_env("METAL_AUTH_TOKEN", key.clone());
        }
        if let Some(profile) = &config.profile {
            api = api.with_trailing_args(["--config", profile.as_str()]);
        }
        Self {
            api: Arc::new(api),
            config,
            board: board.to_string(),
        }
    }
}

#[async_trait]
impl Provider for PacketProvider {
    type Cluster = PacketCluster;

    fn name(&self) -> &str {
        "packet"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<PacketCluster>> {
        Ok(Arc::new(PacketCluster {
            base: BaseCluster::new(config),
            api: self.api.clone(),
            config: self.config.clone(),
            board: self.board.clone(),
        }))
    }
}

pub struct PacketCluster {
    base: Arc<BaseCluster>,
    api: Arc<CliApi>,
    config: PacketConfig,
    board: String,
}

#[derive(Deserialize)]
struct Device {
    id: String,
    state: String,
    #[serde(default)]
    ip_addresses: Vec<IpAddress>,
}

#[derive(Deserialize)]
struct IpAddress {
    address: String,
    address_family: u8,
    public: bool,
}

impl Device {
    fn address(&self, public: bool) -> Option<String> {
        self.ip_addresses
            .iter()
            .find(|a| a.address_family == 4 && a.public == public)
            .map(|a| a.address.clone())
    }
}

impl PacketCluster {
    async fn get(&self, id: &str) -> ProviderResult<Device> {
        self.api
            .run_json(&["device", "get", "--id", id, "--output", "json"])
            .await
    }

    async fn wait_active(&self, id: &str) -> ProviderResult<(String, String)> {
        let interval = self.base.runtime().retry_interval;
        let device = util::retry(ACTIVE_POLL_ATTEMPTS, interval, || async move {
            let device = self.get(id).await?;
            debug!("device {} is {}", id, device.state);
            match device.state.as_str() {
                "active" | "failed" => Ok(device),
                state => Err(ProviderError::Timeout(format!(
                    "device {} still {}",
                    id, state
                ))),
            }
        })
        .await?;
        if device.state == "failed" {
            return Err(ProviderError::CreateFailed(format!(
                "device {} failed to provision",
                id
            )));
        }

        let public = device.address(true).ok_or_else(|| {
            ProviderError::CreateFailed(format!("device {} has no public IPv4", id))
        })?;
        let private = device.address(false).unwrap_or_else(|| public.clone());
        Ok((public, private))
    }
}

#[async_trait]
impl Cluster for PacketCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let name = self.base.machine_name();
        let payload = self.base.render(payload);

        let mut userdata = tempfile::NamedTempFile::new()?;
        userdata.write_all(payload.data())?;
        let userdata_path = userdata.path().to_string_lossy().into_owned();
        let ipxe = self.config.ipxe_script_url(&self.board);

        let mut args = vec![
            "device",
            "create",
            "--project-id",
            self.config.project.as_str(),
            "--facility",
            self.config.facility(),
            "--plan",
            self.config.plan(&self.board),
            "--hostname",
            name.as_str(),
            "--operating-system",
            "custom_ipxe",
            "--ipxe-script-url",
            ipxe.as_str(),
            "--output",
            "json",
        ];
        if !payload.is_empty() {
            args.extend(["--userdata-file", userdata_path.as_str()]);
        }

        let device: Device = self.api.run_json(&args).await?;
        let id = device.id;
        info!("created device {} ({})", id, name);

        let (ip, private_ip) = match self.wait_active(&id).await {
            Ok(addresses) => addresses,
            Err(e) => {
                if let Err(de) = ignore_not_found(
                    self.api
                        .run(&["device", "delete", "--id", &id, "--force"])
                        .await,
                ) {
                    warn!("failed to delete device {} after error: {}", id, de);
                }
                return Err(e);
            }
        };

        let machine = Arc::new(PacketMachine {
            target: self.base.runtime().ssh.target(ip.clone()),
            id,
            ip,
            private_ip,
            cluster: Arc::downgrade(&self.base),
            api: self.api.clone(),
            runtime: self.base.runtime().clone(),
            journal: Journal::default(),
        });
        commission(&self.base, machine).await
    }
}

pub struct PacketMachine {
    id: String,
    ip: String,
    private_ip: String,
    target: SshTarget,
    cluster: Weak<BaseCluster>,
    api: Arc<CliApi>,
    runtime: Arc<RuntimeConfig>,
    journal: Journal,
}

#[async_trait]
impl Machine for PacketMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    fn private_ip(&self) -> &str {
        &self.private_ip
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
        let result = ignore_not_found(
            self.api
                .run(&["device", "delete", "--id", &self.id, "--force"])
                .await,
        );
        unregister(&self.cluster, &self.id);
        result
    }

    /// The serial-over-SSH console is not captured.
    async fn console_output(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_addresses() {
        let json = r#"{
            "id": "7b1c-44",
            "state": "active",
            "ip_addresses": [
                {"address": "2604:1380::1", "address_family": 6, "public": true},
                {"address": "147.75.1.2", "address_family": 4, "public": true},
                {"address": "10.88.0.3", "address_family": 4, "public": false}
            ]
        }"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert_eq!(device.address(true).as_deref(), Some("147.75.1.2"));
        assert_eq!(device.address(false).as_deref(), Some("10.88.0.3"));
    }

    #[test]
    fn test_provisioning_device_has_no_addresses() {
        let device: Device =
            serde_json::from_str(r#"{"id": "x", "state": "provisioning"}"#).unwrap();
        assert!(device.address(true).is_none());
    }
}
