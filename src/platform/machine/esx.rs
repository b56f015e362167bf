//! VMware ESXi/vSphere virtual machines, driven through `govc`.
//!
//! Each machine is a clone of a template VM. The boot payload is passed in
//! base64 through `guestinfo` properties, which the guest's first-boot
//! agent reads from VMware tools.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use base64::Engine;
use tracing::{info, warn};

use crate::conf::BootPayload;
use crate::config::EsxConfig;
use crate::platform::api::{CliApi, ignore_not_found};
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::SshTarget;

pub struct EsxProvider {
    api: Arc<CliApi>,
    config: EsxConfig,
}

impl EsxProvider {
    pub fn new(config: EsxConfig, api_concurrency: usize) -> anyhow::Result<Self> {
        let mut api = CliApi::new("govc")
            .with_concurrency(api_concurrency)
            .with_env("GOVC_URL", config.server.clone())
            .with_not_found_marker("not found");
        if config.insecure {
            api = api.with_env("GOVC_INSECURE", "1");
        }
        if let Some(path) = &config.config_file {
            for (key, value) in read_env_file(path)? {
                api = api.with_env(key, value);
            }
        }
        Ok(Self {
            api: Arc::new(api),
            config,
        })
    }
}

/// Parses `KEY=VALUE` lines, skipping blanks and `#` comments.
fn read_env_file(path: &std::path::Path) -> anyhow::Result<Vec<(String, String)>> {
    use anyhow::Context;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read esx config file: {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect())
}

/// guestinfo key the payload is stored under.
fn guestinfo_key(payload: &BootPayload) -> &'static str {
    if payload.kind().is_ignition_like() {
        "guestinfo.ignition.config.data"
    } else {
        "guestinfo.coreos.config.data"
    }
}

#[async_trait]
impl Provider for EsxProvider {
    type Cluster = EsxCluster;

    fn name(&self) -> &str {
        "esx"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<EsxCluster>> {
        Ok(Arc::new(EsxCluster {
            base: BaseCluster::new(config),
            api: self.api.clone(),
            config: self.config.clone(),
        }))
    }
}

pub struct EsxCluster {
    base: Arc<BaseCluster>,
    api: Arc<CliApi>,
    config: EsxConfig,
}

impl EsxCluster {
    async fn provision(&self, name: &str, payload: &BootPayload) -> ProviderResult<String> {
        if !payload.is_empty() {
            let key = guestinfo_key(payload);
            let data = format!(
                "{}={}",
                key,
                base64::engine::general_purpose::STANDARD.encode(payload.data())
            );
            let encoding = format!("{}.encoding=base64", key);
            self.api
                .run(&["vm.change", "-vm", name, "-e", &data, "-e", &encoding])
                .await?;
        }
        self.api.run(&["vm.power", "-on", name]).await?;
        let ip = self.api.run(&["vm.ip", "-v4", "-wait", "5m", name]).await?;
        let ip = ip.trim();
        if ip.is_empty() {
            return Err(ProviderError::CreateFailed(format!(
                "vm {} reported no address",
                name
            )));
        }
        Ok(ip.to_string())
    }
}

#[async_trait]
impl Cluster for EsxCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let name = self.base.machine_name();
        let payload = self.base.render(payload);

        self.api
            .run(&["vm.clone", "-vm", &self.config.base_vm, "-on=false", &name])
            .await
            .map_err(|e| ProviderError::CreateFailed(format!("cloning {}: {}", name, e)))?;
        info!("cloned {} from {}", name, self.config.base_vm);

        let ip = match self.provision(&name, &payload).await {
            Ok(ip) => ip,
            Err(e) => {
                if let Err(de) = ignore_not_found(self.api.run(&["vm.destroy", &name]).await) {
                    warn!("failed to destroy {} after provisioning error: {}", name, de);
                }
                return Err(e);
            }
        };

        let machine = Arc::new(EsxMachine {
            target: self.base.runtime().ssh.target(ip.clone()),
            id: name,
            private_ip: ip.clone(),
            ip,
            cluster: Arc::downgrade(&self.base),
            api: self.api.clone(),
            runtime: self.base.runtime().clone(),
            journal: Journal::default(),
        });
        commission(&self.base, machine).await
    }
}

pub struct EsxMachine {
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
impl Machine for EsxMachine {
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
        let result = ignore_not_found(self.api.run(&["vm.destroy", &self.id]).await);
        unregister(&self.cluster, &self.id);
        result
    }

    async fn console_output(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guestinfo_key_by_kind() {
        assert_eq!(
            guestinfo_key(&BootPayload::ignition("{}")),
            "guestinfo.ignition.config.data"
        );
        assert_eq!(
            guestinfo_key(&BootPayload::cloud_config("#cloud-config")),
            "guestinfo.coreos.config.data"
        );
    }

    #[test]
    fn test_read_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esx.env");
        std::fs::write(
            &path,
            "# vcenter\nGOVC_USERNAME=admin\n\nGOVC_DATASTORE = ds1\nbogus\n",
        )
        .unwrap();
        assert_eq!(
            read_env_file(&path).unwrap(),
            vec![
                ("GOVC_USERNAME".to_string(), "admin".to_string()),
                ("GOVC_DATASTORE".to_string(), "ds1".to_string()),
            ]
        );
    }
}
