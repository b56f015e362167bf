//! Google Compute Engine instances, driven through `gcloud`.

use std::io::Write;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::conf::BootPayload;
use crate::config::GceConfig;
use crate::platform::api::{CliApi, ignore_not_found};
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::SshTarget;

pub struct GceProvider {
    api: Arc<CliApi>,
    config: GceConfig,
}

impl GceProvider {
    pub fn new(config: GceConfig, api_concurrency: usize) -> Self {
        let mut api = CliApi::new("gcloud")
            .with_trailing_args([
                "--project",
                config.project.as_str(),
                "--zone",
                config.zone.as_str(),
                "--quiet",
            ])
            .with_concurrency(api_concurrency)
            .with_not_found_marker("was not found");
        if let Some(key) = &config.json_key {
            api = api.with_env(
                "CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE",
                key.to_string_lossy().into_owned(),
            );
        }
        Self {
            api: Arc::new(api),
            config,
        }
    }
}

#[async_trait]
impl Provider for GceProvider {
    type Cluster = GceCluster;

    fn name(&self) -> &str {
        "gce"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<GceCluster>> {
        Ok(Arc::new(GceCluster {
            base: BaseCluster::new(config),
            api: self.api.clone(),
            config: self.config.clone(),
        }))
    }
}

pub struct GceCluster {
    base: Arc<BaseCluster>,
    api: Arc<CliApi>,
    config: GceConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    name: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

impl Instance {
    fn addresses(&self) -> Option<(String, String)> {
        let nic = self.network_interfaces.first()?;
        let private = nic.network_ip.clone()?;
        let public = nic
            .access_configs
            .iter()
            .find_map(|c| c.nat_ip.clone())?;
        Some((public, private))
    }
}

#[async_trait]
impl Cluster for GceCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let name = self.base.machine_name();
        let payload = self.base.render(payload);

        let mut userdata = tempfile::NamedTempFile::new()?;
        userdata.write_all(payload.data())?;
        let metadata = format!("user-data={}", userdata.path().display());

        let mut args = vec![
            "compute",
            "instances",
            "create",
            name.as_str(),
            "--machine-type",
            self.config.machine_type.as_str(),
            "--image",
            self.config.image.as_str(),
            "--boot-disk-type",
            self.config.disk_type.as_str(),
            "--network",
            self.config.network.as_str(),
            "--format",
            "json",
        ];
        if !payload.is_empty() {
            args.extend(["--metadata-from-file", metadata.as_str()]);
        }

        let created: Vec<Instance> = self.api.run_json(&args).await?;
        let instance = created.into_iter().next().ok_or_else(|| {
            ProviderError::CreateFailed("instances create returned no instance".into())
        })?;
        info!("created GCE instance {}", instance.name);

        let Some((ip, private_ip)) = instance.addresses() else {
            if let Err(e) = ignore_not_found(
                self.api
                    .run(&["compute", "instances", "delete", &instance.name])
                    .await,
            ) {
                warn!("failed to delete {} after create: {}", instance.name, e);
            }
            return Err(ProviderError::CreateFailed(format!(
                "instance {} has no external address",
                instance.name
            )));
        };

        let machine = Arc::new(GceMachine {
            target: self.base.runtime().ssh.target(ip.clone()),
            id: instance.name,
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

pub struct GceMachine {
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
impl Machine for GceMachine {
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
                .run(&["compute", "instances", "delete", &self.id])
                .await,
        );
        unregister(&self.cluster, &self.id);
        result
    }

    async fn console_output(&self) -> String {
        match self
            .api
            .run(&["compute", "instances", "get-serial-port-output", &self.id])
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("could not fetch console of {}: {}", self.id, e);
                String::new()
            }
        }
    }
}
