//! DigitalOcean droplets, driven through `doctl`.

use std::io::Write;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::conf::BootPayload;
use crate::config::DoConfig;
use crate::platform::api::{CliApi, ignore_not_found};
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::SshTarget;

pub struct DoProvider {
    api: Arc<CliApi>,
    config: DoConfig,
}

impl DoProvider {
    pub fn new(config: DoConfig, api_concurrency: usize) -> Self {
        let mut api = CliApi::new("doctl")
            .with_concurrency(api_concurrency)
            .with_not_found_marker("404");
        if let Some(token) = &config.access_token {
            api = api.with_env("DIGITALOCEAN_ACCESS_TOKEN", token.clone());
        }
        if let Some(profile) = &config.profile {
            api = api.with_trailing_args(["--context", profile.as_str()]);
        }
        Self {
            api: Arc::new(api),
            config,
        }
    }
}

#[async_trait]
impl Provider for DoProvider {
    type Cluster = DoCluster;

    fn name(&self) -> &str {
        "do"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<DoCluster>> {
        Ok(Arc::new(DoCluster {
            base: BaseCluster::new(config),
            api: self.api.clone(),
            config: self.config.clone(),
        }))
    }
}

pub struct DoCluster {
    base: Arc<BaseCluster>,
    api: Arc<CliApi>,
    config: DoConfig,
}

#[derive(Deserialize)]
struct Droplet {
    id: u64,
    networks: Networks,
}

#[derive(Deserialize, Default)]
struct Networks {
    #[serde(default)]
    v4: Vec<Address>,
}

#[derive(Deserialize)]
struct Address {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Droplet {
    fn address(&self, kind: &str) -> Option<String> {
        self.networks
            .v4
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.ip_address.clone())
    }
}

#[async_trait]
impl Cluster for DoCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let name = self.base.machine_name();
        let payload = self.base.render(payload);

        let mut userdata = tempfile::NamedTempFile::new()?;
        userdata.write_all(payload.data())?;
        let userdata_path = userdata.path().to_string_lossy().into_owned();
        let keys = self.config.ssh_key_ids.join(",");

        let mut args = vec![
            "compute",
            "droplet",
            "create",
            name.as_str(),
            "--region",
            self.config.region.as_str(),
            "--size",
            self.config.size.as_str(),
            "--image",
            self.config.image.as_str(),
            "--enable-private-networking",
            "--wait",
            "--output",
            "json",
        ];
        if !keys.is_empty() {
            args.extend(["--ssh-keys", keys.as_str()]);
        }
        if !payload.is_empty() {
            args.extend(["--user-data-file", userdata_path.as_str()]);
        }

        // --wait returns once the droplet is active with addresses assigned.
        let droplets: Vec<Droplet> = self.api.run_json(&args).await?;
        let droplet = droplets.into_iter().next().ok_or_else(|| {
            ProviderError::CreateFailed("droplet create returned no droplet".into())
        })?;
        let id = droplet.id.to_string();
        info!("created droplet {} ({})", id, name);

        let Some(ip) = droplet.address("public") else {
            ignore_not_found(self.api.run(&["compute", "droplet", "delete", &id, "--force"]).await)?;
            return Err(ProviderError::CreateFailed(format!(
                "droplet {} has no public address",
                id
            )));
        };
        let private_ip = droplet.address("private").unwrap_or_else(|| ip.clone());

        let machine = Arc::new(DoMachine {
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

pub struct DoMachine {
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
impl Machine for DoMachine {
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
                .run(&["compute", "droplet", "delete", &self.id, "--force"])
                .await,
        );
        unregister(&self.cluster, &self.id);
        result
    }

    /// DigitalOcean has no API for console history.
    async fn console_output(&self) -> String {
        String::new()
    }
}
