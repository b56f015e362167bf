//! Oracle Cloud Infrastructure instances, driven through the `oci` CLI.
//!
//! OCI answers `NotAuthorizedOrNotFound` both for missing resources and for
//! permission problems, so that response is not treated as "already gone":
//! a terminate that gets it is reported as a teardown error.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::conf::BootPayload;
use crate::config::OciConfig;
use crate::platform::api::CliApi;
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::SshTarget;

pub struct OciProvider {
    api: Arc<CliApi>,
    config: OciConfig,
}

impl OciProvider {
    pub fn new(config: OciConfig, api_concurrency: usize) -> Self {
        let api = CliApi::new("oci")
            .with_trailing_args(["--profile", config.profile.as_str()])
            .with_concurrency(api_concurrency);
        Self {
            api: Arc::new(api),
            config,
        }
    }
}

#[async_trait]
impl Provider for OciProvider {
    type Cluster = OciCluster;

    fn name(&self) -> &str {
        "oci"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<OciCluster>> {
        Ok(Arc::new(OciCluster {
            base: BaseCluster::new(config),
            api: self.api.clone(),
            config: self.config.clone(),
        }))
    }
}

pub struct OciCluster {
    base: Arc<BaseCluster>,
    api: Arc<CliApi>,
    config: OciConfig,
}

#[derive(Deserialize)]
struct Response<T> {
    data: T,
}

#[derive(Deserialize)]
struct Instance {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Vnic {
    public_ip: Option<String>,
    private_ip: Option<String>,
    #[serde(default)]
    is_primary: bool,
}

#[derive(Deserialize)]
struct ConsoleHistory {
    id: String,
}

async fn terminate(api: &CliApi, id: &str) -> ProviderResult<()> {
    api.run(&[
        "compute",
        "instance",
        "terminate",
        "--instance-id",
        id,
        "--force",
    ])
    .await
    .map(|_| ())
}

#[async_trait]
impl Cluster for OciCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let name = self.base.machine_name();
        let payload = self.base.render(payload);
        let metadata = if payload.is_empty() {
            None
        } else {
            let encoded = base64::engine::general_purpose::STANDARD.encode(payload.data());
            Some(serde_json::json!({ "user_data": encoded }).to_string())
        };

        let mut args = vec![
            "compute",
            "instance",
            "launch",
            "--compartment-id",
            self.config.compartment_id.as_str(),
            "--availability-domain",
            self.config.availability_domain.as_str(),
            "--shape",
            self.config.shape.as_str(),
            "--image-id",
            self.config.image_id.as_str(),
            "--subnet-id",
            self.config.subnet_id.as_str(),
            "--assign-public-ip",
            "true",
            "--display-name",
            name.as_str(),
            "--wait-for-state",
            "RUNNING",
        ];
        if let Some(metadata) = &metadata {
            args.extend(["--metadata", metadata.as_str()]);
        }

        let launched: Response<Instance> = self.api.run_json(&args).await?;
        let id = launched.data.id;
        info!("launched OCI instance {} ({})", id, name);

        let vnics: ProviderResult<Response<Vec<Vnic>>> = self
            .api
            .run_json(&["compute", "instance", "list-vnics", "--instance-id", &id])
            .await;
        let addresses = vnics.and_then(|vnics| {
            let mut vnics = vnics.data;
            vnics.sort_by_key(|v| !v.is_primary);
            let vnic = vnics.into_iter().next();
            match vnic {
                Some(Vnic {
                    public_ip: Some(public),
                    private_ip: Some(private),
                    ..
                }) => Ok((public, private)),
                _ => Err(ProviderError::CreateFailed(format!(
                    "instance {} has no public address",
                    id
                ))),
            }
        });

        let (ip, private_ip) = match addresses {
            Ok(addresses) => addresses,
            Err(e) => {
                if let Err(te) = terminate(&self.api, &id).await {
                    warn!("failed to terminate {} after launch error: {}", id, te);
                }
                return Err(e);
            }
        };

        let machine = Arc::new(OciMachine {
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

pub struct OciMachine {
    id: String,
    ip: String,
    private_ip: String,
    target: SshTarget,
    cluster: Weak<BaseCluster>,
    api: Arc<CliApi>,
    runtime: Arc<RuntimeConfig>,
    journal: Journal,
}

impl OciMachine {
    async fn capture_console(&self) -> ProviderResult<String> {
        let history: Response<ConsoleHistory> = self
            .api
            .run_json(&[
                "compute",
                "console-history",
                "capture",
                "--instance-id",
                &self.id,
                "--wait-for-state",
                "SUCCEEDED",
            ])
            .await?;
        let history_id = history.data.id;

        let content = self
            .api
            .run(&[
                "compute",
                "console-history",
                "get-content",
                "--instance-console-history-id",
                &history_id,
                "--file",
                "-",
            ])
            .await;

        if let Err(e) = self
            .api
            .run(&[
                "compute",
                "console-history",
                "delete",
                "--instance-console-history-id",
                &history_id,
                "--force",
            ])
            .await
        {
            debug!("could not delete console history {}: {}", history_id, e);
        }
        content
    }
}

#[async_trait]
impl Machine for OciMachine {
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
        let result = terminate(&self.api, &self.id).await;
        unregister(&self.cluster, &self.id);
        result
    }

    async fn console_output(&self) -> String {
        match self.capture_console().await {
            Ok(content) => content,
            Err(e) => {
                warn!("could not fetch console of {}: {}", self.id, e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_vnic_first() {
        let json = r#"{"data": [
            {"public-ip": null, "private-ip": "10.0.1.9", "is-primary": false},
            {"public-ip": "129.146.0.1", "private-ip": "10.0.0.5", "is-primary": true}
        ]}"#;
        let mut vnics: Response<Vec<Vnic>> = serde_json::from_str(json).unwrap();
        vnics.data.sort_by_key(|v| !v.is_primary);
        assert_eq!(vnics.data[0].public_ip.as_deref(), Some("129.146.0.1"));
        assert_eq!(vnics.data[0].private_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_launch_response() {
        let json = r#"{"data": {"id": "ocid1.instance.oc1..aaaa", "lifecycle-state": "RUNNING"}}"#;
        let launched: Response<Instance> = serde_json::from_str(json).unwrap();
        assert_eq!(launched.data.id, "ocid1.instance.oc1..aaaa");
    }
}
