//! Amazon EC2 instances, driven through the `aws` CLI.
//!
//! `ami` may name a release channel (`alpha`, `beta`, `stable`) instead of
//! an image id. The channel is resolved once per run to the newest image
//! published by `ami_owner` for the board's architecture, before the first
//! cluster is handed out.

use std::io::Write;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::conf::BootPayload;
use crate::config::{AwsConfig, is_release_channel};
use crate::platform::api::{CliApi, ignore_not_found};
use crate::platform::machine::{commission, unregister};
use crate::platform::{
    BaseCluster, Cluster, ClusterConfig, Journal, Machine, Provider, ProviderError,
    ProviderResult, RuntimeConfig,
};
use crate::ssh::SshTarget;

pub struct AwsProvider {
    api: Arc<CliApi>,
    config: AwsConfig,
    /// EC2 architecture name for the board.
    architecture: &'static str,
    resolved_ami: OnceCell<String>,
}

impl AwsProvider {
    pub fn new(config: AwsConfig, board: &str, api_concurrency: usize) -> Self {
        let mut api = CliApi::new("aws")
            .with_trailing_args([
                "--region",
                config.region.as_str(),
                "--profile",
                config.profile.as_str(),
                "--output",
                "json",
            ])
            .with_concurrency(api_concurrency)
            .with_not_found_marker("InvalidInstanceID.NotFound");
        if let Some(path) = &config.credentials_file {
            api = api.with_env(
                "AWS_SHARED_CREDENTIALS_FILE",
                path.to_string_lossy().into_owned(),
            );
        }
        Self::with_api(config, board, api)
    }

    fn with_api(config: AwsConfig, board: &str, api: CliApi) -> Self {
        let architecture = if board.starts_with("arm64") {
            "arm64"
        } else {
            "x86_64"
        };
        Self {
            api: Arc::new(api),
            config,
            architecture,
            resolved_ami: OnceCell::new(),
        }
    }

    /// The AMI id to launch, resolving a release channel on first use.
    async fn ami(&self) -> ProviderResult<String> {
        let channel = self.config.ami.as_str();
        if !is_release_channel(channel) {
            return Ok(self.config.ami.clone());
        }
        let ami = self
            .resolved_ami
            .get_or_try_init(|| async {
                let name = format!("Name=name,Values=Flatcar-{}-*", channel);
                let arch = format!("Name=architecture,Values={}", self.architecture);
                let found: DescribeImages = self
                    .api
                    .run_json(&[
                        "ec2",
                        "describe-images",
                        "--owners",
                        self.config.ami_owner.as_str(),
                        "--filters",
                        name.as_str(),
                        arch.as_str(),
                        "Name=virtualization-type,Values=hvm",
                    ])
                    .await?;
                let ami = newest_image(found.images).ok_or_else(|| {
                    ProviderError::NotFound(format!(
                        "no {} {} AMI owned by {}",
                        channel, self.architecture, self.config.ami_owner
                    ))
                })?;
                info!("resolved AMI channel {} to {}", channel, ami);
                Ok::<_, ProviderError>(ami)
            })
            .await?;
        Ok(ami.clone())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImages {
    images: Vec<Image>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Image {
    image_id: String,
    creation_date: String,
}

/// The most recently created image. Creation dates are ISO 8601, so they
/// order lexically.
fn newest_image(images: Vec<Image>) -> Option<String> {
    images
        .into_iter()
        .max_by(|a, b| a.creation_date.cmp(&b.creation_date))
        .map(|image| image.image_id)
}

#[async_trait]
impl Provider for AwsProvider {
    type Cluster = AwsCluster;

    fn name(&self) -> &str {
        "aws"
    }

    async fn new_cluster(&self, config: &ClusterConfig) -> ProviderResult<Arc<AwsCluster>> {
        let ami = self.ami().await?;
        Ok(Arc::new(AwsCluster {
            base: BaseCluster::new(config),
            api: self.api.clone(),
            config: self.config.clone(),
            ami,
        }))
    }
}

pub struct AwsCluster {
    base: Arc<BaseCluster>,
    api: Arc<CliApi>,
    config: AwsConfig,
    ami: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstances {
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsoleOutput {
    output: Option<String>,
}

impl AwsCluster {
    async fn describe(&self, id: &str) -> ProviderResult<Instance> {
        let described: DescribeInstances = self
            .api
            .run_json(&["ec2", "describe-instances", "--instance-ids", id])
            .await?;
        described
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", id)))
    }

    async fn terminate(&self, id: &str) -> ProviderResult<()> {
        ignore_not_found(
            self.api
                .run(&["ec2", "terminate-instances", "--instance-ids", id])
                .await,
        )
    }

    async fn launch(&self, name: &str, payload: &BootPayload) -> ProviderResult<Instance> {
        let mut userdata = tempfile::NamedTempFile::new()?;
        userdata.write_all(payload.data())?;
        let userdata_arg = format!("file://{}", userdata.path().display());
        let tags = format!("ResourceType=instance,Tags=[{{Key=Name,Value={}}}]", name);
        let iam = format!("Name={}", self.config.iam_profile);

        let mut args = vec![
            "ec2",
            "run-instances",
            "--image-id",
            self.ami.as_str(),
            "--instance-type",
            self.config.instance_type.as_str(),
            "--security-groups",
            self.config.security_group.as_str(),
            "--iam-instance-profile",
            iam.as_str(),
            "--count",
            "1",
            "--tag-specifications",
            tags.as_str(),
        ];
        if !payload.is_empty() {
            args.extend(["--user-data", userdata_arg.as_str()]);
        }

        let launched: RunInstances = self.api.run_json(&args).await?;
        launched
            .instances
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::CreateFailed("run-instances returned no instance".into()))
    }
}

#[async_trait]
impl Cluster for AwsCluster {
    fn base(&self) -> &BaseCluster {
        &self.base
    }

    async fn new_machine(&self, payload: &BootPayload) -> ProviderResult<Arc<dyn Machine>> {
        let name = self.base.machine_name();
        let payload = self.base.render(payload);
        let launched = self.launch(&name, &payload).await?;
        let id = launched.instance_id;
        info!("launched EC2 instance {} ({})", id, name);

        let addresses = async {
            self.api
                .run(&["ec2", "wait", "instance-running", "--instance-ids", &id])
                .await?;
            let instance = self.describe(&id).await?;
            match (instance.public_ip_address, instance.private_ip_address) {
                (Some(public), Some(private)) => Ok((public, private)),
                _ => Err(ProviderError::CreateFailed(format!(
                    "instance {} has no public address",
                    id
                ))),
            }
        };

        let (ip, private_ip) = match addresses.await {
            Ok(addresses) => addresses,
            Err(e) => {
                // Not registered yet, so nothing else will clean it up.
                if let Err(te) = self.terminate(&id).await {
                    warn!("failed to terminate {} after launch error: {}", id, te);
                }
                return Err(e);
            }
        };

        let machine = Arc::new(AwsMachine {
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

pub struct AwsMachine {
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
impl Machine for AwsMachine {
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
                .run(&["ec2", "terminate-instances", "--instance-ids", &self.id])
                .await,
        );
        unregister(&self.cluster, &self.id);
        result
    }

    async fn console_output(&self) -> String {
        let output: ProviderResult<ConsoleOutput> = tokio::time::timeout(
            Duration::from_secs(60),
            self.api
                .run_json(&["ec2", "get-console-output", "--instance-id", &self.id]),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::Timeout("console output".into())));

        match output {
            Ok(out) => out.output.unwrap_or_default(),
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
    fn test_parse_run_instances() {
        let json = r#"{"Groups": [], "Instances": [{"InstanceId": "i-0abc", "PrivateIpAddress": "172.31.5.9"}]}"#;
        let parsed: RunInstances = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.instances[0].instance_id, "i-0abc");
        assert!(parsed.instances[0].public_ip_address.is_none());
    }

    #[test]
    fn test_parse_describe_instances() {
        let json = r#"{"Reservations": [{"Instances": [{
            "InstanceId": "i-0abc",
            "PublicIpAddress": "203.0.113.4",
            "PrivateIpAddress": "172.31.5.9",
            "State": {"Name": "running"}
        }]}]}"#;
        let parsed: DescribeInstances = serde_json::from_str(json).unwrap();
        let instance = &parsed.reservations[0].instances[0];
        assert_eq!(instance.public_ip_address.as_deref(), Some("203.0.113.4"));
        assert_eq!(instance.private_ip_address.as_deref(), Some("172.31.5.9"));
    }

    /// A stand-in `aws` that prints `reply` and counts its invocations.
    fn scripted_api(dir: &std::path::Path, reply: &str) -> CliApi {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("aws");
        let calls = dir.join("calls");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho x >> {}\ncat <<'EOF'\n{}\nEOF\n", calls.display(), reply),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        CliApi::new(script.to_string_lossy())
    }

    fn calls(dir: &std::path::Path) -> usize {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap_or_default()
            .lines()
            .count()
    }

    #[test]
    fn test_newest_image_wins() {
        let json = r#"{"Images": [
            {"ImageId": "ami-old", "CreationDate": "2024-01-03T10:00:00.000Z"},
            {"ImageId": "ami-new", "CreationDate": "2024-03-01T08:00:00.000Z"},
            {"ImageId": "ami-mid", "CreationDate": "2024-02-11T23:59:59.000Z"}
        ]}"#;
        let parsed: DescribeImages = serde_json::from_str(json).unwrap();
        assert_eq!(newest_image(parsed.images).as_deref(), Some("ami-new"));
        assert_eq!(newest_image(Vec::new()), None);
    }

    #[tokio::test]
    async fn test_channel_resolved_once() {
        let dir = tempfile::tempdir().unwrap();
        let api = scripted_api(
            dir.path(),
            r#"{"Images": [{"ImageId": "ami-0123", "CreationDate": "2024-05-01T00:00:00.000Z"}]}"#,
        );
        let provider = AwsProvider::with_api(AwsConfig::default(), "amd64-usr", api);
        assert_eq!(provider.config.ami, "alpha");

        assert_eq!(provider.ami().await.unwrap(), "ami-0123");
        assert_eq!(provider.ami().await.unwrap(), "ami-0123");
        assert_eq!(calls(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_channel_without_images_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let api = scripted_api(dir.path(), r#"{"Images": []}"#);
        let provider = AwsProvider::with_api(AwsConfig::default(), "arm64-usr", api);
        let err = provider.ami().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("no alpha arm64 AMI"));
    }

    #[tokio::test]
    async fn test_literal_ami_skips_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let api = scripted_api(dir.path(), "{}");
        let config = AwsConfig {
            ami: "ami-0fixed".to_string(),
            ..AwsConfig::default()
        };
        let provider = AwsProvider::with_api(config, "amd64-usr", api);
        assert_eq!(provider.ami().await.unwrap(), "ami-0fixed");
        assert_eq!(calls(dir.path()), 0);
    }

    #[test]
    fn test_console_output_may_be_absent() {
        let parsed: ConsoleOutput = serde_json::from_str(r#"{"InstanceId": "i-1"}"#).unwrap();
        assert!(parsed.output.is_none());
    }
}
