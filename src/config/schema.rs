//! Configuration schema definitions for kola.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every field has a default, so an empty file (or
//! no file at all) is a valid configuration for a local QEMU run.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── KolaConfig     - Run settings (platform, distro, parallelism, outputs)
//! ├── SshConfig      - Remote access and boot deadlines
//! ├── RebootConfig   - Reboot polling policy
//! └── per-platform sections
//!     ├── AwsConfig      [aws]
//!     ├── DoConfig       [do]
//!     ├── EsxConfig      [esx]
//!     ├── GceConfig      [gce]
//!     ├── OciConfig      [oci]
//!     ├── PacketConfig   [packet]
//!     └── QemuConfig     [qemu]
//! ```
//!
//! Only the section for the selected platform is validated.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Distributions the harness knows how to test.
pub const DISTROS: &[&str] = &["cl", "fcos", "rhcos"];

/// Boards (architecture + userspace flavour) the harness supports.
pub const BOARDS: &[&str] = &["amd64-usr", "arm64-usr"];

/// Release channels an image option may name instead of a concrete image.
pub const RELEASE_CHANNELS: &[&str] = &["alpha", "beta", "stable"];

pub fn is_release_channel(image: &str) -> bool {
    RELEASE_CHANNELS.contains(&image)
}

/// Root configuration structure for kola.
///
/// # TOML Structure
///
/// ```toml
/// [kola]
/// platform = "gce"
/// parallel = 4
///
/// [ssh]
/// key_path = "~/.ssh/id_ed25519"
///
/// [gce]
/// project = "my-project"
/// image = "projects/my-project/global/images/flatcar-alpha"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub kola: KolaConfig,
    pub ssh: SshConfig,
    pub reboot: RebootConfig,
    pub aws: AwsConfig,
    #[serde(rename = "do")]
    pub digitalocean: DoConfig,
    pub esx: EsxConfig,
    pub gce: GceConfig,
    pub oci: OciConfig,
    pub packet: PacketConfig,
    pub qemu: QemuConfig,
}

/// Provisioning backend a run targets.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Aws,
    Do,
    Esx,
    Gce,
    Oci,
    Packet,
    #[default]
    Qemu,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Aws,
        Platform::Do,
        Platform::Esx,
        Platform::Gce,
        Platform::Oci,
        Platform::Packet,
        Platform::Qemu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Aws => "aws",
            Platform::Do => "do",
            Platform::Esx => "esx",
            Platform::Gce => "gce",
            Platform::Oci => "oci",
            Platform::Packet => "packet",
            Platform::Qemu => "qemu",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `platform` | `qemu` |
/// | `distro` | `cl` |
/// | `board` | `amd64-usr` |
/// | `parallel` | 1 |
/// | `basename` | `kola` |
/// | `output_dir` | `_kola_temp` |
/// | `test_timeout_secs` | 1800 (30 minutes) |
/// | `teardown_timeout_secs` | 600 |
/// | `api_concurrency` | 4 |
/// | `cleanup_errors_fatal` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KolaConfig {
    #[serde(default)]
    pub platform: Platform,

    /// Distribution under test; selects per-distro boot payloads.
    #[serde(default = "default_distro")]
    pub distro: String,

    #[serde(default = "default_board")]
    pub board: String,

    /// Maximum number of tests (and therefore clusters) alive at once.
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Prefix for cluster and machine names.
    #[serde(default = "default_basename")]
    pub basename: String,

    /// Root for per-test journals and console logs.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// TAP results file, written when set.
    pub tapfile: Option<PathBuf>,

    /// JUnit XML results file, written when set.
    pub junit_file: Option<PathBuf>,

    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// Upper bound on destroying one cluster; expiry is logged and the
    /// run moves on.
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_secs: u64,

    /// Maximum concurrent calls to a cloud provider's API.
    #[serde(default = "default_api_concurrency")]
    pub api_concurrency: usize,

    /// Turn teardown failures of an otherwise passing test into a failure.
    #[serde(default)]
    pub cleanup_errors_fatal: bool,

    /// Extra `{KEY}` bindings rendered into every boot payload.
    #[serde(default)]
    pub bindings: std::collections::BTreeMap<String, String>,
}

impl Default for KolaConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            distro: default_distro(),
            board: default_board(),
            parallel: default_parallel(),
            basename: default_basename(),
            output_dir: default_output_dir(),
            tapfile: None,
            junit_file: None,
            test_timeout_secs: default_test_timeout(),
            teardown_timeout_secs: default_teardown_timeout(),
            api_concurrency: default_api_concurrency(),
            cleanup_errors_fatal: false,
            bindings: Default::default(),
        }
    }
}

impl KolaConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    /// CPU architecture of the board, e.g. `amd64` for `amd64-usr`.
    pub fn architecture(&self) -> &str {
        self.board.split('-').next().unwrap_or(&self.board)
    }
}

fn default_distro() -> String {
    "cl".to_string()
}

fn default_board() -> String {
    "amd64-usr".to_string()
}

fn default_parallel() -> usize {
    1
}

fn default_basename() -> String {
    "kola".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("_kola_temp")
}

fn default_test_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_teardown_timeout() -> u64 {
    600
}

fn default_api_concurrency() -> usize {
    4
}

/// Remote access settings shared by every platform.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key for logins; `~` is expanded. Uses the agent when unset.
    pub key_path: Option<PathBuf>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long a new machine gets to become reachable.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    #[serde(default = "default_true")]
    pub disable_host_key_check: bool,

    /// Stream each machine's journal into the output directory.
    #[serde(default = "default_true")]
    pub journal: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_path: None,
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            retry_interval_secs: default_retry_interval(),
            disable_host_key_check: true,
            journal: true,
        }
    }
}

fn default_ssh_user() -> String {
    "core".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_startup_timeout() -> u64 {
    300
}

fn default_retry_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// How long to wait for a machine to come back from a reboot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RebootConfig {
    #[serde(default = "default_reboot_attempts")]
    pub attempts: usize,

    #[serde(default = "default_reboot_interval")]
    pub interval_secs: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            attempts: default_reboot_attempts(),
            interval_secs: default_reboot_interval(),
        }
    }
}

fn default_reboot_attempts() -> usize {
    30
}

fn default_reboot_interval() -> u64 {
    10
}

/// `[aws]`: EC2 through the `aws` CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    pub profile: String,
    /// AMI id for new instances, or a release channel resolved to the
    /// newest image published by `ami_owner`.
    pub ami: String,
    pub ami_owner: String,
    pub instance_type: String,
    pub security_group: String,
    pub iam_profile: String,
    pub credentials_file: Option<PathBuf>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            profile: "default".to_string(),
            ami: "alpha".to_string(),
            ami_owner: "075585003325".to_string(),
            instance_type: "m4.large".to_string(),
            security_group: "kola".to_string(),
            iam_profile: "kola".to_string(),
            credentials_file: None,
        }
    }
}

/// `[do]`: DigitalOcean droplets through `doctl`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DoConfig {
    pub region: String,
    pub size: String,
    pub image: String,
    pub access_token: Option<String>,
    /// `doctl` auth context.
    pub profile: Option<String>,
    /// Account SSH key ids or fingerprints injected into droplets.
    pub ssh_key_ids: Vec<String>,
}

impl Default for DoConfig {
    fn default() -> Self {
        Self {
            region: "sfo2".to_string(),
            size: "1gb".to_string(),
            image: "alpha".to_string(),
            access_token: None,
            profile: None,
            ssh_key_ids: Vec::new(),
        }
    }
}

/// `[esx]`: vSphere through `govc`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EsxConfig {
    /// vCenter/ESXi URL, may embed credentials.
    pub server: String,
    pub profile: Option<String>,
    /// Template VM cloned for every machine.
    pub base_vm: String,
    /// Extra environment for `govc`, as `KEY=VALUE` lines.
    pub config_file: Option<PathBuf>,
    /// Skip TLS verification of the server.
    pub insecure: bool,
}

/// `[gce]`: Compute Engine through `gcloud`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GceConfig {
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub disk_type: String,
    pub network: String,
    pub image: String,
    /// Service account key file.
    pub json_key: Option<PathBuf>,
    /// Use the ambient metadata-server credentials.
    pub service_auth: bool,
}

impl Default for GceConfig {
    fn default() -> Self {
        Self {
            project: "flatcar-212911".to_string(),
            zone: "us-central1-a".to_string(),
            machine_type: "n1-standard-1".to_string(),
            disk_type: "pd-ssd".to_string(),
            network: "default".to_string(),
            image: String::new(),
            json_key: None,
            service_auth: false,
        }
    }
}

/// `[oci]`: Oracle Cloud through the `oci` CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OciConfig {
    pub compartment_id: String,
    pub availability_domain: String,
    pub shape: String,
    pub image_id: String,
    pub subnet_id: String,
    pub profile: String,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            compartment_id: String::new(),
            availability_domain: String::new(),
            shape: "VM.Standard1.1".to_string(),
            image_id: String::new(),
            subnet_id: String::new(),
            profile: "DEFAULT".to_string(),
        }
    }
}

/// `[packet]`: bare metal through the `metal` CLI.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PacketConfig {
    pub project: String,
    pub facility: Option<String>,
    /// Device plan; defaults by board.
    pub plan: Option<String>,
    pub api_key: Option<String>,
    /// iPXE script that boots the installer.
    pub ipxe_script_url: Option<String>,
    pub profile: Option<String>,
}

impl PacketConfig {
    pub fn facility(&self) -> &str {
        self.facility.as_deref().unwrap_or("sjc1")
    }

    pub fn plan(&self, board: &str) -> &str {
        match (&self.plan, board) {
            (Some(plan), _) => plan,
            (None, "arm64-usr") => "baremetal_2a",
            (None, _) => "baremetal_0",
        }
    }

    pub fn ipxe_script_url(&self, board: &str) -> String {
        match &self.ipxe_script_url {
            Some(url) => url.clone(),
            None => format!(
                "https://alpha.release.flatcar-linux.net/{}/current/flatcar_production_packet.ipxe",
                board
            ),
        }
    }
}

/// `[qemu]`: local virtual machines.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QemuConfig {
    /// Emulator binary; defaults by board.
    pub binary: Option<String>,
    /// Disk image booted (in snapshot mode) by every machine.
    pub disk_image: Option<PathBuf>,
    pub bios_image: Option<PathBuf>,
    pub memory_mb: u32,
    pub cpus: u32,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: None,
            disk_image: None,
            bios_image: None,
            memory_mb: 1024,
            cpus: 1,
        }
    }
}

impl QemuConfig {
    pub fn binary(&self, board: &str) -> String {
        match (&self.binary, board) {
            (Some(binary), _) => binary.clone(),
            (None, "arm64-usr") => "qemu-system-aarch64".to_string(),
            (None, _) => "qemu-system-x86_64".to_string(),
        }
    }

    pub fn disk_image(&self, board: &str) -> PathBuf {
        self.disk_image.clone().unwrap_or_else(|| {
            PathBuf::from(format!(
                "build/images/{}/latest/flatcar_production_image.bin",
                board
            ))
        })
    }

    pub fn bios_image(&self, board: &str) -> PathBuf {
        self.bios_image.clone().unwrap_or_else(|| match board {
            "arm64-usr" => PathBuf::from(format!(
                "build/images/{}/latest/flatcar_production_qemu_uefi_efi_code.fd",
                board
            )),
            _ => PathBuf::from("bios-256k.bin"),
        })
    }
}

/// A configuration the selected platform cannot run with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported distro {0:?} (expected one of: {list})", list = DISTROS.join(", "))]
    Distro(String),

    #[error("unsupported board {0:?} (expected one of: {list})", list = BOARDS.join(", "))]
    Board(String),

    #[error("[kola] {0} must be at least 1")]
    Zero(&'static str),

    #[error("[{platform}] option `{option}` is required")]
    MissingOption {
        platform: Platform,
        option: &'static str,
    },

    #[error(
        "[{platform}] option `{option}` names release channel {channel:?}, \
         which cannot be resolved on this platform; set a concrete image"
    )]
    UnresolvableChannel {
        platform: Platform,
        option: &'static str,
        channel: String,
    },
}

impl Config {
    /// Checks the run settings and the selected platform's section.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let kola = &self.kola;
        if !DISTROS.contains(&kola.distro.as_str()) {
            return Err(ValidationError::Distro(kola.distro.clone()));
        }
        if !BOARDS.contains(&kola.board.as_str()) {
            return Err(ValidationError::Board(kola.board.clone()));
        }
        if kola.parallel == 0 {
            return Err(ValidationError::Zero("parallel"));
        }
        if kola.api_concurrency == 0 {
            return Err(ValidationError::Zero("api_concurrency"));
        }

        let platform = kola.platform;
        let require = |value: &str, option: &'static str| {
            if value.trim().is_empty() {
                Err(ValidationError::MissingOption { platform, option })
            } else {
                Ok(())
            }
        };

        match platform {
            Platform::Aws => {
                require(&self.aws.region, "region")?;
                require(&self.aws.ami, "ami")?;
                if is_release_channel(&self.aws.ami) {
                    require(&self.aws.ami_owner, "ami_owner")?;
                }
                require(&self.aws.instance_type, "instance_type")?;
            }
            Platform::Do => {
                require(&self.digitalocean.region, "region")?;
                require(&self.digitalocean.image, "image")?;
                if is_release_channel(&self.digitalocean.image) {
                    return Err(ValidationError::UnresolvableChannel {
                        platform,
                        option: "image",
                        channel: self.digitalocean.image.clone(),
                    });
                }
            }
            Platform::Esx => {
                require(&self.esx.server, "server")?;
                require(&self.esx.base_vm, "base_vm")?;
            }
            Platform::Gce => {
                require(&self.gce.project, "project")?;
                require(&self.gce.zone, "zone")?;
                require(&self.gce.image, "image")?;
            }
            Platform::Oci => {
                require(&self.oci.compartment_id, "compartment_id")?;
                require(&self.oci.availability_domain, "availability_domain")?;
                require(&self.oci.image_id, "image_id")?;
                require(&self.oci.subnet_id, "subnet_id")?;
            }
            Platform::Packet => {
                require(&self.packet.project, "project")?;
            }
            Platform::Qemu => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.kola.platform, Platform::Qemu);
        assert_eq!(config.kola.distro, "cl");
        assert_eq!(config.kola.parallel, 1);
        assert_eq!(config.ssh.user, "core");
        assert_eq!(config.reboot.attempts, 30);
        assert_eq!(config.aws.region, "us-west-2");
        assert_eq!(config.qemu.memory_mb, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_do_section_rename() {
        let config: Config = toml::from_str(
            r#"
            [kola]
            platform = "do"

            [do]
            region = "nyc3"
            ssh_key_ids = ["1234"]
            "#,
        )
        .unwrap();
        assert_eq!(config.kola.platform, Platform::Do);
        assert_eq!(config.digitalocean.region, "nyc3");
        assert_eq!(config.digitalocean.size, "1gb");
        assert_eq!(config.digitalocean.ssh_key_ids, vec!["1234"]);
    }

    #[test]
    fn test_validate_rejects_unknown_distro() {
        let mut config = Config::default();
        config.kola.distro = "ubuntu".to_string();
        assert_eq!(
            config.validate().unwrap_err(),
            ValidationError::Distro("ubuntu".to_string())
        );
    }

    #[test]
    fn test_validate_requires_selected_platform_fields() {
        let mut config = Config::default();
        config.kola.platform = Platform::Gce;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingOption {
                platform: Platform::Gce,
                option: "image"
            }
        );
        assert_eq!(err.to_string(), "[gce] option `image` is required");

        // An incomplete [gce] section is irrelevant when running elsewhere.
        config.kola.platform = Platform::Qemu;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_release_channels() {
        let mut config = Config::default();
        config.kola.platform = Platform::Do;
        assert_eq!(
            config.validate().unwrap_err(),
            ValidationError::UnresolvableChannel {
                platform: Platform::Do,
                option: "image",
                channel: "alpha".to_string(),
            }
        );
        config.digitalocean.image = "flatcar-custom-1234".to_string();
        assert!(config.validate().is_ok());

        // EC2 channels resolve against the image owner's account.
        config.kola.platform = Platform::Aws;
        assert!(config.validate().is_ok());
        config.aws.ami_owner = String::new();
        assert_eq!(
            config.validate().unwrap_err(),
            ValidationError::MissingOption {
                platform: Platform::Aws,
                option: "ami_owner"
            }
        );
        config.aws.ami = "ami-0abc".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_board_defaults() {
        let qemu = QemuConfig::default();
        assert_eq!(qemu.binary("arm64-usr"), "qemu-system-aarch64");
        assert_eq!(qemu.binary("amd64-usr"), "qemu-system-x86_64");

        let packet = PacketConfig::default();
        assert_eq!(packet.plan("arm64-usr"), "baremetal_2a");
        assert_eq!(packet.facility(), "sjc1");

        let kola = KolaConfig {
            board: "arm64-usr".to_string(),
            ..Default::default()
        };
        assert_eq!(kola.architecture(), "arm64");
    }
}
