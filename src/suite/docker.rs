//! Docker selected through the torcx flag file.
//!
//! Writing `no` into `/etc/flatcar/docker-1.12` keeps the machine on the
//! current docker rather than the legacy 1.12 image.

use regex::Regex;

use crate::conf::BootPayload;
use crate::harness::{TestAbort, TestCluster};
use crate::platform::Machine;
use crate::register::{RegistryBuilder, RegistryError, Test};

use super::first_machine;

const CURRENT_DOCKER: &str = r"^(1[7-9]|[2-9][0-9])\.";

const TORCX_REFERENCE: &str =
    r#"jq -r '.value.images[] | select(.name == "docker").reference' /run/torcx/profile.json"#;
const DOCKER_VERSION: &str = "docker version -f '{{.Server.Version}}'";

const FLAG_FILE_CLC: &str = r#"
storage:
  files:
    - filesystem: root
      path: /etc/flatcar/docker-1.12
      contents:
        inline: no
      mode: 0644
"#;

const FLAG_FILE_CLOUD_CONFIG: &str = r#"#cloud-config
write_files:
  - path: "/etc/flatcar/docker-1.12"
    content: no
"#;

pub(super) fn register(registry: &mut RegistryBuilder) -> Result<(), RegistryError> {
    registry.register(
        Test::new("docker.torcx-flag-file", flag_file)
            .cluster_size(1)
            .user_data(BootPayload::container_linux_config(FLAG_FILE_CLC))
            .distros(["cl"]),
    )?;
    // cloudinit runs after torcx, so the flag only applies from the second
    // boot; the user-mode qemu network does not survive that reliably.
    registry.register(
        Test::new("docker.torcx-flag-file.cloud-config", flag_file_cloud_config)
            .cluster_size(1)
            .user_data(BootPayload::cloud_config(FLAG_FILE_CLOUD_CONFIG))
            .distros(["cl"])
            .exclude_platforms(["qemu"]),
    )?;
    Ok(())
}

async fn flag_file(c: TestCluster) -> Result<(), TestAbort> {
    let m = first_machine(&c)?;
    check_docker_versions(&c, m.as_ref(), CURRENT_DOCKER, CURRENT_DOCKER).await
}

async fn flag_file_cloud_config(c: TestCluster) -> Result<(), TestAbort> {
    let m = first_machine(&c)?;
    m.reboot()
        .await
        .map_err(|e| c.fatal(format!("couldn't reboot: {}", e)))?;
    check_docker_versions(&c, m.as_ref(), CURRENT_DOCKER, CURRENT_DOCKER).await
}

/// Mismatches are recorded as errors so both checks always run.
async fn check_docker_versions(
    c: &TestCluster,
    m: &dyn Machine,
    expected_ref: &str,
    expected_version: &str,
) -> Result<(), TestAbort> {
    let ref_re = Regex::new(expected_ref).map_err(|e| c.fatal(e.to_string()))?;
    let version_re = Regex::new(expected_version).map_err(|e| c.fatal(e.to_string()))?;

    let reference = c.must_ssh(m, TORCX_REFERENCE).await?;
    if !ref_re.is_match(&reference) {
        c.error(format!(
            "reference {} did not match {:?}",
            reference, expected_ref
        ));
    }

    let version = c.must_ssh(m, DOCKER_VERSION).await?;
    if !version_re.is_match(&version) {
        c.error(format!(
            "version {} did not match {:?}",
            version, expected_version
        ));
    }
    Ok(())
}
