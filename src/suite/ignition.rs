//! First-boot provisioning runs exactly once.
//!
//! The payload drops a marker file. The test deletes it, reboots, and
//! checks that provisioning did not run again and recreate it.

use crate::conf::BootPayload;
use crate::harness::{TestAbort, TestCluster};
use crate::register::{RegistryBuilder, RegistryError, Test};

use super::first_machine;

const MARKER: &str = "/etc/ignition-ran";

const V1_CONFIG: &str = r#"{
  "ignitionVersion": 1,
  "storage": {
    "filesystems": [
      {
        "device": "/dev/disk/by-partlabel/ROOT",
        "format": "ext4",
        "files": [
          {
            "path": "/etc/ignition-ran",
            "contents": "Ignition ran.",
            "mode": 420
          }
        ]
      }
    ]
  }
}"#;

const V2_CONFIG: &str = r#"{
  "ignition": { "version": "2.0.0" },
  "storage": {
    "files": [
      {
        "filesystem": "root",
        "path": "/etc/ignition-ran",
        "contents": { "source": "data:,Ignition%20ran." },
        "mode": 420
      }
    ]
  }
}"#;

pub(super) fn register(registry: &mut RegistryBuilder) -> Result<(), RegistryError> {
    registry.register(
        Test::new("cl.ignition.v1.once", runs_once)
            .cluster_size(1)
            .user_data(BootPayload::ignition(V1_CONFIG))
            .distros(["cl"]),
    )?;
    registry.register(
        Test::new("coreos.ignition.v2.once", runs_once)
            .cluster_size(1)
            .user_data(BootPayload::ignition(V2_CONFIG))
            .distros(["cl", "rhcos", "fcos"]),
    )?;
    Ok(())
}

async fn runs_once(c: TestCluster) -> Result<(), TestAbort> {
    let m = first_machine(&c)?;

    // Fails if provisioning never created the marker.
    c.must_ssh(m.as_ref(), &format!("sudo rm {}", MARKER)).await?;

    m.reboot()
        .await
        .map_err(|e| c.fatal(format!("couldn't reboot machine: {}", e)))?;

    c.must_ssh(m.as_ref(), &format!("test ! -e {}", MARKER)).await?;
    Ok(())
}
