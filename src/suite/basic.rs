//! Machines boot, settle, and can reach each other.

use std::time::Duration;

use futures::future::join_all;

use crate::harness::{TestAbort, TestCluster};
use crate::platform::Machine;
use crate::register::{RegistryBuilder, RegistryError, Test};
use crate::ssh::SshError;
use crate::util;

const STATE_POLL_ATTEMPTS: usize = 24;
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(super) fn register(registry: &mut RegistryBuilder) -> Result<(), RegistryError> {
    // QEMU machines each sit on their own user-mode network.
    registry.register(
        Test::new("cl.basic.reachability", reachability)
            .cluster_size(2)
            .exclude_platforms(["qemu"]),
    )
}

/// `systemctl is-system-running` exits non-zero for anything but
/// "running", so the state is read from stdout either way.
async fn system_state(m: &dyn Machine) -> Result<String, SshError> {
    match m.ssh("systemctl is-system-running").await {
        Ok(out) => Ok(out.stdout_str().trim().to_string()),
        Err(SshError::CommandFailed { stdout, .. }) => Ok(stdout.trim().to_string()),
        Err(e) => Err(e),
    }
}

/// Polls until systemd has finished starting up.
async fn wait_settled(m: &dyn Machine) -> Result<String, String> {
    util::retry(STATE_POLL_ATTEMPTS, STATE_POLL_INTERVAL, || async move {
        let state = system_state(m).await.map_err(|e| e.to_string())?;
        match state.as_str() {
            "running" | "degraded" => Ok(state),
            other => Err(format!("{} is {}", m.id(), other)),
        }
    })
    .await
}

async fn reachability(c: TestCluster) -> Result<(), TestAbort> {
    let machines = c.machines();
    if machines.len() < 2 {
        return Err(c.fatal(format!("need 2 machines, have {}", machines.len())));
    }

    let states = join_all(machines.iter().map(|m| wait_settled(m.as_ref()))).await;
    for (m, state) in machines.iter().zip(states) {
        match state {
            Ok(state) if state == "degraded" => {
                let failed = c
                    .must_ssh(m.as_ref(), "systemctl --failed --no-legend")
                    .await?;
                c.error(format!("{} is degraded: {}", m.id(), failed));
            }
            Ok(_) => {}
            Err(e) => return Err(c.fatal(format!("{} never settled: {}", m.id(), e))),
        }
    }

    // Every machine reaches every other one on the private network.
    for from in &machines {
        for to in machines.iter().filter(|to| to.id() != from.id()) {
            let cmd = format!("ping -c 1 -w 10 {}", to.private_ip());
            if let Err(e) = c.ssh(from.as_ref(), &cmd).await {
                c.error(format!("{} cannot reach {}: {}", from.id(), to.id(), e));
            }
        }
    }
    Ok(())
}
