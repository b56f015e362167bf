//! Machine lifecycle helpers shared by every backend, and the backends.
//!
//! A backend's `new_machine` typically does three things: ask its API for
//! an instance, wrap the answer in its [`Machine`] type, and hand that to
//! [`commission`], which registers it with the cluster, waits for SSH and
//! attaches the journal.

pub mod aws;
pub mod digitalocean;
pub mod esx;
pub mod gce;
pub mod oci;
pub mod packet;
pub mod qemu;

use std::sync::{Arc, Weak};

use tracing::{debug, info, trace, warn};

use crate::platform::{BaseCluster, Machine, ProviderError, ProviderResult};
use crate::ssh::SshError;
use crate::util;

const BOOT_ID_COMMAND: &str = "cat /proc/sys/kernel/random/boot_id";

/// Adds `machine` to the cluster, or destroys it if the cluster is gone.
pub async fn register(base: &BaseCluster, machine: Arc<dyn Machine>) -> ProviderResult<()> {
    if let Err(e) = base.add_machine(machine.clone()) {
        warn!(
            "cluster {} is tearing down; releasing new machine {}",
            base.name(),
            machine.id()
        );
        if let Err(destroy_err) = machine.destroy().await {
            warn!("failed to release machine {}: {}", machine.id(), destroy_err);
        }
        return Err(e);
    }
    Ok(())
}

/// Registers, waits for SSH, then starts the journal.
///
/// If the machine never becomes reachable it stays registered, so the
/// cluster's teardown still releases it.
pub async fn commission(
    base: &BaseCluster,
    machine: Arc<dyn Machine>,
) -> ProviderResult<Arc<dyn Machine>> {
    register(base, machine.clone()).await?;
    wait_reachable(&*machine).await?;
    start_journal(base, &*machine).await;
    info!("machine {} up at {}", machine.id(), machine.ip());
    Ok(machine)
}

/// Polls SSH until it answers or the startup deadline passes.
pub async fn wait_reachable<M: Machine + ?Sized>(machine: &M) -> ProviderResult<()> {
    let runtime = machine.runtime();
    let mut last_error: Option<SshError> = None;

    let poll = async {
        loop {
            match machine.ssh("true").await {
                Ok(_) => return,
                Err(e) => {
                    trace!("{} not reachable yet: {}", machine.id(), e);
                    last_error = Some(e);
                }
            }
            tokio::time::sleep(runtime.retry_interval).await;
        }
    };

    if util::with_timeout(runtime.startup_timeout, poll).await.is_ok() {
        return Ok(());
    }

    Err(ProviderError::Timeout(match last_error {
        Some(e) => format!(
            "machine {} not reachable after {:?}: {}",
            machine.id(),
            runtime.startup_timeout,
            e
        ),
        None => format!(
            "machine {} not reachable after {:?}",
            machine.id(),
            runtime.startup_timeout
        ),
    }))
}

async fn start_journal(base: &BaseCluster, machine: &dyn Machine) {
    let runtime = machine.runtime();
    if !runtime.journal {
        return;
    }
    let Some(dir) = base.machine_dir(machine.id()) else {
        return;
    };
    if let Err(e) = machine
        .journal()
        .start(&runtime.ssh, &machine.ssh_target(), &dir)
        .await
    {
        warn!("could not start journal for {}: {}", machine.id(), e);
    }
}

/// Drops `id` from its cluster, if the cluster still exists.
pub(crate) fn unregister(base: &Weak<BaseCluster>, id: &str) {
    if let Some(base) = base.upgrade() {
        base.del_machine(id);
    }
}

async fn boot_id<M: Machine + ?Sized>(machine: &M) -> ProviderResult<String> {
    let out = machine.ssh(BOOT_ID_COMMAND).await?;
    Ok(out.stdout_str().trim().to_string())
}

/// Reboots `machine` and waits for it to come back on a new boot.
///
/// The boot is identified by the kernel's boot id, so a machine that never
/// went down is not mistaken for one that came back.
pub async fn reboot_machine<M: Machine + ?Sized>(machine: &M) -> ProviderResult<()> {
    let runtime = machine.runtime();
    let before = boot_id(machine).await?;
    info!("rebooting {}", machine.id());

    machine.journal().stop().await;

    // The session is usually cut before ssh can report an exit status.
    if let Err(e) = machine.ssh("sudo systemctl reboot").await {
        debug!("reboot of {} returned: {}", machine.id(), e);
    }

    let before = before.as_str();
    util::retry(runtime.reboot_attempts, runtime.reboot_interval, || async move {
        let now = boot_id(machine).await?;
        if now == before {
            return Err(ProviderError::Timeout(format!(
                "{} has not rebooted yet",
                machine.id()
            )));
        }
        Ok(())
    })
    .await
    .map_err(|e| {
        ProviderError::Timeout(format!(
            "{} did not come back from reboot: {}",
            machine.id(),
            e
        ))
    })?;

    if let Err(e) = machine
        .journal()
        .resume(&runtime.ssh, &machine.ssh_target())
        .await
    {
        warn!("could not resume journal for {}: {}", machine.id(), e);
    }
    Ok(())
}

/// Writes `contents` to `path` on the machine with the given mode.
pub async fn install_file<M: Machine + ?Sized>(
    machine: &M,
    contents: &[u8],
    path: &str,
    mode: u32,
) -> Result<(), SshError> {
    let quoted = shell_words::quote(path);
    let dir = match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir,
        _ => "/",
    };
    let cmd = format!(
        "sudo mkdir -p {} && sudo tee {} >/dev/null && sudo chmod {:o} {}",
        shell_words::quote(dir),
        quoted,
        mode,
        quoted
    );
    machine.ssh_with_input(&cmd, contents).await.map(|_| ())
}

/// Copies a file from one machine to another through the harness.
pub async fn transfer_file<S, D>(
    src: &S,
    src_path: &str,
    dst: &D,
    dst_path: &str,
    mode: u32,
) -> Result<(), SshError>
where
    S: Machine + ?Sized,
    D: Machine + ?Sized,
{
    let out = src
        .ssh(&format!("sudo cat {}", shell_words::quote(src_path)))
        .await?;
    install_file(dst, &out.stdout, dst_path, mode).await
}
