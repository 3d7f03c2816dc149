//! `Stop` (spec §4.6 Stop, including the termination fallback shared with
//! Start's step-9 rollback).

use std::time::Duration;

use cocoon_core::config::Config;
use cocoon_core::error::Result;
use cocoon_core::model::{Vm, VmState, now_millis};
use cocoon_core::process::{pid_file_alive, terminate_or_kill};
use cocoon_core::store::Store;

use crate::index::VmIndex;

/// Default grace period for the UEFI ACPI power-button poll (spec §4.6:
/// "`stopTimeoutSeconds` (default 30)").
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const POWER_BUTTON_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period SIGTERM is given before SIGKILL in the termination
/// fallback (spec §4.6 step 4).
const SIGTERM_GRACE: Duration = Duration::from_secs(5);

fn binary_basename(hypervisor_bin: &str) -> String {
    std::path::Path::new(hypervisor_bin)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(hypervisor_bin)
        .to_owned()
}

/// Stops one VM by id (best-effort at the caller's level, per-id here).
pub async fn stop(config: &Config, store: &Store<VmIndex>, id: &str) -> Result<Vm> {
    let basename = binary_basename(&config.hypervisor_bin);
    let run_dir = config.vm_run_dir(id);
    let pid_path = run_dir.join("ch.pid");
    let api_socket = run_dir.join("api.sock");

    if !pid_file_alive(&pid_path, &basename) {
        return commit_stopped(store, id, &run_dir).await;
    }

    let record = store.with(|idx| idx.vms.get(id).cloned()).await?;
    let is_direct = record.and_then(|r| r.boot_config).is_none_or(|b| b.is_direct());

    let graceful = if is_direct {
        let _ = crate::rest::vm_shutdown(&api_socket).await;
        false
    } else {
        graceful_power_button(&api_socket, &pid_path, &basename).await
    };

    if !graceful {
        let _ = crate::rest::vm_shutdown(&api_socket).await;
        if let Ok(contents) = tokio::fs::read_to_string(&pid_path).await
            && let Ok(pid) = contents.trim().parse::<i32>()
            && cocoon_core::process::pid_matches_binary(pid, &basename)
        {
            terminate_or_kill(pid, SIGTERM_GRACE).await?;
        }
    }

    let result = commit_stopped(store, id, &run_dir).await;
    if result.is_err() {
        let _ = mark_error(store, id).await;
    }
    result
}

/// Polls `vm.power-button` every 500 ms for up to `stopTimeoutSeconds`,
/// returning `true` once the process has exited gracefully.
async fn graceful_power_button(api_socket: &std::path::Path, pid_path: &std::path::Path, basename: &str) -> bool {
    if crate::rest::vm_power_button(api_socket).await.is_err() {
        return false;
    }
    cocoon_core::process::poll_until("VM ACPI power-off", DEFAULT_STOP_TIMEOUT, POWER_BUTTON_POLL_INTERVAL, || {
        let pid_path = pid_path.to_path_buf();
        let basename = basename.to_owned();
        async move { !pid_file_alive(&pid_path, &basename) }
    })
    .await
    .is_ok()
}

/// Removes runtime files and commits `state=Stopped, stoppedAt=now`.
async fn commit_stopped(store: &Store<VmIndex>, id: &str, run_dir: &std::path::Path) -> Result<Vm> {
    remove_runtime_files(run_dir).await;
    store
        .update(|idx| {
            let record = idx.vms.get_mut(id).ok_or_else(|| cocoon_core::error::Error::NotFound(id.to_owned()))?;
            record.vm.state = VmState::Stopped;
            record.vm.stopped_at = Some(now_millis());
            record.vm.updated_at = now_millis();
            Ok(record.vm.clone())
        })
        .await
}

async fn mark_error(store: &Store<VmIndex>, id: &str) -> Result<()> {
    store
        .update(|idx| {
            if let Some(record) = idx.vms.get_mut(id) {
                record.vm.state = VmState::Error;
                record.vm.updated_at = now_millis();
            }
            Ok(())
        })
        .await
}

async fn remove_runtime_files(run_dir: &std::path::Path) {
    for name in ["api.sock", "console.sock", "ch.pid", "vm.json"] {
        let _ = tokio::fs::remove_file(run_dir.join(name)).await;
    }
}

/// Terminates a specific, known-pid hypervisor process — used by Start's
/// step-10 rollback, which already has the pid in hand and doesn't need the
/// PID-file re-read that [`stop`] does.
pub async fn terminate(config: &Config, id: &str, pid: i32) -> Result<()> {
    let basename = binary_basename(&config.hypervisor_bin);
    let api_socket = config.vm_run_dir(id).join("api.sock");
    let _ = crate::rest::vm_shutdown(&api_socket).await;
    if cocoon_core::process::pid_matches_binary(pid, &basename) {
        terminate_or_kill(pid, SIGTERM_GRACE).await?;
    }
    Ok(())
}
