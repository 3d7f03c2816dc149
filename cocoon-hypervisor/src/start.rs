//! `Start` (spec §4.6 Start, 10 steps).

use std::path::PathBuf;
use std::time::Duration;

use cocoon_core::config::Config;
use cocoon_core::error::{Error, Result};
use cocoon_core::model::{Vm, VmState, now_millis};
use cocoon_core::process::pid_file_alive;
use cocoon_core::store::Store;

use crate::index::VmIndex;

/// How long Start polls the API socket before giving up (spec §4.6 step 7).
const SOCKET_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Basename used for the PID-file/process liveness check (spec §9, I3):
/// must match the hypervisor binary's `/proc/<pid>/exe` link target.
fn binary_basename(hypervisor_bin: &str) -> String {
    std::path::Path::new(hypervisor_bin)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(hypervisor_bin)
        .to_owned()
}

/// Starts one VM by id. Best-effort at the caller's level (spec §4.6:
/// "For each id... failures logged, successes returned") — this function
/// handles exactly one id and returns its outcome.
pub async fn start(config: &Config, store: &Store<VmIndex>, id: &str) -> Result<Vm> {
    let basename = binary_basename(&config.hypervisor_bin);
    let pid_path = config.vm_run_dir(id).join("ch.pid");

    if pid_file_alive(&pid_path, &basename) {
        return mark_running_if_needed(store, id).await;
    }

    let record = store.with(|idx| idx.vms.get(id).cloned()).await?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
    let boot_config = record.boot_config.clone().ok_or_else(|| Error::Validation(format!("vm {id} has no boot config; Create did not finish")))?;

    let run_dir = config.vm_run_dir(id);
    let log_dir = config.vm_log_dir(id);
    tokio::fs::create_dir_all(&run_dir).await?;
    tokio::fs::create_dir_all(&log_dir).await?;
    clear_stale_runtime_files(&run_dir).await;

    let api_socket = run_dir.join("api.sock");
    let console_socket = (!boot_config.is_direct()).then(|| run_dir.join("console.sock"));
    let args = crate::chconfig::build_args(&record.vm.config, &record.storage_configs, &record.network_configs, &boot_config, &api_socket, console_socket.as_deref());

    let _ = tokio::fs::write(run_dir.join("vm.json"), serde_json::to_vec_pretty(&args).unwrap_or_default()).await;

    let netns_path = has_nics(&record.network_configs).then(|| netns_path_for(id));
    let log_path = log_dir.join("ch.log");
    let result = crate::spawn::spawn_detached(&config.hypervisor_bin, &args, &log_path, netns_path.as_deref()).await;

    let pid = match result {
        Ok(pid) => pid,
        Err(error) => return Err(error),
    };
    tokio::fs::write(&pid_path, pid.to_string()).await?;

    if let Err(error) = wait_for_socket(&api_socket, pid).await {
        let _ = crate::stop::terminate(config, id, pid).await;
        clear_stale_runtime_files(&run_dir).await;
        return Err(error);
    }

    let console_path = match &console_socket {
        Some(path) => path.display().to_string(),
        None => discover_console_path(&api_socket).await?,
    };

    let commit = store
        .update(|idx| {
            let record = idx.vms.get_mut(id).ok_or_else(|| Error::NotFound(id.to_owned()))?;
            record.vm.state = VmState::Running;
            record.vm.started_at = Some(now_millis());
            record.vm.console_path = Some(console_path.clone());
            record.vm.updated_at = now_millis();
            Ok(record.vm.clone())
        })
        .await;

    match commit {
        Ok(vm) => Ok(vm),
        Err(error) => {
            let _ = crate::stop::terminate(config, id, pid).await;
            clear_stale_runtime_files(&run_dir).await;
            Err(error)
        }
    }
}

/// Step 2: the process is already alive under the configured binary. If the
/// record disagrees, fix the state and return success; if the commit fails,
/// abort rather than relaunching a VM that's already running.
async fn mark_running_if_needed(store: &Store<VmIndex>, id: &str) -> Result<Vm> {
    store
        .update(|idx| {
            let record = idx.vms.get_mut(id).ok_or_else(|| Error::NotFound(id.to_owned()))?;
            if record.vm.state != VmState::Running {
                record.vm.state = VmState::Running;
                record.vm.updated_at = now_millis();
            }
            Ok(record.vm.clone())
        })
        .await
}

/// Removes the socket, PID file, and saved launch payload from any
/// previous run (spec §4.6 step 3). Best-effort: a missing file is fine.
async fn clear_stale_runtime_files(run_dir: &std::path::Path) {
    for name in ["api.sock", "console.sock", "ch.pid", "vm.json"] {
        let _ = tokio::fs::remove_file(run_dir.join(name)).await;
    }
}

fn has_nics(network_configs: &[cocoon_core::model::NetworkConfig]) -> bool {
    !network_configs.is_empty()
}

/// Path to the VM's network namespace, set up by `cocoon-net` as
/// `cocoon-<id>` (spec §4.5/§4.7).
fn netns_path_for(id: &str) -> PathBuf {
    PathBuf::from("/var/run/netns").join(format!("cocoon-{id}"))
}

async fn wait_for_socket(api_socket: &std::path::Path, pid: i32) -> Result<()> {
    let socket = api_socket.to_path_buf();
    cocoon_core::process::poll_until("hypervisor API socket", SOCKET_POLL_TIMEOUT, SOCKET_POLL_INTERVAL, || {
        let socket = socket.clone();
        async move {
            if crate::spawn::has_exited(pid) {
                return true;
            }
            tokio::net::UnixStream::connect(&socket).await.is_ok()
        }
    })
    .await?;

    if crate::spawn::has_exited(pid) {
        return Err(Error::Subprocess {
            bin: "cloud-hypervisor".to_owned(),
            detail: "process exited before the API socket became ready".to_owned(),
        });
    }
    Ok(())
}

/// Step 8 (direct boot only): query `vm.info` for the allocated console PTY
/// path. Shape is opaque (spec §9 open question); only the one field this
/// deployment needs is extracted.
async fn discover_console_path(api_socket: &std::path::Path) -> Result<String> {
    let info = crate::rest::vm_info(api_socket).await?;
    info.pointer("/config/console/file")
        .or_else(|| info.pointer("/config/serial/file"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::Validation("vm.info did not report a console path".to_owned()))
}
