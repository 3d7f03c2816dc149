//! `Delete` (spec §4.6 Delete — early-return, not best-effort).

use cocoon_core::config::Config;
use cocoon_core::error::{Error, Result};
use cocoon_core::process::pid_file_alive;
use cocoon_core::store::Store;

use crate::index::VmIndex;

fn binary_basename(hypervisor_bin: &str) -> String {
    std::path::Path::new(hypervisor_bin)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(hypervisor_bin)
        .to_owned()
}

/// Deletes one VM by id. Running VMs require `force`; without it this
/// returns `Error::Conflict` rather than silently stopping the VM. The
/// per-VM run/log directories are left on disk for GC to reap (spec §4.7).
pub async fn delete(config: &Config, store: &Store<VmIndex>, id: &str, force: bool) -> Result<()> {
    let basename = binary_basename(&config.hypervisor_bin);
    let pid_path = config.vm_run_dir(id).join("ch.pid");

    if pid_file_alive(&pid_path, &basename) {
        if !force {
            return Err(Error::Conflict(format!("vm {id} is running (force required)")));
        }
        crate::stop::stop(config, store, id).await?;
    }

    store
        .update(|idx| {
            let record = idx.vms.remove(id).ok_or_else(|| Error::NotFound(id.to_owned()))?;
            idx.names.remove(&record.vm.config.name);
            Ok(())
        })
        .await
}
