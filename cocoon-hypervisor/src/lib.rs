//! Cloud Hypervisor backend for the Cocoon micro-VM engine (spec §4.6, C5).
//!
//! Owns nothing about image resolution: callers resolve an image reference
//! to a `(StorageConfig[], BootConfig)` pair via the appropriate image
//! backend and a NIC list via the network provider, then hand the result to
//! [`HypervisorBackend::create`]. This keeps the hypervisor crate decoupled
//! from `cocoon-oci`/`cocoon-cloudimg`/`cocoon-net`, matching the way every
//! other backend in this workspace only depends on `cocoon-core`.

mod chconfig;
mod cidata;
mod console;
mod create;
mod delete;
mod gc;
mod index;
mod rest;
mod spawn;
mod start;
mod stop;

use std::path::PathBuf;

use cocoon_core::config::Config;
use cocoon_core::error::Result;
use cocoon_core::model::{Vm, VmState};
use cocoon_core::process::pid_file_alive;
use cocoon_core::store::Store;

pub use console::ConsoleStream;
pub use create::CreateRequest;
pub use gc::GcModule;
pub use index::VmIndex;

fn binary_basename(hypervisor_bin: &str) -> String {
    std::path::Path::new(hypervisor_bin)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(hypervisor_bin)
        .to_owned()
}

/// Hypervisor backend. One instance per CLI invocation (spec §9).
#[derive(Debug)]
pub struct HypervisorBackend {
    config: Config,
    store: Store<VmIndex>,
}

impl HypervisorBackend {
    /// Opens the backend against `config` (spec §6: `<root_dir>/cloudhypervisor`).
    #[must_use]
    pub fn open(config: Config) -> Self {
        let store = Store::open(config.hypervisor_db_dir().join("vms.json"), config.hypervisor_db_dir().join("vms.lock"));
        Self { config, store }
    }

    /// Creates a VM (spec §4.6 Create).
    pub async fn create(&self, request: CreateRequest) -> Result<Vm> {
        create::create(&self.config, &self.store, request).await
    }

    /// Starts one VM by `ref` (spec §4.6 Start).
    pub async fn start(&self, r#ref: &str) -> Result<Vm> {
        let id = self.resolve_id(r#ref).await?;
        start::start(&self.config, &self.store, &id).await
    }

    /// Stops one VM by `ref` (spec §4.6 Stop).
    pub async fn stop(&self, r#ref: &str) -> Result<Vm> {
        let id = self.resolve_id(r#ref).await?;
        stop::stop(&self.config, &self.store, &id).await
    }

    /// Deletes one VM by `ref` (spec §4.6 Delete).
    pub async fn delete(&self, r#ref: &str, force: bool) -> Result<String> {
        let id = self.resolve_id(r#ref).await?;
        delete::delete(&self.config, &self.store, &id, force).await?;
        Ok(id)
    }

    /// Resolves `ref` and returns its current view (spec §4.6 Inspect).
    pub async fn inspect(&self, r#ref: &str) -> Result<Vm> {
        let vm = self.store.with(|idx| idx.resolve(r#ref).map(|r| r.vm.clone())).await??;
        Ok(self.reconcile(vm))
    }

    /// Every VM currently known (spec §4.6 List).
    pub async fn list(&self) -> Result<Vec<Vm>> {
        let vms = self.store.with(|idx| idx.vms.values().map(|r| r.vm.clone()).collect::<Vec<_>>()).await?;
        Ok(vms.into_iter().map(|vm| self.reconcile(vm)).collect())
    }

    /// Stale-running reconciliation (spec §7): a record stored as `Running`
    /// whose PID file is missing, dead, or bound to a different binary is
    /// not an error. It's reported here as `Stopped` for display purposes
    /// without touching the persisted record; `Start` performs the same
    /// liveness check itself and proceeds past it independently.
    fn reconcile(&self, mut vm: Vm) -> Vm {
        if vm.state == VmState::Running {
            let basename = binary_basename(&self.config.hypervisor_bin);
            let pid_path = self.config.vm_run_dir(&vm.id).join("ch.pid");
            if !pid_file_alive(&pid_path, &basename) {
                vm.state = VmState::Stopped;
            }
        }
        vm
    }

    /// Opens a bidirectional stream to `ref`'s console (spec §4.6 Console).
    pub async fn console(&self, r#ref: &str) -> Result<ConsoleStream> {
        let id = self.resolve_id(r#ref).await?;
        console::console(&self.config, &self.store, &id).await
    }

    async fn resolve_id(&self, r#ref: &str) -> Result<String> {
        self.store.with(|idx| idx.resolve_id(r#ref)).await?
    }

    /// Returns this backend's participant in the GC orchestrator (spec §4.7).
    #[must_use]
    pub fn gc_module(&self) -> GcModule {
        GcModule::new(self.run_root(), self.log_root(), Store::open(self.store_path(), self.lock_path()))
    }

    fn run_root(&self) -> PathBuf {
        self.config.run_dir.join("cloudhypervisor")
    }

    fn log_root(&self) -> PathBuf {
        self.config.log_dir.join("cloudhypervisor")
    }

    fn store_path(&self) -> PathBuf {
        self.config.hypervisor_db_dir().join("vms.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.store.locker().path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cocoon_core::model::VmConfig;

    fn backend(run_dir: PathBuf) -> HypervisorBackend {
        let dir = run_dir.join("db");
        let config = Config { run_dir, ..Config::default() };
        let store = Store::open(dir.join("vms.json"), dir.join("vms.lock"));
        HypervisorBackend { config, store }
    }

    fn running_vm(id: &str) -> Vm {
        Vm {
            id: id.to_owned(),
            state: VmState::Running,
            config: VmConfig { name: id.to_owned(), cpu: 1, memory_bytes: 1 << 30, storage_bytes: 1 << 30, image: "ubuntu:24.04".to_owned() },
            created_at: 0,
            updated_at: 0,
            started_at: Some(0),
            stopped_at: None,
            console_path: None,
        }
    }

    #[test]
    fn reconcile_demotes_running_with_no_pid_file_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path().to_path_buf());

        let vm = backend.reconcile(running_vm("abc123"));
        assert_eq!(vm.state, VmState::Stopped);
    }

    #[test]
    fn reconcile_leaves_non_running_states_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path().to_path_buf());

        let mut vm = running_vm("abc123");
        vm.state = VmState::Created;
        let reconciled = backend.reconcile(vm);
        assert_eq!(reconciled.state, VmState::Created);
    }
}
