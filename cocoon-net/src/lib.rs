//! CNI-backed network provider for the Cocoon micro-VM engine (spec §4.5,
//! C4).
//!
//! Produces the per-NIC [`NetworkConfig`] the hypervisor backend attaches a
//! VM with: a tap device inside a named netns, wired to a CNI-managed veth
//! via bidirectional TC redirect filters rather than a bridge, so the guest
//! sees the veth's real MAC.

mod cni;
mod gc;
mod index;
mod netns;

use std::path::PathBuf;

use cocoon_core::error::{Error, Result};
use cocoon_core::model::{NetworkAttachment, NetworkConfig, VmConfig};
use cocoon_core::Store;

pub use gc::GcModule;
pub use index::{NetworkIndex, NetworkRecord};

/// Maximum tap queues wired for a multiqueue NIC, independent of vCPU
/// count (cloud-hypervisor's own practical ceiling for virtio-net).
const MAX_QUEUES: u32 = 8;

/// Network backend. One instance per CLI invocation (spec §9).
#[derive(Debug)]
pub struct NetworkBackend {
    root_dir: PathBuf,
    conf_dir: PathBuf,
    bin_dir: PathBuf,
    store: Store<NetworkIndex>,
}

impl NetworkBackend {
    /// Opens the backend rooted at `root_dir` (spec §6: `<root_dir>/cni`),
    /// resolving CNI plugins from `conf_dir`/`bin_dir`.
    #[must_use]
    pub fn open(
        root_dir: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
        conf_dir: impl Into<PathBuf>,
        bin_dir: impl Into<PathBuf>,
    ) -> Self {
        let root_dir = root_dir.into();
        let store = Store::open(root_dir.join("networks.json"), lock_path);
        Self {
            root_dir,
            conf_dir: conf_dir.into(),
            bin_dir: bin_dir.into(),
            store,
        }
    }

    /// Builds the `numNICs` network attachments for `vm_id` (spec §4.5
    /// Config). `0` NICs is a no-op returning an empty list; no netns is
    /// created. On any failure, every NIC already added is torn down
    /// (CNI DEL) and the netns removed before the error is returned.
    pub async fn config(&self, vm_id: &str, num_nics: u32, vm_config: &VmConfig) -> Result<Vec<NetworkConfig>> {
        if num_nics == 0 {
            return Ok(Vec::new());
        }

        let network_name = netns_name(vm_id);
        netns::add(&network_name).await?;

        let multi_queue = vm_config.cpu > 1;
        let queue_size = u16::try_from(vm_config.cpu.min(MAX_QUEUES)).unwrap_or(1);

        let mut added_if_names = Vec::new();
        let mut configs = Vec::new();
        let mut records = Vec::new();

        let result = self
            .wire_all_nics(&network_name, vm_id, num_nics, multi_queue, queue_size, &mut added_if_names, &mut configs, &mut records)
            .await;

        if let Err(error) = result {
            self.rollback(&network_name, vm_id, &added_if_names).await;
            return Err(error);
        }

        self.store
            .update(|idx| {
                for record in records {
                    let key = NetworkIndex::key(&record.vm_id, &record.if_name);
                    idx.records.insert(key, record);
                }
                Ok(())
            })
            .await?;

        Ok(configs)
    }

    #[allow(clippy::too_many_arguments)]
    async fn wire_all_nics(
        &self,
        network_name: &str,
        vm_id: &str,
        num_nics: u32,
        multi_queue: bool,
        queue_size: u16,
        added_if_names: &mut Vec<String>,
        configs: &mut Vec<NetworkConfig>,
        records: &mut Vec<NetworkRecord>,
    ) -> Result<()> {
        let netns_path = netns::netns_path(network_name);
        for i in 0..num_nics {
            let if_name = format!("eth{i}");
            let tap_name = format!("tap{i}");

            let cni_result = cni::add(&self.conf_dir, &self.bin_dir, vm_id, &netns_path, &if_name).await?;
            added_if_names.push(if_name.clone());

            let (ip, gateway, prefix) = cni_result.primary_ip()?;
            let wired = netns::wire_nic(network_name, &if_name, &tap_name, multi_queue).await?;

            let attachment = NetworkAttachment {
                id: network_name.to_owned(),
                r#type: "cni".to_owned(),
                ip,
                gateway,
                prefix,
                hostname: None,
            };
            configs.push(NetworkConfig {
                tap: tap_name,
                mac: wired.mac,
                queue: multi_queue,
                queue_size,
                network: Some(attachment),
            });
            records.push(NetworkRecord {
                network: network_name.to_owned(),
                vm_id: vm_id.to_owned(),
                if_name,
                cni_result: serde_json::to_value(&cni_result)?,
            });
        }
        Ok(())
    }

    async fn rollback(&self, network_name: &str, vm_id: &str, added_if_names: &[String]) {
        let netns_path = netns::netns_path(network_name);
        for if_name in added_if_names {
            cni::del(&self.conf_dir, &self.bin_dir, vm_id, &netns_path, if_name).await;
        }
        if let Err(error) = netns::remove(network_name).await {
            tracing::warn!(%error, netns = network_name, "config rollback: failed to remove netns");
        }
    }

    /// Tears down every NIC belonging to each VM id in `vm_ids`: CNI DEL
    /// (best-effort), netns removal, then record deletion under lock
    /// (spec §4.5 Delete).
    pub async fn delete(&self, vm_ids: &[String]) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for vm_id in vm_ids {
            let records: Vec<NetworkRecord> = self
                .store
                .with({
                    let vm_id = vm_id.clone();
                    move |idx| idx.for_vm(&vm_id).cloned().collect()
                })
                .await?;
            if records.is_empty() {
                continue;
            }

            let network_name = netns_name(vm_id);
            let netns_path = netns::netns_path(&network_name);
            for record in &records {
                cni::del(&self.conf_dir, &self.bin_dir, vm_id, &netns_path, &record.if_name).await;
            }
            let _ = netns::remove(&network_name).await;

            self.store
                .update({
                    let vm_id = vm_id.clone();
                    move |idx| {
                        idx.records.retain(|_, r| r.vm_id != vm_id);
                        Ok(())
                    }
                })
                .await?;
            deleted.push(vm_id.clone());
        }
        Ok(deleted)
    }

    /// Lists every persisted NIC record.
    pub async fn list(&self) -> Result<Vec<NetworkRecord>> {
        self.store.with(|idx| idx.records.values().cloned().collect()).await
    }

    /// Returns the NIC records belonging to `vm_id`.
    pub async fn inspect(&self, vm_id: &str) -> Result<Vec<NetworkRecord>> {
        let records: Vec<NetworkRecord> = self
            .store
            .with({
                let vm_id = vm_id.to_owned();
                move |idx| idx.for_vm(&vm_id).cloned().collect()
            })
            .await?;
        if records.is_empty() {
            return Err(Error::NotFound(vm_id.to_owned()));
        }
        Ok(records)
    }

    /// Returns the [`GcModule`] that registers this backend with the GC
    /// orchestrator (spec §4.7).
    #[must_use]
    pub fn gc_module(&self) -> GcModule {
        GcModule::new(Store::open(self.store_path(), self.lock_path()))
    }

    fn store_path(&self) -> PathBuf {
        self.root_dir.join("networks.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.store.locker().path().to_path_buf()
    }
}

/// Derives the named-netns identifier for a VM (spec §6: `cocoon-<vmID>`).
#[must_use]
pub fn netns_name(vm_id: &str) -> String {
    format!("cocoon-{vm_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_zero_nics_is_a_noop() {
        // num_nics == 0 must short-circuit before touching netns/CNI;
        // exercised in lib.rs because config() is otherwise only
        // reachable through live subprocess calls.
        let dir = tempfile::tempdir().unwrap();
        let backend = NetworkBackend::open(dir.path(), dir.path().join("networks.lock"), dir.path(), dir.path());
        let vm_config = VmConfig {
            name: "vm-a".to_owned(),
            cpu: 2,
            memory_bytes: 1 << 30,
            storage_bytes: 10 << 30,
            image: "ubuntu:24.04".to_owned(),
        };
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(backend.config("vm-a", 0, &vm_config));
        assert_eq!(result.unwrap(), Vec::new());
    }

    #[test]
    fn netns_name_is_prefixed() {
        assert_eq!(netns_name("abc123"), "cocoon-abc123");
    }
}
