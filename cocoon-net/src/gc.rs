//! GC module registration for the network backend (spec §4.7: "VM GC
//! Collect" pruning, seen from the network side).
//!
//! Stale netns/veth teardown itself is the hypervisor module's job (it
//! owns the VMID set `resolve` needs); this module only prunes
//! [`NetworkRecord`]s whose owning VM no longer exists, once the
//! hypervisor's own collect pass has already removed the netns.

use cocoon_core::error::Result;
use cocoon_core::lock::Locker;
use cocoon_core::model::HypervisorSnapshot;
use cocoon_gc::{Module, Snapshot};

use crate::index::NetworkIndex;

/// The network backend's participant in the GC orchestrator.
pub struct GcModule {
    store: cocoon_core::Store<NetworkIndex>,
}

impl GcModule {
    pub(crate) fn new(store: cocoon_core::Store<NetworkIndex>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Module for GcModule {
    fn name(&self) -> &str {
        "network"
    }

    fn locker(&self) -> &Locker {
        self.store.locker()
    }

    async fn read_db(&self) -> Result<Snapshot> {
        let vm_ids = self.store.read_unlocked()?.vm_ids();
        Ok(Box::new(vm_ids))
    }

    fn resolve(&self, own: &Snapshot, all: &std::collections::HashMap<String, Snapshot>) -> Vec<String> {
        let own = own.downcast_ref::<std::collections::BTreeSet<String>>().cloned().unwrap_or_default();
        let Some(hypervisor) = all.get("hypervisor").and_then(|s| s.downcast_ref::<HypervisorSnapshot>()) else {
            // No hypervisor snapshot this cycle (busy or not registered):
            // keep every known VM id rather than guess which are gone.
            return own.into_iter().collect();
        };
        own.into_iter().filter(|id| hypervisor.live_vm_ids.contains(id)).collect()
    }

    async fn collect(&self, keep_ids: &[String]) -> Result<()> {
        let keep: std::collections::HashSet<&str> = keep_ids.iter().map(String::as_str).collect();
        self.store
            .update(|idx| {
                idx.records.retain(|_, record| keep.contains(record.vm_id.as_str()));
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::NetworkRecord;

    fn make_store(dir: &std::path::Path) -> cocoon_core::Store<NetworkIndex> {
        cocoon_core::Store::open(dir.join("networks.json"), dir.join("networks.lock"))
    }

    #[tokio::test]
    async fn resolve_without_hypervisor_snapshot_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        let module = GcModule::new(store);
        let own: Snapshot = Box::new(std::collections::BTreeSet::from(["vm-a".to_owned()]));
        let kept = module.resolve(&own, &std::collections::HashMap::new());
        assert_eq!(kept, vec!["vm-a".to_owned()]);
    }

    #[tokio::test]
    async fn collect_drops_records_for_vm_ids_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path());
        store
            .update(|idx| {
                idx.records.insert(
                    NetworkIndex::key("vm-a", "eth0"),
                    NetworkRecord {
                        network: "cocoon-vm-a".to_owned(),
                        vm_id: "vm-a".to_owned(),
                        if_name: "eth0".to_owned(),
                        cni_result: serde_json::json!({}),
                    },
                );
                idx.records.insert(
                    NetworkIndex::key("vm-b", "eth0"),
                    NetworkRecord {
                        network: "cocoon-vm-b".to_owned(),
                        vm_id: "vm-b".to_owned(),
                        if_name: "eth0".to_owned(),
                        cni_result: serde_json::json!({}),
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        let module = GcModule::new(store);
        module.collect(&["vm-a".to_owned()]).await.unwrap();

        let remaining = module.store.with(|idx| idx.records.len()).await.unwrap();
        assert_eq!(remaining, 1);
        let has_a = module.store.with(|idx| idx.records.contains_key(&NetworkIndex::key("vm-a", "eth0"))).await.unwrap();
        assert!(has_a);
    }
}
