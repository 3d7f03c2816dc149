//! Persisted network index (spec §3: `NetworkRecord`, keyed per-NIC).

use std::collections::{BTreeSet, HashMap};

use cocoon_core::Document;
use serde::{Deserialize, Serialize};

/// One NIC's CNI attachment.
///
/// A VM with `numNICs = 2` owns two of these, one per `ifName`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// The named network namespace this NIC lives in (`cocoon-<vmID>`).
    pub network: String,
    /// Owning VM id.
    pub vm_id: String,
    /// Interface name inside the netns (`eth<i>`).
    pub if_name: String,
    /// Raw CNI ADD result, kept verbatim so `inspect` and DEL never need to
    /// re-derive it.
    pub cni_result: serde_json::Value,
}

/// `{networks: id -> record}`, keyed by `<vmID>/<ifName>` so each NIC has
/// its own entry under one VM's network.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NetworkIndex {
    /// Keyed by [`NetworkIndex::key`].
    #[serde(rename = "networks")]
    pub records: HashMap<String, NetworkRecord>,
}

impl Document for NetworkIndex {}

impl NetworkIndex {
    /// The index key for one VM's NIC.
    #[must_use]
    pub fn key(vm_id: &str, if_name: &str) -> String {
        format!("{vm_id}/{if_name}")
    }

    /// Every record belonging to `vm_id`, in no particular order.
    pub fn for_vm<'a>(&'a self, vm_id: &'a str) -> impl Iterator<Item = &'a NetworkRecord> {
        self.records.values().filter(move |r| r.vm_id == vm_id)
    }

    /// Every distinct VM id with at least one network record — the GC
    /// module's own snapshot.
    #[must_use]
    pub fn vm_ids(&self) -> BTreeSet<String> {
        self.records.values().map(|r| r.vm_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_vm_filters_by_owner() {
        let mut index = NetworkIndex::default();
        index.records.insert(
            NetworkIndex::key("vm-a", "eth0"),
            NetworkRecord {
                network: "cocoon-vm-a".to_owned(),
                vm_id: "vm-a".to_owned(),
                if_name: "eth0".to_owned(),
                cni_result: serde_json::json!({}),
            },
        );
        index.records.insert(
            NetworkIndex::key("vm-b", "eth0"),
            NetworkRecord {
                network: "cocoon-vm-b".to_owned(),
                vm_id: "vm-b".to_owned(),
                if_name: "eth0".to_owned(),
                cni_result: serde_json::json!({}),
            },
        );

        let found: Vec<_> = index.for_vm("vm-a").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(index.vm_ids(), BTreeSet::from(["vm-a".to_owned(), "vm-b".to_owned()]));
    }
}
