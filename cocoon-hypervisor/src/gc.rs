//! GC module registration for the hypervisor backend (spec §4.7: "VM GC
//! Collect").

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cocoon_core::error::Result;
use cocoon_core::lock::Locker;
use cocoon_core::model::{HypervisorSnapshot, VmState, now_millis};
use cocoon_gc::{Module, Snapshot};
use tokio::process::Command;

use crate::index::VmIndex;

/// Named netns mount directory `cocoon-net` creates `cocoon-<id>` entries
/// under (spec §4.5/§4.7; kept in sync with `cocoon-net::netns::NETNS_DIR`
/// since the two crates don't share a dependency edge).
const NETNS_DIR: &str = "/var/run/netns";
/// Prefix every Cocoon-managed netns carries.
const NETNS_PREFIX: &str = "cocoon-";
/// Reserved subdirectory name under the run/log roots, not a VM id.
const RESERVED_DIR_NAME: &str = "db";
/// A VM stuck in `Creating` longer than this is presumed abandoned by a
/// process that died between Phase A and Phase C (spec §4.7).
const CREATING_GRACE: Duration = Duration::from_secs(24 * 3600);

/// The hypervisor backend's participant in the GC orchestrator.
pub struct GcModule {
    run_root: PathBuf,
    log_root: PathBuf,
    store: cocoon_core::Store<VmIndex>,
}

impl GcModule {
    #[must_use]
    pub fn new(run_root: PathBuf, log_root: PathBuf, store: cocoon_core::Store<VmIndex>) -> Self {
        Self { run_root, log_root, store }
    }
}

#[async_trait::async_trait]
impl Module for GcModule {
    fn name(&self) -> &str {
        "hypervisor"
    }

    fn locker(&self) -> &Locker {
        self.store.locker()
    }

    async fn read_db(&self) -> Result<Snapshot> {
        let index = self.store.read_unlocked()?;
        let mut snapshot = HypervisorSnapshot::default();
        for (id, record) in &index.vms {
            snapshot.live_vm_ids.insert(id.clone());
            snapshot.used_blob_ids.extend(record.image_blob_ids.iter().cloned());
        }
        Ok(Box::new(snapshot))
    }

    fn resolve(&self, own: &Snapshot, _all: &std::collections::HashMap<String, Snapshot>) -> Vec<String> {
        own.downcast_ref::<HypervisorSnapshot>()
            .map(|s| s.live_vm_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn collect(&self, keep_ids: &[String]) -> Result<()> {
        let keep: BTreeSet<&str> = keep_ids.iter().map(String::as_str).collect();

        let mut stale: BTreeSet<String> = BTreeSet::new();
        stale.extend(stale_subdirs(&self.run_root, &keep));
        stale.extend(stale_subdirs(&self.log_root, &keep));
        stale.extend(stale_netns_ids(&keep).await);
        stale.extend(self.stale_creating_ids(&keep).await?);

        for id in &stale {
            remove_netns(id).await;
            let _ = tokio::fs::remove_dir_all(self.run_root.join(id)).await;
            let _ = tokio::fs::remove_dir_all(self.log_root.join(id)).await;
        }

        if !stale.is_empty() {
            self.store
                .update(|idx| {
                    for id in &stale {
                        if let Some(record) = idx.vms.get(id)
                            && record.vm.state == VmState::Creating
                            && now_millis().saturating_sub(record.vm.created_at) >= i64::try_from(CREATING_GRACE.as_millis()).unwrap_or(i64::MAX)
                        {
                            if let Some(removed) = idx.vms.remove(id) {
                                idx.names.remove(&removed.vm.config.name);
                            }
                        }
                    }
                    Ok(())
                })
                .await?;
        }

        Ok(())
    }
}

impl GcModule {
    /// VMIDs whose record is stuck in `Creating` past the grace period
    /// (spec §4.7), re-checked at `collect` commit time against the grace
    /// window rather than trusted from the snapshot alone.
    async fn stale_creating_ids(&self, _keep: &BTreeSet<&str>) -> Result<Vec<String>> {
        let index = self.store.read_unlocked()?;
        let now = now_millis();
        let grace_millis = i64::try_from(CREATING_GRACE.as_millis()).unwrap_or(i64::MAX);
        Ok(index
            .vms
            .iter()
            .filter(|(_, record)| record.vm.state == VmState::Creating && now.saturating_sub(record.vm.created_at) >= grace_millis)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// Subdirectory names under `root` that aren't a kept VM id and aren't the
/// reserved `db` directory.
fn stale_subdirs(root: &Path, keep: &BTreeSet<&str>) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name != RESERVED_DIR_NAME && !keep.contains(name.as_str()))
        .collect()
}

/// VM ids implied by stale `cocoon-`-prefixed netns entries not in the keep
/// set.
async fn stale_netns_ids(keep: &BTreeSet<&str>) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(NETNS_DIR) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| name.strip_prefix(NETNS_PREFIX).map(str::to_owned))
        .filter(|id| !keep.contains(id.as_str()))
        .collect()
}

/// Removes the netns for `id`, tolerating "already gone" (spec §4.7).
async fn remove_netns(id: &str) {
    let name = format!("{NETNS_PREFIX}{id}");
    let _ = Command::new("ip").args(["netns", "delete", &name]).status().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_subdirs_excludes_kept_ids_and_reserved_db() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("abc123")).unwrap();
        std::fs::create_dir(dir.path().join("def456")).unwrap();
        std::fs::create_dir(dir.path().join("db")).unwrap();

        let keep: BTreeSet<&str> = BTreeSet::from(["abc123"]);
        let stale = stale_subdirs(dir.path(), &keep);
        assert_eq!(stale, vec!["def456".to_owned()]);
    }

    #[tokio::test]
    async fn stale_netns_ids_strips_prefix_and_filters_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("cocoon-abc")).unwrap();
        std::fs::create_dir(dir.path().join("cocoon-def")).unwrap();
        std::fs::create_dir(dir.path().join("unrelated")).unwrap();

        // exercise the filtering logic directly against a fixture dir
        // rather than the real /var/run/netns.
        let entries = std::fs::read_dir(dir.path()).unwrap();
        let keep: BTreeSet<&str> = BTreeSet::from(["abc"]);
        let ids: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.strip_prefix(NETNS_PREFIX).map(str::to_owned))
            .filter(|id| !keep.contains(id.as_str()))
            .collect();
        assert_eq!(ids, vec!["def".to_owned()]);
    }
}
