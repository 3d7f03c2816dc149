//! GC module registration for the OCI backend (spec §4.7: "Image GC
//! Collect").

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use cocoon_core::error::Result;
use cocoon_core::lock::Locker;
use cocoon_core::model::HypervisorSnapshot;
use cocoon_gc::{Module, Snapshot};

use crate::index::ImageIndex;

/// Temp files older than this are swept unconditionally, regardless of
/// what resolve decided to keep (spec §4.7).
const TEMP_FILE_GRACE: Duration = Duration::from_secs(3600);

/// The OCI backend's participant in the GC orchestrator.
pub struct GcModule {
    root_dir: PathBuf,
    store: cocoon_core::Store<ImageIndex>,
}

impl GcModule {
    pub(crate) fn new(root_dir: PathBuf, store: cocoon_core::Store<ImageIndex>) -> Self {
        Self { root_dir, store }
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root_dir.join("blobs")
    }

    fn boot_dir(&self) -> PathBuf {
        self.root_dir.join("boot")
    }
}

#[async_trait::async_trait]
impl Module for GcModule {
    fn name(&self) -> &str {
        "oci"
    }

    fn locker(&self) -> &Locker {
        self.store.locker()
    }

    async fn read_db(&self) -> Result<Snapshot> {
        let referenced = self.store.read_unlocked()?.referenced_hexes();
        Ok(Box::new(referenced))
    }

    fn resolve(&self, own: &Snapshot, all: &std::collections::HashMap<String, Snapshot>) -> Vec<String> {
        let mut keep = own
            .downcast_ref::<std::collections::BTreeSet<String>>()
            .cloned()
            .unwrap_or_default();
        if let Some(used) = all.get("hypervisor").and_then(|s| s.downcast_ref::<HypervisorSnapshot>()) {
            keep.extend(used.used_blob_ids.iter().cloned());
        }
        keep.into_iter().collect()
    }

    async fn collect(&self, keep_ids: &[String]) -> Result<()> {
        sweep_temp_files(&self.blobs_dir(), TEMP_FILE_GRACE)?;
        sweep_temp_files(&self.boot_dir(), TEMP_FILE_GRACE)?;

        let keep: std::collections::HashSet<&str> = keep_ids.iter().map(String::as_str).collect();

        if let Ok(entries) = std::fs::read_dir(self.blobs_dir()) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                let Some(hex) = name.strip_suffix(".erofs") else {
                    continue;
                };
                if !keep.contains(hex) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        if let Ok(entries) = std::fs::read_dir(self.boot_dir()) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                if !keep.contains(name) {
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
        }

        Ok(())
    }
}

/// Removes `.tmp-*`-named entries (files or directories) older than
/// `grace`, left behind by a process killed mid-pull.
fn sweep_temp_files(dir: &std::path::Path, grace: Duration) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(".tmp-") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(age) = now.duration_since(metadata.modified().unwrap_or(now)) else {
            continue;
        };
        if age >= grace {
            if metadata.is_dir() {
                let _ = std::fs::remove_dir_all(entry.path());
            } else {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}
