//! Cloud-image backend for the Cocoon micro-VM engine (spec §4.4, C3b).
//!
//! Downloads a qcow2/raw cloud image from a URL, converts it to qcow2
//! (`compat=1.1`), and stores it content-addressed. [`CloudimgBackend::config`]
//! turns a resolved image into the single-disk `StorageConfig`/`BootConfig`
//! pair the hypervisor backend attaches to a UEFI-booted VM.

mod convert;
mod gc;
mod index;
mod pull;

use std::path::{Path, PathBuf};

use cocoon_core::error::{Error, Result};
use cocoon_core::model::{BootConfig, StorageConfig};
use cocoon_core::{SingleFlight, Store};

pub use gc::GcModule;
pub use index::{ImageEntry, ImageIndex};

/// Cloud-image backend. One instance per CLI invocation (spec §9).
#[derive(Debug)]
pub struct CloudimgBackend {
    root_dir: PathBuf,
    firmware_path: PathBuf,
    pub(crate) store: Store<ImageIndex>,
    inflight: SingleFlight<String>,
}

impl CloudimgBackend {
    /// Opens the backend rooted at `root_dir` (spec §6: `<root_dir>/cloudimg`),
    /// with its index lock file at `lock_path`, booting guests with the
    /// UEFI firmware at `firmware_path`.
    #[must_use]
    pub fn open(root_dir: impl Into<PathBuf>, lock_path: impl Into<PathBuf>, firmware_path: impl Into<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let store = Store::open(root_dir.join("images.json"), lock_path);
        Self {
            root_dir,
            firmware_path: firmware_path.into(),
            store,
            inflight: SingleFlight::new(),
        }
    }

    /// `<root_dir>/blobs` — where `<hex>.qcow2` images live.
    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root_dir.join("blobs")
    }

    /// `<root_dir>/temp` — scratch space for in-progress downloads and
    /// conversions, kept out of `blobs_dir` so GC cannot remove a
    /// partially-converted image (spec §4.4 step 4).
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.root_dir.join("temp")
    }

    fn qcow2_path(&self, hex: &str) -> PathBuf {
        self.blobs_dir().join(format!("{hex}.qcow2"))
    }

    /// Pulls the image at `url`, single-flighted per URL within this
    /// process (spec §4.4, I6).
    pub async fn pull(&self, url: &str, on_status: &(dyn Fn(&str) + Sync)) -> Result<ImageEntry> {
        self.inflight.run(url.to_owned(), pull::run(self, url, on_status)).await
    }

    /// Returns the cached entry for `url` if its blob is already complete
    /// on disk, otherwise pulls it.
    pub async fn ensure(&self, url: &str, on_status: &(dyn Fn(&str) + Sync)) -> Result<ImageEntry> {
        if let Some(entry) = self.store.with(|idx| idx.resolve(url).cloned()).await?
            && self.blob_present(&entry)
        {
            return Ok(entry);
        }
        self.pull(url, on_status).await
    }

    /// Lists every pulled cloud image.
    pub async fn list(&self) -> Result<Vec<ImageEntry>> {
        self.store.with(|idx| idx.images.values().cloned().collect()).await
    }

    /// Resolves one image by exact URL or content digest.
    pub async fn inspect(&self, url: &str) -> Result<ImageEntry> {
        self.store
            .with(|idx| idx.resolve(url).cloned())
            .await?
            .ok_or_else(|| Error::NotFound(url.to_owned()))
    }

    /// Removes the named image entries from the index (spec §4.4 Delete,
    /// mirroring the OCI backend's). Blob files are left for GC (I1).
    pub async fn delete(&self, refs: &[String]) -> Result<Vec<String>> {
        self.store
            .update(|idx| {
                let mut removed = Vec::new();
                for r#ref in refs {
                    let key = idx.resolve(r#ref).map(|e| e.r#ref.clone());
                    if let Some(key) = key {
                        idx.images.remove(&key);
                        removed.push(key);
                    }
                }
                Ok(removed)
            })
            .await
    }

    /// Builds the `{StorageConfig[], BootConfig}` pair for a VM created
    /// from the cloud image at `url` (spec §4.4 Config). Fails if the blob
    /// or the UEFI firmware is missing or empty.
    pub async fn config(&self, url: &str) -> Result<(Vec<StorageConfig>, BootConfig)> {
        let entry = self.inspect(url).await?;
        let path = self.qcow2_path(entry.content_sum.trim_start_matches("sha256:"));
        if !is_nonempty_file(&path) {
            return Err(Error::Validation(format!("cloud image {url} is missing or empty")));
        }
        if !is_nonempty_file(&self.firmware_path) {
            return Err(Error::Validation(format!(
                "UEFI firmware missing at {}",
                self.firmware_path.display()
            )));
        }

        let storage_configs = vec![StorageConfig {
            path: path.display().to_string(),
            read_only: true,
            serial: "cocoon-base".to_owned(),
        }];
        let boot_config = BootConfig::Uefi {
            firmware_path: self.firmware_path.display().to_string(),
        };
        Ok((storage_configs, boot_config))
    }

    /// Returns the [`GcModule`] that registers this backend with the GC
    /// orchestrator (spec §4.7).
    #[must_use]
    pub fn gc_module(&self) -> GcModule {
        GcModule::new(self.root_dir.clone(), Store::open(self.store_path(), self.lock_path()))
    }

    fn store_path(&self) -> PathBuf {
        self.root_dir.join("images.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.store.locker().path().to_path_buf()
    }

    fn blob_present(&self, entry: &ImageEntry) -> bool {
        is_nonempty_file(&self.qcow2_path(entry.content_sum.trim_start_matches("sha256:")))
    }
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}
