//! OCI image backend for the Cocoon micro-VM engine (spec §4.3, C3a).
//!
//! Pulls container images from an OCI registry, converts each layer into a
//! content-addressed EROFS file, and extracts any kernel/initrd boot files
//! found inside. [`OciBackend::config`] turns a resolved image into the
//! `StorageConfig`/`BootConfig` pair the hypervisor backend attaches to a
//! VM.

mod gc;
mod index;
mod layer;
mod pull;

use std::path::{Path, PathBuf};

use cocoon_core::error::{Error, Result};
use cocoon_core::model::{BootConfig, StorageConfig};
use cocoon_core::{SingleFlight, Store};
use oci_client::client::ClientConfig;
use oci_client::secrets::RegistryAuth;

pub use gc::GcModule;
pub use index::{ImageEntry, ImageIndex, LayerBootFiles, normalize_ref};
pub use layer::BootFiles;

/// OCI image backend. One instance per CLI invocation (spec §9): nothing
/// here survives past the command that constructed it except what's on
/// disk.
#[derive(Debug)]
pub struct OciBackend {
    root_dir: PathBuf,
    pub(crate) store: Store<ImageIndex>,
    pub(crate) client: oci_client::Client,
    pub(crate) auth: RegistryAuth,
    inflight: SingleFlight<String>,
}

impl OciBackend {
    /// Opens the backend rooted at `root_dir` (spec §6: `<root_dir>/oci`),
    /// with its index lock file at `lock_path`.
    #[must_use]
    pub fn open(root_dir: impl Into<PathBuf>, lock_path: impl Into<PathBuf>, auth: RegistryAuth) -> Self {
        let root_dir = root_dir.into();
        let store = Store::open(root_dir.join("images.json"), lock_path);
        let client = oci_client::Client::new(ClientConfig::default());
        Self {
            root_dir,
            store,
            client,
            auth,
            inflight: SingleFlight::new(),
        }
    }

    /// `<root_dir>/blobs` — where `<hex>.erofs` layer files live.
    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root_dir.join("blobs")
    }

    /// `<root_dir>/boot` — where `<hex>/{vmlinuz,initrd.img}` live.
    #[must_use]
    pub fn boot_dir(&self) -> PathBuf {
        self.root_dir.join("boot")
    }

    fn erofs_path(&self, hex: &str) -> PathBuf {
        self.blobs_dir().join(format!("{hex}.erofs"))
    }

    /// Pulls `image_ref`, single-flighted per normalized ref within this
    /// process (spec §4.3, I6).
    pub async fn pull(&self, image_ref: &str, on_status: &(dyn Fn(&str) + Sync)) -> Result<ImageEntry> {
        let key = normalize_ref(image_ref);
        self.inflight.run(key, pull::run(self, image_ref, on_status)).await
    }

    /// Returns the cached entry for `image_ref` if its blobs are already
    /// complete on disk, otherwise pulls it.
    pub async fn ensure(&self, image_ref: &str, on_status: &(dyn Fn(&str) + Sync)) -> Result<ImageEntry> {
        if let Some(entry) = self.store.with(|idx| idx.resolve(image_ref).cloned()).await?
            && self.layers_present(&entry)
        {
            return Ok(entry);
        }
        self.pull(image_ref, on_status).await
    }

    /// Lists every pulled image.
    pub async fn list(&self) -> Result<Vec<ImageEntry>> {
        self.store.with(|idx| idx.images.values().cloned().collect()).await
    }

    /// Resolves one image by exact ref, normalized ref, or manifest digest.
    pub async fn inspect(&self, image_ref: &str) -> Result<ImageEntry> {
        self.store
            .with(|idx| idx.resolve(image_ref).cloned())
            .await?
            .ok_or_else(|| Error::NotFound(image_ref.to_owned()))
    }

    /// Removes the named image entries from the index (spec §4.3 Delete).
    /// Blob files are left for GC to reclaim once unreferenced (I1).
    /// Returns the refs actually removed.
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
    /// from `image_ref` (spec §4.3 Config). Fails if any referenced blob or
    /// boot file is missing or empty.
    pub async fn config(&self, image_ref: &str) -> Result<(Vec<StorageConfig>, BootConfig)> {
        let entry = self.inspect(image_ref).await?;

        let mut storage_configs = Vec::with_capacity(entry.layers.len());
        for (i, hex) in entry.layers.iter().enumerate() {
            let path = self.erofs_path(hex);
            if !is_nonempty_file(&path) {
                return Err(Error::Validation(format!(
                    "layer {hex} for {image_ref} is missing or empty"
                )));
            }
            storage_configs.push(StorageConfig {
                path: path.display().to_string(),
                read_only: true,
                serial: format!("cocoon-layer{i}"),
            });
        }

        let (Some(kernel_hex), Some(initrd_hex)) = (&entry.kernel_layer, &entry.initrd_layer) else {
            return Err(Error::Validation(format!(
                "image {image_ref} provides no kernel/initrd boot files"
            )));
        };
        let kernel_path = self.boot_dir().join(kernel_hex).join("vmlinuz");
        let initrd_path = self.boot_dir().join(initrd_hex).join("initrd.img");
        if !is_nonempty_file(&kernel_path) || !is_nonempty_file(&initrd_path) {
            return Err(Error::Validation(format!(
                "boot files for {image_ref} are missing or empty"
            )));
        }

        let boot_config = BootConfig::Direct {
            kernel_path: kernel_path.display().to_string(),
            initrd_path: initrd_path.display().to_string(),
            cmdline: "console=ttyS0 reboot=k panic=1 rootfstype=erofs".to_owned(),
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

    fn layers_present(&self, entry: &ImageEntry) -> bool {
        let layers_ok = entry.layers.iter().all(|hex| is_nonempty_file(&self.erofs_path(hex)));
        let boot_ok = match (&entry.kernel_layer, &entry.initrd_layer) {
            (Some(k), Some(i)) => {
                is_nonempty_file(&self.boot_dir().join(k).join("vmlinuz"))
                    && is_nonempty_file(&self.boot_dir().join(i).join("initrd.img"))
            }
            (None, None) => true,
            _ => false,
        };
        layers_ok && boot_ok
    }
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}
