//! Locked read / atomic read-modify-write of a typed JSON document (spec
//! §4.2, C2).
//!
//! The atomic-replace step (`write .tmp`, `sync_all`, `rename`) is carried
//! over unchanged from this workspace's existing content-addressed blob
//! store, generalized from a SQLite-backed index into a JSON document
//! guarded by [`crate::lock::Locker`].

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::lock::{Guard, Locker};

/// A document type persisted by [`Store`]. `init` re-creates any map field
/// that would otherwise deserialize to `null` from an empty/missing file —
/// the JSON equivalent of the teacher's SQLite schema defaults.
pub trait Document: Default + Serialize + DeserializeOwned + Send + 'static {
    /// Normalizes a freshly deserialized value (e.g. replacing absent maps
    /// with empty ones). Default implementation is a no-op.
    fn init(&mut self) {}
}

/// Locked JSON document store. One `Store<T>` per persisted file
/// (`images.json`, `vms.json`, `networks.json`, ...).
#[derive(Debug, Clone)]
pub struct Store<T> {
    path: PathBuf,
    locker: Locker,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Document> Store<T> {
    /// Opens a store at `path`, with its companion lock file at
    /// `path.with_extension("lock")`-style sibling name `lock_path`.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            locker: Locker::new(lock_path),
            _marker: std::marker::PhantomData,
        }
    }

    /// Locker guarding this store's document, exposed so GC can
    /// `try_lock`/`read_unlocked`/`write_unlocked` across its snapshot gap.
    #[must_use]
    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Acquires the lock, reads and deserializes the document (a fresh
    /// `T::default()` if the file is missing), runs `fn`, and releases the
    /// lock. `fn` cannot observe or cause writes.
    pub async fn with<R>(&self, f: impl FnOnce(&T) -> R + Send) -> Result<R>
    where
        R: Send + 'static,
    {
        let _guard = self.locker.lock().await?;
        let doc = self.read_unlocked()?;
        Ok(f(&doc))
    }

    /// Acquires the lock, reads the document, runs `f`, and — if `f`
    /// returns `Ok` — atomically replaces the file with the serialized
    /// result. On `Err`, the file is left untouched (P6).
    pub async fn update<R: Send>(&self, f: impl FnOnce(&mut T) -> Result<R> + Send) -> Result<R> {
        let _guard = self.locker.lock().await?;
        let mut doc = self.read_unlocked()?;
        let result = f(&mut doc)?;
        self.write_unlocked(&doc)?;
        Ok(result)
    }

    /// Attempts to acquire the lock without blocking; `None` if busy.
    pub async fn try_lock(&self) -> Result<Option<Guard>> {
        self.locker.try_lock().await
    }

    /// Reads the document assuming the caller already holds the lock (via
    /// [`Store::try_lock`]). Used by GC to split snapshot and collect
    /// phases across an unlocked gap.
    pub fn read_unlocked(&self) -> Result<T> {
        let mut doc = match std::fs::read(&self.path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            _ => T::default(),
        };
        doc.init();
        Ok(doc)
    }

    /// Atomically replaces the document, assuming the caller already holds
    /// the lock. Writes to `<path>.tmp`, `fsync`s, then renames over
    /// `<path>` — the rename is the sole observable write, so a crash
    /// mid-write never yields a truncated file (P6).
    pub fn write_unlocked(&self, doc: &T) -> Result<()> {
        atomic_write_json(&self.path, doc)
    }
}

/// Serializes `doc` and writes it to `path` via the write-tmp/fsync/rename
/// idiom shared by every persisted document in this codebase.
pub fn atomic_write_json<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(doc)?;
    atomic_write(&tmp, path, &bytes)
}

/// Writes `bytes` to `tmp_path`, `fsync`s it, then renames it onto `path`.
pub fn atomic_write(tmp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write as _;

    let mut file = std::fs::File::create(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Index {
        images: std::collections::HashMap<String, String>,
    }

    impl Document for Index {}

    #[tokio::test]
    async fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Index> = Store::open(dir.path().join("images.json"), dir.path().join("images.lock"));
        let doc = store.with(|d| d.images.len()).await.unwrap();
        assert_eq!(doc, 0);
    }

    #[tokio::test]
    async fn update_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("images.json");
        let lock = dir.path().join("images.lock");
        let store: Store<Index> = Store::open(&data, &lock);
        store
            .update(|d| {
                d.images.insert("ref".into(), "digest".into());
                Ok(())
            })
            .await
            .unwrap();

        let store2: Store<Index> = Store::open(&data, &lock);
        let v = store2
            .with(|d| d.images.get("ref").cloned())
            .await
            .unwrap();
        assert_eq!(v.as_deref(), Some("digest"));
    }

    #[tokio::test]
    async fn failed_update_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("images.json");
        let lock = dir.path().join("images.lock");
        let store: Store<Index> = Store::open(&data, &lock);
        store
            .update(|d| {
                d.images.insert("ref".into(), "digest".into());
                Ok(())
            })
            .await
            .unwrap();

        let err = store
            .update(|d| -> Result<()> {
                d.images.insert("ref".into(), "corrupted".into());
                Err(crate::error::Error::Validation("boom".into()))
            })
            .await;
        assert!(err.is_err());

        let v = store
            .with(|d| d.images.get("ref").cloned())
            .await
            .unwrap();
        assert_eq!(v.as_deref(), Some("digest"));
    }
}
