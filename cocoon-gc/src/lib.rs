//! Cross-module garbage collection orchestrator (spec §4.7, C6).
//!
//! Each backend registers a [`Module`] — a typed snapshot of what it owns
//! plus `resolve`/`collect` callbacks. The orchestrator runs every
//! registered module through three phases with no module ever holding its
//! lock across another module's work:
//!
//! 1. **Snapshot** — `try_lock`, `read_db`, unlock. A busy module is
//!    skipped for this run rather than blocking the others.
//! 2. **Resolve** — no locks held. Each module sees every module's
//!    snapshot (type-erased) and returns the ids it still needs.
//! 3. **Collect** — `try_lock`, `collect(ids)`, unlock. Runs even with an
//!    empty `ids` list so a module can do lock-scoped housekeeping (stale
//!    temp file sweeps) independent of cross-module resolution.

use std::any::Any;
use std::collections::HashMap;

use cocoon_core::error::{Result, join_errors};
use cocoon_core::lock::Locker;

/// A type-erased snapshot produced by [`Module::read_db`]. Downcast with
/// `.downcast_ref::<T>()` inside [`Module::resolve`].
pub type Snapshot = Box<dyn Any + Send>;

/// One GC-participating subsystem.
///
/// Implementors keep `&self` borrows only for the duration of a single
/// method call — the orchestrator never holds a `Module` across an
/// `.await` boundary of another module.
#[async_trait::async_trait]
pub trait Module: Send + Sync {
    /// Stable name this module snapshots and resolves under (`"oci"`,
    /// `"cloudimg"`, `"hypervisor"`, `"network"`).
    fn name(&self) -> &str;

    /// The lock this module's on-disk state is guarded by.
    fn locker(&self) -> &Locker;

    /// Reads this module's state into a snapshot. Called with the lock
    /// held.
    async fn read_db(&self) -> Result<Snapshot>;

    /// Given this module's own snapshot and every module's snapshot
    /// (including its own, under its `name()`), returns the ids this
    /// module should keep. Called with no locks held.
    fn resolve(&self, own: &Snapshot, all: &HashMap<String, Snapshot>) -> Vec<String>;

    /// Removes everything not in `keep_ids`, plus any lock-scoped
    /// housekeeping (stale temp files). Called with the lock held, even
    /// when `keep_ids` turned out empty.
    async fn collect(&self, keep_ids: &[String]) -> Result<()>;
}

/// Runs every registered [`Module`] through one snapshot/resolve/collect
/// cycle.
#[derive(Default)]
pub struct Orchestrator {
    modules: Vec<Box<dyn Module>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("modules", &self.modules.iter().map(|m| m.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with no modules registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module to participate in future [`Orchestrator::run`]
    /// calls.
    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    /// Runs one full GC cycle across every registered module.
    pub async fn run(&self) -> Result<()> {
        let snapshots = self.snapshot_phase().await;
        let keep = self.resolve_phase(&snapshots);
        self.collect_phase(&keep).await
    }

    async fn snapshot_phase(&self) -> HashMap<String, Snapshot> {
        let mut snapshots = HashMap::new();
        for module in &self.modules {
            let name = module.name();
            match module.locker().try_lock().await {
                Ok(Some(_guard)) => match module.read_db().await {
                    Ok(snapshot) => {
                        snapshots.insert(name.to_owned(), snapshot);
                    }
                    Err(error) => {
                        tracing::warn!(module = name, %error, "gc: read_db failed, skipping this cycle");
                    }
                },
                Ok(None) => {
                    tracing::info!(module = name, "gc: locked by another process, skipping snapshot");
                }
                Err(error) => {
                    tracing::warn!(module = name, %error, "gc: try_lock failed, skipping snapshot");
                }
            }
        }
        snapshots
    }

    fn resolve_phase(&self, snapshots: &HashMap<String, Snapshot>) -> HashMap<String, Vec<String>> {
        let mut keep = HashMap::new();
        for module in &self.modules {
            let name = module.name();
            if let Some(own) = snapshots.get(name) {
                keep.insert(name.to_owned(), module.resolve(own, snapshots));
            }
        }
        keep
    }

    async fn collect_phase(&self, keep: &HashMap<String, Vec<String>>) -> Result<()> {
        let mut errors = Vec::new();
        for module in &self.modules {
            let name = module.name();
            let Some(ids) = keep.get(name) else {
                // Module was skipped at snapshot time; leave its state
                // untouched rather than collecting against a stale view.
                continue;
            };
            match module.locker().try_lock().await {
                Ok(Some(_guard)) => {
                    if let Err(error) = module.collect(ids).await {
                        errors.push((name.to_owned(), error));
                    }
                }
                Ok(None) => {
                    tracing::info!(module = name, "gc: locked by another process, skipping collect");
                }
                Err(error) => errors.push((name.to_owned(), error)),
            }
        }
        join_errors(errors).map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use cocoon_core::error::Error;

    use super::*;

    struct CountingModule {
        name: &'static str,
        locker: Locker,
        collected: Arc<AtomicUsize>,
        keep: Vec<String>,
    }

    #[async_trait::async_trait]
    impl Module for CountingModule {
        fn name(&self) -> &str {
            self.name
        }

        fn locker(&self) -> &Locker {
            &self.locker
        }

        async fn read_db(&self) -> Result<Snapshot> {
            Ok(Box::new(self.keep.clone()))
        }

        fn resolve(&self, own: &Snapshot, _all: &HashMap<String, Snapshot>) -> Vec<String> {
            own.downcast_ref::<Vec<String>>().cloned().unwrap_or_default()
        }

        async fn collect(&self, _keep_ids: &[String]) -> Result<()> {
            self.collected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_collect_for_every_snapshotted_module() {
        let dir = tempfile::tempdir().unwrap();
        let collected = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new();
        orchestrator.register(Box::new(CountingModule {
            name: "a",
            locker: Locker::new(dir.path().join("a.lock")),
            collected: Arc::clone(&collected),
            keep: vec!["x".to_owned()],
        }));
        orchestrator.register(Box::new(CountingModule {
            name: "b",
            locker: Locker::new(dir.path().join("b.lock")),
            collected: Arc::clone(&collected),
            keep: vec![],
        }));

        orchestrator.run().await.unwrap();
        assert_eq!(collected.load(Ordering::SeqCst), 2);
    }

    struct FailingCollect {
        locker: Locker,
    }

    #[async_trait::async_trait]
    impl Module for FailingCollect {
        fn name(&self) -> &str {
            "failing"
        }

        fn locker(&self) -> &Locker {
            &self.locker
        }

        async fn read_db(&self) -> Result<Snapshot> {
            Ok(Box::new(Vec::<String>::new()))
        }

        fn resolve(&self, _own: &Snapshot, _all: &HashMap<String, Snapshot>) -> Vec<String> {
            Vec::new()
        }

        async fn collect(&self, _keep_ids: &[String]) -> Result<()> {
            Err(Error::Validation("boom".to_owned()))
        }
    }

    #[tokio::test]
    async fn collect_error_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new();
        orchestrator.register(Box::new(FailingCollect {
            locker: Locker::new(dir.path().join("f.lock")),
        }));
        let err = orchestrator.run().await;
        assert!(err.is_err());
    }
}
