//! Per-key single-flight deduplication for concurrent pulls within one
//! process (spec I6, P7).
//!
//! Grounded on the per-digest build-lock pattern used elsewhere in this
//! pack for deduplicating concurrent image builds: a map from key to a
//! per-key mutex, so two callers racing on the same key serialize on each
//! other while callers on different keys run fully in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Deduplicates concurrent operations keyed by `K` within one process.
/// Scoped to the lifetime of the backend struct that owns it (spec's
/// stated "in-process only" decision — see DESIGN.md Open Questions).
#[derive(Debug)]
pub struct SingleFlight<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for SingleFlight<K>
where
    K: Eq + std::hash::Hash,
{
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> SingleFlight<K>
where
    K: Eq + std::hash::Hash + Clone,
{
    /// Creates an empty single-flight map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access for `key`: a second concurrent call
    /// for the same key waits for the first to finish (and then typically
    /// observes the idempotency fast path the caller already checks for)
    /// rather than racing a duplicate pull.
    pub async fn run<R>(&self, key: K, f: impl Future<Output = R>) -> R {
        let per_key = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let _guard = per_key.lock().await;
        f.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_key_serializes() {
        let flight: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            let flight = Arc::clone(&flight);
            handles.push(tokio::spawn(async move {
                flight
                    .run("ref".to_owned(), async {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(before, 0, "overlapping execution for the same key");
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
