//! Single-flight combinator
//!
//! Coalesces concurrent calls for the same key into one in-flight future. Every
//! caller that arrives while the future is pending receives a clone of its
//! output. Once it resolves the slot is cleared, so failures are not cached and
//! the next call starts a fresh attempt.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type Flights<K, T> = Arc<Mutex<HashMap<K, (u64, Shared<BoxFuture<'static, T>>)>>>;

pub struct SingleFlight<K, T>
where
    T: Clone,
{
    inflight: Flights<K, T>,
    next_id: AtomicU64,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `make()` for `key` unless a call for the same key is already pending,
    /// in which case join it. `make` is only invoked by the leader.
    ///
    /// The flight runs on its own task: dropping every caller does not cancel
    /// it, and the slot is cleared when it finishes.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some((_, existing)) => existing.clone(),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let work = make();
                    let flights = self.inflight.clone();
                    let slot = key.clone();
                    let fut = async move {
                        let output = work.await;
                        // 仅移除自己，避免误删后来者新建的条目
                        let mut inflight = flights.lock();
                        if inflight.get(&slot).map(|(current, _)| *current == id) == Some(true) {
                            inflight.remove(&slot);
                        }
                        output
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, (id, fut.clone()));
                    tokio::spawn(fut.clone());
                    fut
                }
            }
        };

        shared.await
    }

    /// Whether a call for `key` is currently pending
    pub fn is_pending(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
