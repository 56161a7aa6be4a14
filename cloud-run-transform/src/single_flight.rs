// ABOUTME: Per-key in-flight registry so concurrent misses share one computation
// ABOUTME: Entries live only while a computation runs

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Registry<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

struct Flight<T: Clone> {
    id: u64,
    shared: Shared<BoxFuture<'static, T>>,
}

pub struct SingleFlight<T: Clone> {
    inflight: Registry<T>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Await the computation registered for `key`, starting it with `start`
    /// if none is running. Every concurrent caller gets a clone of the output.
    ///
    /// A started computation runs to completion on its own task and removes
    /// its entry when done, whether or not anyone is still waiting.
    pub async fn run<F>(&self, key: &str, start: F) -> T
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let flight = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(key) {
                Some(existing) => existing.shared.clone(),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = self.register(key, id, start());
                    inflight.insert(key.to_string(), Flight { id, shared: shared.clone() });
                    tokio::spawn(shared.clone());
                    shared
                }
            }
        };

        flight.await
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn register(&self, key: &str, id: u64, work: BoxFuture<'static, T>) -> Shared<BoxFuture<'static, T>> {
        let registry = Arc::clone(&self.inflight);
        let key = key.to_string();
        async move {
            let output = work.await;
            let mut inflight = registry.lock().unwrap_or_else(|e| e.into_inner());
            if inflight.get(&key).is_some_and(|current| current.id == id) {
                inflight.remove(&key);
            }
            output
        }
        .boxed()
        .shared()
    }
}
