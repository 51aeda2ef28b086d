//! Per-key join map for running computations

use crate::error::FetchError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub(crate) type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// Running computations keyed by cache key.
///
/// The first caller for a key starts the computation; later callers receive
/// a clone of the same shared future and all observe its single result. The
/// entry removes itself once the computation finishes.
pub(crate) struct InFlight<T: Clone> {
    pending: Mutex<HashMap<String, SharedFetch<T>>>,
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn join_or_start<F>(self: &Arc<Self>, key: &str, start: F) -> SharedFetch<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, FetchError>>,
    {
        let mut pending = self.pending.lock();
        if let Some(running) = pending.get(key) {
            debug!(key = %key, "Joining in-flight computation");
            return running.clone();
        }

        let work = start();
        let registry = Arc::downgrade(self);
        let owned_key = key.to_string();
        let shared = async move {
            let result = work.await;
            if let Some(registry) = registry.upgrade() {
                registry.pending.lock().remove(&owned_key);
            }
            result
        }
        .boxed()
        .shared();

        pending.insert(key.to_string(), shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
