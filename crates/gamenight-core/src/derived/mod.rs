//! Cached, refreshable aggregates
//!
//! A [`DerivedData`] hook reads one aggregate for one subject through the
//! tiered cache, falling back to its [`AggregateLoader`]:
//!
//! 1. forced refresh skips to step 4
//! 2. memory tier (`from_cache`)
//! 3. durable tier, repopulating memory (`from_cache`)
//! 4. run the loader and write through both tiers
//!
//! Step 4 runs at most once per key at a time: concurrent callers join the
//! running computation and share its result.

mod in_flight;
pub mod profile_stats;

pub use profile_stats::{
    invalidate_profile_stats, profile_stats_key, ProfileStats, ProfileStatsLoader,
    PROFILE_STATS_NAMESPACE,
};

use crate::backend::Backend;
use crate::cache::{cache_key, TieredCache};
use crate::error::FetchError;
use crate::event::CacheEvent;
use async_trait::async_trait;
use futures::FutureExt;
use in_flight::InFlight;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Computes one aggregate from the backend
#[async_trait]
pub trait AggregateLoader: Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Cache key namespace; keys are `<namespace>_<subject id>`
    fn namespace(&self) -> &str;

    /// Entry lifetime; `None` uses the cache's `default_ttl_ms`
    fn ttl(&self) -> Option<Duration> {
        None
    }

    async fn load(&self, subject_id: &str) -> Result<Self::Output, FetchError>;
}

/// Whose aggregate a hook reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Id(String),
    /// Resolved through [`Backend::current_user_id`] on every read
    CurrentUser,
}

/// Observable state of a hook
#[derive(Debug, Clone, PartialEq)]
pub struct HookState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<String>,
    pub from_cache: bool,
}

impl<T> Default for HookState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            from_cache: false,
        }
    }
}

/// Loader plus the collaborators every hook built from it shares
pub struct DerivedSource<L: AggregateLoader> {
    loader: Arc<L>,
    cache: Arc<TieredCache>,
    backend: Arc<dyn Backend>,
    in_flight: Arc<InFlight<L::Output>>,
}

impl<L: AggregateLoader> Clone for DerivedSource<L> {
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
            cache: self.cache.clone(),
            backend: self.backend.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<L: AggregateLoader> DerivedSource<L> {
    pub fn new(loader: L, cache: Arc<TieredCache>, backend: Arc<dyn Backend>) -> Self {
        Self {
            loader: Arc::new(loader),
            cache,
            backend,
            in_flight: Arc::new(InFlight::new()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Hook for an explicit subject
    pub fn for_subject(&self, id: impl Into<String>) -> DerivedData<L> {
        DerivedData::new(self.clone(), Subject::Id(id.into()))
    }

    /// Hook for whoever is signed in
    pub fn for_current_user(&self) -> DerivedData<L> {
        DerivedData::new(self.clone(), Subject::CurrentUser)
    }

    /// Computations currently running
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

struct Hook<L: AggregateLoader> {
    source: DerivedSource<L>,
    subject: Subject,
    state: watch::Sender<HookState<L::Output>>,
    last_key: Mutex<Option<String>>,
    /// Invalidations this hook published itself; watchers skip them
    own_invalidations: AtomicU64,
}

/// Cached aggregate for one subject
///
/// Clones share state.
pub struct DerivedData<L: AggregateLoader> {
    hook: Arc<Hook<L>>,
}

impl<L: AggregateLoader> Clone for DerivedData<L> {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.clone(),
        }
    }
}

impl<L: AggregateLoader> DerivedData<L> {
    pub fn new(source: DerivedSource<L>, subject: Subject) -> Self {
        let (state, _) = watch::channel(HookState::default());
        Self {
            hook: Arc::new(Hook {
                source,
                subject,
                state,
                last_key: Mutex::new(None),
                own_invalidations: AtomicU64::new(0),
            }),
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.hook.subject
    }

    pub fn state(&self) -> HookState<L::Output> {
        self.hook.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<HookState<L::Output>> {
        self.hook.state.subscribe()
    }

    /// Read through the cache, computing on a miss
    pub async fn load(&self) -> Result<L::Output, FetchError> {
        self.hook.fetch(false).await
    }

    /// Skip the cache and recompute
    pub async fn refresh(&self) -> Result<L::Output, FetchError> {
        self.hook.fetch(true).await
    }

    /// Drop the cached entry from both tiers, then recompute
    pub async fn invalidate(&self) -> Result<L::Output, FetchError> {
        let key = match self.hook.resolve().await {
            Ok((_, key)) => key,
            Err(e) => {
                self.hook.fail(&e);
                return Err(e);
            }
        };
        self.hook.own_invalidations.fetch_add(1, Ordering::SeqCst);
        self.hook.source.cache.invalidate(&key).await;
        self.hook.fetch(true).await
    }

    /// Refresh whenever the cache reports this hook's entry invalidated.
    ///
    /// Watches the key of the most recent read, so call [`Self::load`]
    /// first. Invalidations issued through [`Self::invalidate`] are already
    /// recomputed and are skipped. A cleared cache (logout / reset) drops
    /// the hook's data without recomputing. The task stops once every clone
    /// of the hook is dropped.
    pub fn watch_invalidations(&self) -> JoinHandle<()> {
        let mut events = self.hook.source.cache.events().subscribe();
        let hook = Arc::downgrade(&self.hook);
        let mut skipped_own = self.hook.own_invalidations.load(Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Invalidation watcher lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(hook) = Weak::upgrade(&hook) else {
                    break;
                };
                let key = hook.last_key.lock().clone();
                let Some(key) = key else {
                    continue;
                };
                match event {
                    CacheEvent::Cleared => {
                        debug!(key = %key, "Cache cleared, dropping aggregate");
                        hook.reset();
                        continue;
                    }
                    CacheEvent::Invalidated(ref k) if *k == key => {
                        if hook.own_invalidations.load(Ordering::SeqCst) > skipped_own {
                            skipped_own += 1;
                            continue;
                        }
                    }
                    _ => {}
                }
                if event.affects(&key) {
                    debug!(key = %key, "Cached aggregate invalidated, refreshing");
                    // Failures are recorded on the hook state
                    let _ = hook.fetch(true).await;
                }
            }
        })
    }
}

impl<L: AggregateLoader> Hook<L> {
    /// Subject id and cache key for the next read
    async fn resolve(&self) -> Result<(String, String), FetchError> {
        let id = match self.subject {
            Subject::Id(ref id) => id.clone(),
            Subject::CurrentUser => self
                .source
                .backend
                .current_user_id()
                .await?
                .ok_or(FetchError::NotAuthenticated)?,
        };
        let key = cache_key(self.source.loader.namespace(), &id);
        *self.last_key.lock() = Some(key.clone());
        Ok((id, key))
    }

    fn settle(&self, data: L::Output, from_cache: bool) {
        self.state.send_modify(|state| {
            state.data = Some(data);
            state.loading = false;
            state.error = None;
            state.from_cache = from_cache;
        });
    }

    /// Forget everything, back to the initial state
    fn reset(&self) {
        self.state.send_replace(HookState::default());
    }

    /// Record a failure, keeping previous data
    fn fail(&self, error: &FetchError) {
        warn!(error = %error, "Derived data load failed");
        self.state.send_modify(|state| {
            state.loading = false;
            state.error = Some(error.to_string());
        });
    }

    async fn fetch(&self, force_refresh: bool) -> Result<L::Output, FetchError> {
        self.state.send_modify(|state| state.loading = true);

        let (id, key) = match self.resolve().await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        let cache = &self.source.cache;

        if !force_refresh {
            if let Some(data) = cache.get_sync::<L::Output>(&key) {
                self.settle(data.clone(), true);
                return Ok(data);
            }
            if let Some(data) = cache.get::<L::Output>(&key).await {
                self.settle(data.clone(), true);
                return Ok(data);
            }
        }

        let running = self.source.in_flight.join_or_start(&key, || {
            let loader = self.source.loader.clone();
            let cache = self.source.cache.clone();
            let key = key.clone();
            async move {
                debug!(key = %key, "Computing aggregate");
                let data = loader.load(&id).await?;
                let ttl = loader.ttl().unwrap_or_else(|| cache.config().default_ttl());
                cache.set(&key, &data, ttl, true).await;
                Ok::<_, FetchError>(data)
            }
            .boxed()
        });

        match running.await {
            Ok(data) => {
                self.settle(data.clone(), false);
                Ok(data)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }
}

impl<L: AggregateLoader> std::fmt::Debug for DerivedData<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.hook.state.borrow();
        f.debug_struct("DerivedData")
            .field("namespace", &self.hook.source.loader.namespace())
            .field("subject", &self.hook.subject)
            .field("loading", &state.loading)
            .field("from_cache", &state.from_cache)
            .field("error", &state.error)
            .finish()
    }
}
