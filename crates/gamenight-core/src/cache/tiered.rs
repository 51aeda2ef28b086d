//! Two-tier read cache: DashMap memory tier + pluggable durable tier
//!
//! The memory tier never suspends. Durable-tier failures never reach the
//! caller: they are logged, counted and published as
//! [`CacheEvent::PersistenceFailed`], and the operation degrades to a miss or
//! a no-op write.

use crate::cache::durable::{DurableStore, MemoryStore};
use crate::cache::entry::CacheEntry;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::StoreError;
use crate::event::{CacheEvent, EventBus, PersistOp};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    persistence_failures: AtomicU64,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub persistence_failures: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.durable_hits;
        let total = hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// One durable entry as seen by [`TieredCache::inspect_durable`]
#[derive(Debug, Clone, PartialEq)]
pub struct DurableEntryInfo {
    /// Cache key without the durable prefix
    pub key: String,
    pub size_bytes: usize,
    /// None when the envelope does not parse
    pub envelope: Option<CacheEntry<Value>>,
    pub valid: bool,
}

/// Tiered cache service
///
/// Constructible with an injected clock and durable store, so isolated
/// instances can coexist (one per test, one per signed-in account).
pub struct TieredCache {
    memory: DashMap<String, CacheEntry<Value>>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    events: EventBus,
    counters: Counters,
    /// Bumped by every invalidation; a durable read that straddles a bump
    /// does not repopulate memory
    epoch: AtomicU64,
}

impl TieredCache {
    pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            memory: DashMap::new(),
            durable,
            clock,
            config,
            events,
            counters: Counters::default(),
            epoch: AtomicU64::new(0),
        }
    }

    /// Wall clock and default config over the given durable store
    pub fn with_store(durable: Arc<dyn DurableStore>) -> Self {
        Self::new(durable, Arc::new(SystemClock), CacheConfig::default())
    }

    /// Wall clock, default config, in-process durable tier
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Bus carrying invalidation and persistence-failure events
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}{}", self.config.durable_prefix, key)
    }

    fn persistence_failed(&self, operation: PersistOp, key: &str, error: &StoreError) {
        self.counters
            .persistence_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(%operation, key = %key, error = %error, "Durable cache operation failed");
        self.events.publish(CacheEvent::PersistenceFailed {
            operation,
            key: key.to_string(),
            message: error.to_string(),
        });
    }

    /// Valid memory-tier value, dropping the entry if it has expired
    fn read_memory(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_millis();
        if let Some(entry) = self.memory.get(key) {
            if entry.is_valid(now) {
                return Some(entry.data.clone());
            }
        } else {
            return None;
        }
        self.memory.remove_if(key, |_, e| !e.is_valid(now));
        trace!(key = %key, "Memory entry expired");
        None
    }

    fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    // ===================
    // Reads
    // ===================

    /// Memory-tier lookup. Never suspends.
    pub fn get_sync<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.read_memory(key) {
            Some(value) => {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Memory cache hit");
                Self::decode(key, value)
            }
            None => None,
        }
    }

    /// Memory tier, then durable tier.
    ///
    /// A valid durable entry is copied back into the memory tier with its
    /// original expiry. Expired or unparsable durable entries are deleted.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(value) = self.get_sync::<T>(key) {
            return Some(value);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let durable_key = self.durable_key(key);
        let raw = match self.durable.get(&durable_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache miss");
                return None;
            }
            Err(e) => {
                self.persistence_failed(PersistOp::Read, key, &e);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry: CacheEntry<Value> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key = %key, error = %e, "Discarding unparsable durable entry");
                self.delete_durable(key, &durable_key).await;
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if !entry.is_valid(self.clock.now_millis()) {
            debug!(key = %key, "Durable entry expired");
            self.delete_durable(key, &durable_key).await;
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let value = entry.data.clone();
        let written_at = entry.written_at;
        self.memory.insert(key.to_string(), entry);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            // Invalidated while the durable read was pending
            self.memory.remove_if(key, |_, e| e.written_at == written_at);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Durable read raced an invalidation, treating as miss");
            return None;
        }
        self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Durable cache hit, memory tier repopulated");
        Self::decode(key, value)
    }

    /// True iff a memory-tier entry exists and is unexpired
    pub fn is_valid(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.memory
            .get(key)
            .map(|e| e.is_valid(now))
            .unwrap_or(false)
    }

    // ===================
    // Writes
    // ===================

    fn make_entry<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Option<CacheEntry<Value>> {
        match serde_json::to_value(value) {
            Ok(data) => Some(CacheEntry::new(data, self.clock.now_millis(), ttl)),
            Err(e) => {
                warn!(key = %key, error = %e, "Value cannot be cached");
                None
            }
        }
    }

    /// Write or overwrite the memory-tier entry
    pub fn set_sync<T: Serialize>(&self, key: &str, value: &T, ttl: impl Into<Duration>) {
        if let Some(entry) = self.make_entry(key, value, ttl.into()) {
            self.memory.insert(key.to_string(), entry);
            trace!(key = %key, "Memory entry written");
        }
    }

    /// Write the memory tier, and the durable tier when `persist` is set.
    /// Durable write failures are swallowed.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: impl Into<Duration>,
        persist: bool,
    ) {
        let Some(entry) = self.make_entry(key, value, ttl.into()) else {
            return;
        };

        let envelope = if persist {
            match serde_json::to_string(&entry) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to encode durable envelope");
                    None
                }
            }
        } else {
            None
        };

        self.memory.insert(key.to_string(), entry);

        if let Some(envelope) = envelope {
            if let Err(e) = self.durable.set(&self.durable_key(key), &envelope).await {
                self.persistence_failed(PersistOp::Write, key, &e);
            } else {
                trace!(key = %key, "Durable entry written");
            }
        }
    }

    // ===================
    // Invalidation
    // ===================

    async fn delete_durable(&self, key: &str, durable_key: &str) {
        if let Err(e) = self.durable.delete(durable_key).await {
            self.persistence_failed(PersistOp::Delete, key, &e);
        }
    }

    /// Remove from the memory tier only. Returns whether an entry existed.
    pub fn evict(&self, key: &str) -> bool {
        self.memory.remove(key).is_some()
    }

    /// Remove from both tiers. Absent keys are a no-op.
    pub async fn invalidate(&self, key: &str) {
        self.delete_durable(key, &self.durable_key(key)).await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.evict(key);
        debug!(key = %key, "Cache entry invalidated");
        self.events.publish(CacheEvent::Invalidated(key.to_string()));
    }

    /// Remove every memory-tier entry whose key starts with `prefix`.
    ///
    /// The durable tier is untouched; its entries age out by TTL. Use
    /// [`Self::invalidate_by_prefix_everywhere`] to purge them too.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let before = self.memory.len();
        self.memory.retain(|k, _| !k.starts_with(prefix));
        let removed = before.saturating_sub(self.memory.len());
        debug!(prefix = %prefix, removed, "Cache prefix invalidated");
        self.events
            .publish(CacheEvent::PrefixInvalidated(prefix.to_string()));
        removed
    }

    /// Prefix invalidation that also deletes matching durable entries.
    /// Returns the number of durable entries deleted.
    pub async fn invalidate_by_prefix_everywhere(&self, prefix: &str) -> usize {
        self.invalidate_by_prefix(prefix);

        let keys = match self.durable.keys(&self.durable_key(prefix)).await {
            Ok(keys) => keys,
            Err(e) => {
                self.persistence_failed(PersistOp::List, prefix, &e);
                return 0;
            }
        };

        let mut deleted = 0;
        for durable_key in keys {
            let key = durable_key
                .strip_prefix(self.config.durable_prefix.as_str())
                .unwrap_or(&durable_key)
                .to_string();
            match self.durable.delete(&durable_key).await {
                Ok(()) => deleted += 1,
                Err(e) => self.persistence_failed(PersistOp::Delete, &key, &e),
            }
        }
        deleted
    }

    /// Drop the whole memory tier (logout / reset)
    pub fn clear_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let count = self.memory.len();
        self.memory.clear();
        debug!(count, "Memory cache cleared");
        self.events.publish(CacheEvent::Cleared);
    }

    // ===================
    // Hygiene
    // ===================

    /// Remove expired memory-tier entries
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.memory.len();
        self.memory.retain(|_, e| e.is_valid(now));
        before.saturating_sub(self.memory.len())
    }

    /// Sweep expired memory entries every `interval`.
    ///
    /// The task holds a weak reference and stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    debug!("Cache dropped, sweeper stopping");
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }

    /// Start the sweeper when `sweep_interval_ms` is configured
    pub fn spawn_configured_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.config
            .sweep_interval()
            .map(|interval| self.spawn_sweeper(interval))
    }

    /// Describe the durable entries under `prefix`
    pub async fn inspect_durable(&self, prefix: &str) -> Vec<DurableEntryInfo> {
        let keys = match self.durable.keys(&self.durable_key(prefix)).await {
            Ok(keys) => keys,
            Err(e) => {
                self.persistence_failed(PersistOp::List, prefix, &e);
                return Vec::new();
            }
        };

        let now = self.clock.now_millis();
        let mut infos = Vec::with_capacity(keys.len());
        for durable_key in keys {
            let key = durable_key
                .strip_prefix(self.config.durable_prefix.as_str())
                .unwrap_or(&durable_key)
                .to_string();
            let raw = match self.durable.get(&durable_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    self.persistence_failed(PersistOp::Read, &key, &e);
                    continue;
                }
            };
            let envelope = serde_json::from_str::<CacheEntry<Value>>(&raw).ok();
            let valid = envelope.as_ref().map(|e| e.is_valid(now)).unwrap_or(false);
            infos.push(DurableEntryInfo {
                key,
                size_bytes: raw.len(),
                envelope,
                valid,
            });
        }
        infos
    }

    /// Delete expired or unparsable durable entries. Returns the count.
    pub async fn prune_durable(&self) -> usize {
        let mut pruned = 0;
        for info in self.inspect_durable("").await {
            if info.valid {
                continue;
            }
            let durable_key = self.durable_key(&info.key);
            match self.durable.delete(&durable_key).await {
                Ok(()) => pruned += 1,
                Err(e) => self.persistence_failed(PersistOp::Delete, &info.key, &e),
            }
        }
        debug!(pruned, "Durable cache pruned");
        pruned
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len(),
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.counters.durable_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            persistence_failures: self.counters.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("memory_entries", &self.memory.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
