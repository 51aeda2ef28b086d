//! gamenight-core - Client-side data layer for gamenight
//!
//! Provides the tiered read cache, live change subscriptions, and cached
//! derived aggregates built on both.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod derived;
pub mod error;
pub mod event;
pub mod realtime;

pub use backend::{Backend, ChangeEvent, ChangeFeed, ChangeKind, CountQuery, MemoryBackend};
pub use cache::{
    cache_key, CacheEntry, CacheStats, CacheTtl, DurableStore, MemoryStore, SqliteStore,
    TieredCache, UnavailableStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, CoreConfig, RealtimeConfig};
pub use derived::{
    invalidate_profile_stats, AggregateLoader, DerivedData, DerivedSource, HookState,
    ProfileStats, ProfileStatsLoader,
};
pub use error::{BackendError, ConfigError, FetchError, StoreError};
pub use event::{CacheEvent, EventBus, PersistOp};
pub use realtime::{
    ChangeCallback, ConnectionState, LiveSubscription, SubscriptionHandle, SubscriptionManager,
    SubscriptionRequest,
};
