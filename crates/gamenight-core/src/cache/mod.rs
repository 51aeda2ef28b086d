//! Tiered read cache
//!
//! Fast in-process memory tier in front of a slower durable tier
//! (SQLite on desktop, platform storage elsewhere, nothing at all where
//! storage is unavailable).

pub mod durable;
pub mod entry;
pub mod sqlite;
pub mod tiered;

pub use durable::{DurableStore, MemoryStore, UnavailableStore};
pub use entry::{cache_key, CacheEntry, CacheTtl};
pub use sqlite::{DurableStats, SqliteStore};
pub use tiered::{CacheStats, DurableEntryInfo, TieredCache};
