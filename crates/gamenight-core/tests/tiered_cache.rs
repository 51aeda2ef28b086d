//! Integration tests for the tiered cache over real durable stores

use gamenight_core::backend::MemoryBackend;
use gamenight_core::cache::{CacheTtl, MemoryStore, SqliteStore, TieredCache};
use gamenight_core::clock::ManualClock;
use gamenight_core::config::CacheConfig;
use gamenight_core::derived::{profile_stats_key, DerivedSource, ProfileStats, ProfileStatsLoader};
use gamenight_core::event::CacheEvent;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const START: i64 = 1_700_000_000_000;

fn cache_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> TieredCache {
    TieredCache::new(store, clock, CacheConfig::default())
}

#[tokio::test]
async fn test_write_read_and_expiry() {
    let clock = Arc::new(ManualClock::new(START));
    let cache = cache_with(Arc::new(MemoryStore::new()), clock.clone());

    cache.set_sync("games_u1", &vec!["Catan", "Azul"], CacheTtl::Short);
    assert_eq!(
        cache.get_sync::<Vec<String>>("games_u1"),
        Some(vec!["Catan".to_string(), "Azul".to_string()])
    );

    clock.advance(Duration::from_secs(60));
    assert_eq!(cache.get_sync::<Vec<String>>("games_u1"), None);
    assert!(!cache.is_valid("games_u1"));
}

#[tokio::test]
async fn test_invalidate_missing_key_is_noop() {
    let cache = TieredCache::in_memory();
    let mut events = cache.events().subscribe();

    cache.invalidate("never_written").await;
    cache.invalidate("never_written").await;

    assert_eq!(cache.stats().persistence_failures, 0);
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::Invalidated("never_written".into())
    );
}

#[tokio::test]
async fn test_prefix_invalidation_is_exact() {
    let cache = TieredCache::in_memory();
    for key in ["event_1", "event_2", "events_all", "profile_event_1", "even"] {
        cache.set_sync(key, &1, CacheTtl::Long);
    }

    assert_eq!(cache.invalidate_by_prefix("event_"), 2);

    assert!(!cache.is_valid("event_1"));
    assert!(!cache.is_valid("event_2"));
    assert!(cache.is_valid("events_all"));
    assert!(cache.is_valid("profile_event_1"));
    assert!(cache.is_valid("even"));
}

#[tokio::test]
async fn test_durable_round_trip_repopulates_memory() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("cache.db")).unwrap());
    let clock = Arc::new(ManualClock::new(START));
    let cache = TieredCache::new(store.clone(), clock.clone(), CacheConfig::default());

    let stats = ProfileStats {
        events_created: 3,
        ..Default::default()
    };
    cache.set("profile_stats_u1", &stats, CacheTtl::Medium, true).await;

    assert!(cache.evict("profile_stats_u1"));
    assert_eq!(cache.get_sync::<ProfileStats>("profile_stats_u1"), None);

    assert_eq!(cache.get::<ProfileStats>("profile_stats_u1").await, Some(stats));
    assert_eq!(cache.get_sync::<ProfileStats>("profile_stats_u1"), Some(stats));
    assert_eq!(cache.stats().durable_hits, 1);

    // Repopulated entry keeps its original expiry
    clock.advance(CacheTtl::Medium.as_duration());
    assert!(!cache.is_valid("profile_stats_u1"));
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let clock = Arc::new(ManualClock::new(START));

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let cache = TieredCache::new(store, clock.clone(), CacheConfig::default());
        cache.set("listing_9", &json!({"price": 25}), CacheTtl::Long, true).await;
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let cache = TieredCache::new(store, clock, CacheConfig::default());
    let value: Option<serde_json::Value> = cache.get("listing_9").await;
    assert_eq!(value, Some(json!({"price": 25})));
}

#[tokio::test]
async fn test_ttl_boundary_triggers_recomputation() {
    let clock = Arc::new(ManualClock::new(START));
    let cache = Arc::new(cache_with(Arc::new(MemoryStore::new()), clock.clone()));
    let backend = Arc::new(MemoryBackend::new());
    backend.seed("events", vec![json!({"host_id": "u"}); 7]);

    let key = profile_stats_key("u");
    let cached: ProfileStats = serde_json::from_value(json!({"eventsCreated": 2, "friends": 5})).unwrap();
    cache
        .set(&key, &cached, Duration::from_millis(300_000), true)
        .await;

    clock.advance(Duration::from_millis(299_999));
    assert_eq!(cache.get_sync::<ProfileStats>(&key), Some(cached));

    clock.advance(Duration::from_millis(2));
    assert_eq!(cache.get_sync::<ProfileStats>(&key), None);

    let source = DerivedSource::new(
        ProfileStatsLoader::new(backend.clone()),
        cache.clone(),
        backend.clone(),
    );
    let hook = source.for_subject("u");
    let fresh = hook.load().await.unwrap();

    assert_eq!(fresh.events_created, 7);
    assert_eq!(fresh.friends, 0);
    assert!(!hook.state().from_cache);
    assert_eq!(backend.count_calls(), 5);
    assert_eq!(cache.get_sync::<ProfileStats>(&key), Some(fresh));
}
