//! Cache entry envelope and TTL presets

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value with its write and expiry timestamps (epoch ms).
///
/// Serialized to the durable tier as `{"data", "timestamp", "expiresAt"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(rename = "timestamp")]
    pub written_at: i64,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, now: i64, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            data,
            written_at: now,
            expires_at: now.saturating_add(ttl_ms),
        }
    }

    /// Valid iff `now < expires_at`
    pub fn is_valid(&self, now: i64) -> bool {
        now < self.expires_at
    }

    pub fn remaining(&self, now: i64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now).max(0) as u64)
    }
}

/// Named TTL presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// 60 seconds
    Short,
    /// 5 minutes
    Medium,
    /// 15 minutes
    Long,
    /// 1 hour
    VeryLong,
}

impl CacheTtl {
    pub const fn as_duration(self) -> Duration {
        match self {
            CacheTtl::Short => Duration::from_secs(60),
            CacheTtl::Medium => Duration::from_secs(300),
            CacheTtl::Long => Duration::from_secs(900),
            CacheTtl::VeryLong => Duration::from_secs(3600),
        }
    }
}

impl From<CacheTtl> for Duration {
    fn from(ttl: CacheTtl) -> Self {
        ttl.as_duration()
    }
}

/// Compose a cache key from a namespace and an entity id: `profile_stats_<id>`
pub fn cache_key(namespace: &str, id: &str) -> String {
    format!("{}_{}", namespace, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CacheEntry::new(7u32, 1_000, Duration::from_millis(500));
        assert_eq!(entry.expires_at, 1_500);
        assert!(entry.is_valid(1_499));
        assert!(!entry.is_valid(1_500));
        assert_eq!(entry.remaining(1_200), Duration::from_millis(300));
        assert_eq!(entry.remaining(2_000), Duration::ZERO);
    }

    #[test]
    fn test_envelope_field_names() {
        let entry = CacheEntry::new(serde_json::json!({"friends": 5}), 10, Duration::from_millis(5));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["timestamp"], 10);
        assert_eq!(json["expiresAt"], 15);
        assert_eq!(json["data"]["friends"], 5);
    }

    #[test]
    fn test_presets() {
        assert_eq!(Duration::from(CacheTtl::Short), Duration::from_secs(60));
        assert_eq!(CacheTtl::Medium.as_duration(), Duration::from_millis(300_000));
        assert_eq!(CacheTtl::Long.as_duration(), Duration::from_secs(900));
        assert_eq!(CacheTtl::VeryLong.as_duration(), Duration::from_secs(3600));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("profile_stats", "u-42"), "profile_stats_u-42");
    }
}
