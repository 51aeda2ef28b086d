//! Per-user profile statistics
//!
//! Five independent counts. A failing count contributes zero and a warning;
//! it never fails the aggregate.

use super::AggregateLoader;
use crate::backend::{Backend, CountQuery};
use crate::cache::{cache_key, TieredCache};
use crate::error::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const PROFILE_STATS_NAMESPACE: &str = "profile_stats";

/// Aggregate shown on a user's profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileStats {
    pub events_created: u64,
    pub events_attended: u64,
    pub friends: u64,
    pub active_listings: u64,
    pub games_owned: u64,
}

/// `profile_stats_<user_id>`
pub fn profile_stats_key(user_id: &str) -> String {
    cache_key(PROFILE_STATS_NAMESPACE, user_id)
}

/// Drop a user's cached stats from both tiers without holding a hook
pub async fn invalidate_profile_stats(cache: &TieredCache, user_id: &str) {
    cache.invalidate(&profile_stats_key(user_id)).await;
}

pub struct ProfileStatsLoader {
    backend: Arc<dyn Backend>,
    /// None = the cache's configured default
    ttl: Option<Duration>,
}

impl ProfileStatsLoader {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: impl Into<Duration>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    /// The five queries, in `ProfileStats` field order
    pub fn queries(user_id: &str) -> [CountQuery; 5] {
        [
            CountQuery::new("events").eq("host_id", user_id),
            CountQuery::new("event_participants")
                .eq("user_id", user_id)
                .eq("status", "joined"),
            CountQuery::new("friendships")
                .eq("user_id", user_id)
                .eq("status", "accepted"),
            CountQuery::new("marketplace_listings")
                .eq("seller_id", user_id)
                .eq("status", "active"),
            CountQuery::new("user_games").eq("user_id", user_id),
        ]
    }

    async fn count_or_zero(&self, query: &CountQuery) -> u64 {
        match self.backend.count(query).await {
            Ok(n) => n,
            Err(e) => {
                warn!(query = %query, error = %e, "Stat query failed, using 0");
                0
            }
        }
    }
}

#[async_trait]
impl AggregateLoader for ProfileStatsLoader {
    type Output = ProfileStats;

    fn namespace(&self) -> &str {
        PROFILE_STATS_NAMESPACE
    }

    fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    async fn load(&self, user_id: &str) -> Result<ProfileStats, FetchError> {
        let [hosted, attended, friendships, listings, games] = Self::queries(user_id);

        let (events_created, events_attended, friends, active_listings, games_owned) = tokio::join!(
            self.count_or_zero(&hosted),
            self.count_or_zero(&attended),
            self.count_or_zero(&friendships),
            self.count_or_zero(&listings),
            self.count_or_zero(&games),
        );

        let stats = ProfileStats {
            events_created,
            events_attended,
            friends,
            active_listings,
            games_owned,
        };
        debug!(user_id = %user_id, ?stats, "Profile stats computed");
        Ok(stats)
    }
}
