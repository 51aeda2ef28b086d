//! In-process backend implementing [`Backend`] and [`ChangeFeed`]
//!
//! Backs the test suites and offline demos. Rows live in per-table vectors;
//! mutations emit change events to every open channel that accepts them.
//! Failures, latency and channel status transitions are injectable.

use super::feed::{ChangeEvent, ChangeFeed, ChannelSpec, ChannelStatus, FeedMessage, RowFilter};
use super::query::CountQuery;
use super::Backend;
use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct OpenChannel {
    spec: ChannelSpec,
    tx: mpsc::UnboundedSender<FeedMessage>,
}

pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    failing_tables: RwLock<HashMap<String, String>>,
    current_user: RwLock<Option<String>>,
    latency: RwLock<Option<Duration>>,
    count_calls: AtomicUsize,
    auto_ack: AtomicBool,
    channels: Mutex<HashMap<String, OpenChannel>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            failing_tables: RwLock::new(HashMap::new()),
            current_user: RwLock::new(None),
            latency: RwLock::new(None),
            count_calls: AtomicUsize::new(0),
            auto_ack: AtomicBool::new(true),
            channels: Mutex::new(HashMap::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl MemoryBackend {
    /// Channels are acknowledged as soon as they open
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user_id: impl Into<String>) -> Self {
        let backend = Self::new();
        backend.set_current_user(Some(user_id.into()));
        backend
    }

    // ===================
    // Knobs
    // ===================

    pub fn set_current_user(&self, user_id: Option<String>) {
        *self.current_user.write() = user_id;
    }

    /// When off, channels stay `connecting` until [`Self::acknowledge`]
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.auto_ack.store(auto_ack, Ordering::SeqCst);
    }

    /// Delay applied to every count query
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Make every query on `table` fail with `message`
    pub fn fail_table(&self, table: &str, message: &str) {
        self.failing_tables
            .write()
            .insert(table.to_string(), message.to_string());
    }

    pub fn heal_table(&self, table: &str) {
        self.failing_tables.write().remove(table);
    }

    /// Number of count queries issued so far
    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    // ===================
    // Rows
    // ===================

    /// Replace a table's rows without emitting change events
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables.write().insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    pub fn insert(&self, table: &str, row: Value) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        self.emit(ChangeEvent::insert(table, row));
    }

    /// Merge `patch` into every row matching `filter`. Returns rows changed.
    pub fn update(&self, table: &str, filter: &RowFilter, patch: Value) -> usize {
        let mut changes = Vec::new();
        {
            let mut tables = self.tables.write();
            let Some(rows) = tables.get_mut(table) else {
                return 0;
            };
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                let old = row.clone();
                if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                    for (k, v) in fields {
                        target.insert(k.clone(), v.clone());
                    }
                }
                changes.push(ChangeEvent::update(table, old, row.clone()));
            }
        }
        let count = changes.len();
        for change in changes {
            self.emit(change);
        }
        count
    }

    /// Remove every row matching `filter`. Returns rows removed.
    pub fn delete(&self, table: &str, filter: &RowFilter) -> usize {
        let removed: Vec<Value> = {
            let mut tables = self.tables.write();
            let Some(rows) = tables.get_mut(table) else {
                return 0;
            };
            let (gone, kept): (Vec<_>, Vec<_>) =
                rows.drain(..).partition(|r| filter.matches(r));
            *rows = kept;
            gone
        };
        let count = removed.len();
        for row in removed {
            self.emit(ChangeEvent::delete(table, row));
        }
        count
    }

    // ===================
    // Channels
    // ===================

    /// Deliver a change to every open channel accepting it.
    /// Returns the number of channels it was sent to.
    pub fn emit(&self, change: ChangeEvent) -> usize {
        let channels = self.channels.lock();
        let mut delivered = 0;
        for (topic, channel) in channels.iter() {
            if channel.spec.accepts(&change)
                && channel.tx.send(FeedMessage::Change(change.clone())).is_ok()
            {
                trace!(topic = %topic, "Change delivered");
                delivered += 1;
            }
        }
        delivered
    }

    fn send_status(&self, topic: &str, status: ChannelStatus) -> bool {
        let terminal = !matches!(status, ChannelStatus::Subscribed);
        let mut channels = self.channels.lock();
        let sent = channels
            .get(topic)
            .map(|c| c.tx.send(FeedMessage::Status(status)).is_ok())
            .unwrap_or(false);
        if terminal {
            channels.remove(topic);
        }
        sent
    }

    pub fn acknowledge(&self, topic: &str) -> bool {
        self.send_status(topic, ChannelStatus::Subscribed)
    }

    pub fn reject(&self, topic: &str, message: &str) -> bool {
        self.send_status(topic, ChannelStatus::ChannelError(message.to_string()))
    }

    pub fn time_out(&self, topic: &str) -> bool {
        self.send_status(topic, ChannelStatus::TimedOut)
    }

    /// Server-initiated close
    pub fn close_from_server(&self, topic: &str) -> bool {
        self.send_status(topic, ChannelStatus::Closed)
    }

    pub fn is_open(&self, topic: &str) -> bool {
        self.channels.lock().contains_key(topic)
    }

    pub fn open_channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Total channels opened since creation
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Total client-side closes since creation
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn count(&self, query: &CountQuery) -> Result<u64, BackendError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.failing_tables.read().get(&query.table) {
            return Err(BackendError::query(&query.table, message));
        }

        let tables = self.tables.read();
        let count = tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).count())
            .unwrap_or(0);
        trace!(query = %query, count, "Count query");
        Ok(count as u64)
    }

    async fn current_user_id(&self) -> Result<Option<String>, BackendError> {
        Ok(self.current_user.read().clone())
    }
}

impl ChangeFeed for MemoryBackend {
    fn open(&self, topic: &str, spec: &ChannelSpec) -> mpsc::UnboundedReceiver<FeedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_ack.load(Ordering::SeqCst) {
            let _ = tx.send(FeedMessage::Status(ChannelStatus::Subscribed));
        }
        self.channels.lock().insert(
            topic.to_string(),
            OpenChannel {
                spec: spec.clone(),
                tx,
            },
        );
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %topic, "Channel opened");
        rx
    }

    fn close(&self, topic: &str) {
        if self.channels.lock().remove(topic).is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
            debug!(topic = %topic, "Channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::feed::EventFilter;
    use serde_json::json;

    fn events_spec(filter: Option<RowFilter>) -> ChannelSpec {
        ChannelSpec {
            schema: "public".into(),
            table: "events".into(),
            event: EventFilter::All,
            filter,
        }
    }

    #[tokio::test]
    async fn test_count_with_filters_and_failures() {
        let backend = MemoryBackend::new();
        backend.seed(
            "events",
            vec![
                json!({"id": "e1", "host_id": "u1"}),
                json!({"id": "e2", "host_id": "u1"}),
                json!({"id": "e3", "host_id": "u2"}),
            ],
        );

        let q = CountQuery::new("events").eq("host_id", "u1");
        assert_eq!(backend.count(&q).await.unwrap(), 2);
        assert_eq!(backend.count(&CountQuery::new("nothing")).await.unwrap(), 0);

        backend.fail_table("events", "boom");
        assert!(matches!(
            backend.count(&q).await,
            Err(BackendError::Query { .. })
        ));
        backend.heal_table("events");
        assert_eq!(backend.count(&q).await.unwrap(), 2);
        assert_eq!(backend.count_calls(), 4);
    }

    #[tokio::test]
    async fn test_mutations_emit_to_matching_channels() {
        let backend = MemoryBackend::new();
        let spec = events_spec(Some(RowFilter::eq("id", "e1")));
        let mut rx = backend.open(&spec.topic(), &spec);

        assert_eq!(
            rx.recv().await.unwrap(),
            FeedMessage::Status(ChannelStatus::Subscribed)
        );

        backend.insert("events", json!({"id": "e2"}));
        backend.insert("events", json!({"id": "e1", "title": "Catan"}));
        let updated = backend.update("events", &RowFilter::eq("id", "e1"), json!({"title": "Azul"}));
        assert_eq!(updated, 1);
        assert_eq!(backend.delete("events", &RowFilter::eq("id", "e1")), 1);

        let FeedMessage::Change(insert) = rx.recv().await.unwrap() else {
            panic!("expected change");
        };
        assert_eq!(insert.new_row.unwrap()["title"], "Catan");

        let FeedMessage::Change(update) = rx.recv().await.unwrap() else {
            panic!("expected change");
        };
        assert_eq!(update.old_row.unwrap()["title"], "Catan");
        assert_eq!(update.new_row.unwrap()["title"], "Azul");

        let FeedMessage::Change(delete) = rx.recv().await.unwrap() else {
            panic!("expected change");
        };
        assert_eq!(delete.event_type, crate::backend::ChangeKind::Delete);
        assert_eq!(backend.rows("events").len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_removes_channel() {
        let backend = MemoryBackend::new();
        backend.set_auto_ack(false);
        let spec = events_spec(None);
        let topic = spec.topic();
        let mut rx = backend.open(&topic, &spec);

        assert!(backend.is_open(&topic));
        assert!(backend.reject(&topic, "not allowed"));
        assert!(!backend.is_open(&topic));
        assert_eq!(
            rx.recv().await.unwrap(),
            FeedMessage::Status(ChannelStatus::ChannelError("not allowed".into()))
        );
        assert!(rx.recv().await.is_none());
    }
}
