//! Change-notification primitive of the hosted backend
//!
//! A channel is opened for `(schema, table, event filter, optional
//! single-column equality filter)` and yields status transitions followed by
//! row-level change payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Row-level change type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// Which change types a channel delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Only(kind) => kind.as_str(),
        }
    }

    pub fn accepts(self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(only) => only == kind,
        }
    }
}

/// Single-column equality filter: `column=eq.value`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Compares against the column rendered as text, the way the backend
    /// evaluates filters on its side.
    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl std::fmt::Display for RowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// Everything the backend needs to open one channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
}

impl ChannelSpec {
    /// Channel identity; identical specs share a topic
    pub fn topic(&self) -> String {
        let mut topic = format!(
            "realtime:{}:{}:{}",
            self.schema,
            self.table,
            self.event.as_str()
        );
        if let Some(ref filter) = self.filter {
            topic.push(':');
            topic.push_str(&filter.to_string());
        }
        topic
    }

    /// Whether a change on `table` should be delivered on this channel.
    /// Deletes are matched on the old row, everything else on the new row.
    pub fn accepts(&self, change: &ChangeEvent) -> bool {
        if change.table != self.table || !self.event.accepts(change.event_type) {
            return false;
        }
        let Some(ref filter) = self.filter else {
            return true;
        };
        let row = match change.event_type {
            ChangeKind::Delete => change.old_row.as_ref(),
            _ => change.new_row.as_ref(),
        };
        row.map(|r| filter.matches(r)).unwrap_or(false)
    }
}

/// One row-level change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_type: ChangeKind,
    pub table: String,
    #[serde(default, rename = "new", skip_serializing_if = "Option::is_none")]
    pub new_row: Option<Value>,
    #[serde(default, rename = "old", skip_serializing_if = "Option::is_none")]
    pub old_row: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            table: table.into(),
            new_row: Some(row),
            old_row: None,
        }
    }

    pub fn update(table: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            event_type: ChangeKind::Update,
            table: table.into(),
            new_row: Some(new),
            old_row: Some(old),
        }
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            table: table.into(),
            new_row: None,
            old_row: Some(old),
        }
    }
}

/// Channel status reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Message delivered on an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

/// Subscribe-to-table-changes primitive
///
/// `open` returns immediately; the acknowledgement (or rejection) arrives
/// later on the returned stream. A dropped stream counts as closed.
pub trait ChangeFeed: Send + Sync {
    fn open(&self, topic: &str, spec: &ChannelSpec) -> mpsc::UnboundedReceiver<FeedMessage>;

    fn close(&self, topic: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(filter: Option<RowFilter>, event: EventFilter) -> ChannelSpec {
        ChannelSpec {
            schema: "public".into(),
            table: "events".into(),
            event,
            filter,
        }
    }

    #[test]
    fn test_topic_distinguishes_filters() {
        let all = spec(None, EventFilter::All);
        let one = spec(Some(RowFilter::eq("id", "e1")), EventFilter::All);
        let inserts = spec(None, EventFilter::Only(ChangeKind::Insert));

        assert_eq!(all.topic(), "realtime:public:events:*");
        assert_eq!(one.topic(), "realtime:public:events:*:id=eq.e1");
        assert_eq!(inserts.topic(), "realtime:public:events:INSERT");
    }

    #[test]
    fn test_accepts_uses_old_row_for_deletes() {
        let s = spec(Some(RowFilter::eq("id", "e1")), EventFilter::All);

        assert!(s.accepts(&ChangeEvent::insert("events", json!({"id": "e1"}))));
        assert!(!s.accepts(&ChangeEvent::insert("events", json!({"id": "e2"}))));
        assert!(!s.accepts(&ChangeEvent::insert("profiles", json!({"id": "e1"}))));
        assert!(s.accepts(&ChangeEvent::delete("events", json!({"id": "e1"}))));
    }

    #[test]
    fn test_event_filter() {
        let s = spec(None, EventFilter::Only(ChangeKind::Update));
        assert!(!s.accepts(&ChangeEvent::insert("events", json!({}))));
        assert!(s.accepts(&ChangeEvent::update("events", json!({}), json!({}))));
    }

    #[test]
    fn test_row_filter_matches_numbers_as_text() {
        let f = RowFilter::eq("seats", "4");
        assert!(f.matches(&json!({"seats": 4})));
        assert!(!f.matches(&json!({"seats": null})));
        assert!(!f.matches(&json!({})));
    }

    #[test]
    fn test_change_event_wire_shape() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "eventType": "UPDATE",
            "table": "profiles",
            "new": {"id": "u1", "display_name": "Ada"},
            "old": {"id": "u1"}
        }))
        .unwrap();
        assert_eq!(event.event_type, ChangeKind::Update);
        assert_eq!(event.new_row.unwrap()["display_name"], "Ada");
    }
}
