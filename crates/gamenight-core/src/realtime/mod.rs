//! Live change subscriptions
//!
//! Components subscribe to row-level changes of one table, optionally
//! narrowed to a single row by an equality filter. Identical requests share
//! one backend channel through a reference-counted registry; every
//! subscriber still gets its own [`SubscriptionHandle`] with connection
//! state and disposal.

mod channel;
mod handle;
mod live;
mod manager;

pub use handle::SubscriptionHandle;
pub use live::{typed_callback, LiveSubscription};
pub use manager::SubscriptionManager;

use crate::backend::{ChangeEvent, ChangeKind, ChannelSpec, EventFilter, RowFilter};
use std::sync::Arc;

/// Callback invoked once per change delivered on a subscription
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// What to listen to: a table, an optional row filter, an event filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionRequest {
    pub table: String,
    pub filter: Option<RowFilter>,
    pub event: EventFilter,
}

impl SubscriptionRequest {
    /// Every change on `table`
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            event: EventFilter::All,
        }
    }

    /// Narrow to rows where `column` equals `value`
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = Some(RowFilter::eq(column, value));
        self
    }

    /// Narrow to one change type
    pub fn only(mut self, kind: ChangeKind) -> Self {
        self.event = EventFilter::Only(kind);
        self
    }

    pub fn channel_spec(&self, schema: &str) -> ChannelSpec {
        ChannelSpec {
            schema: schema.to_string(),
            table: self.table.clone(),
            event: self.event,
            filter: self.filter.clone(),
        }
    }
}

/// Connection state of a subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not enabled; no channel attached
    #[default]
    Idle,
    /// Waiting for the backend to acknowledge the channel
    Connecting,
    Open,
    Error,
    Closed,
}

impl ConnectionState {
    /// `Error` and `Closed` never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on a handle's watch channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandleStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
}

impl HandleStatus {
    pub fn new(state: ConnectionState) -> Self {
        Self { state, error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Error,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builds_channel_spec() {
        let request = SubscriptionRequest::table("events")
            .filter("id", "e1")
            .only(ChangeKind::Update);
        let spec = request.channel_spec("public");

        assert_eq!(spec.topic(), "realtime:public:events:UPDATE:id=eq.e1");
        assert_eq!(spec.filter, Some(RowFilter::eq("id", "e1")));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ConnectionState::Idle.is_terminal());
        assert!(!ConnectionState::Open.is_terminal());
        assert!(ConnectionState::Error.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
