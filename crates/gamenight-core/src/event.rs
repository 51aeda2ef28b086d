//! Cache event bus using tokio::broadcast
//!
//! Derived-data hooks listen here to learn that a mutation elsewhere in the
//! app made their entry stale; operators listen for persistence failures.

use tokio::sync::broadcast;

/// Events emitted by the tiered cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A key was removed from both tiers
    Invalidated(String),
    /// Memory-tier keys under this prefix were removed
    PrefixInvalidated(String),
    /// The whole memory tier was dropped
    Cleared,
    /// A durable-tier operation failed and was swallowed
    PersistenceFailed {
        operation: PersistOp,
        key: String,
        message: String,
    },
}

impl CacheEvent {
    /// Whether this event makes the entry stored under `key` stale
    pub fn affects(&self, key: &str) -> bool {
        match self {
            CacheEvent::Invalidated(k) => k == key,
            CacheEvent::PrefixInvalidated(prefix) => key.starts_with(prefix.as_str()),
            CacheEvent::Cleared => true,
            CacheEvent::PersistenceFailed { .. } => false,
        }
    }
}

/// Durable-tier operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    Read,
    Write,
    Delete,
    List,
}

impl std::fmt::Display for PersistOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PersistOp::Read => "read",
            PersistOp::Write => "write",
            PersistOp::Delete => "delete",
            PersistOp::List => "list",
        };
        f.write_str(name)
    }
}

/// Event bus for broadcasting cache events
///
/// Multi-consumer; each hook instance subscribes independently.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create with default capacity (256 events)
    pub fn default_capacity() -> Self {
        Self::new(256)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: CacheEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Get current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::default_capacity()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
