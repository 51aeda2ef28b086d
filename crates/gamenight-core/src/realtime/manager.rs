//! Reference-counted subscription registry

use super::channel::{Channel, Listener};
use super::handle::{Attachment, SubscriptionHandle};
use super::{ChangeCallback, ConnectionState, HandleStatus, SubscriptionRequest};
use crate::backend::{ChangeFeed, ChannelStatus, FeedMessage};
use crate::config::RealtimeConfig;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub(super) struct ManagerInner {
    feed: Arc<dyn ChangeFeed>,
    config: RealtimeConfig,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    next_listener: AtomicU64,
}

impl ManagerInner {
    /// Drop one listener; the last one out closes the backend channel
    pub(super) fn detach(&self, channel: &Arc<Channel>, listener_id: u64) {
        let mut channels = self.channels.lock();
        let remaining = channel.detach(listener_id);
        if remaining > 0 {
            debug!(topic = %channel.topic, remaining, "Listener detached");
            return;
        }

        channel.stop_pump();
        let registered = channels
            .get(&channel.topic)
            .is_some_and(|c| Arc::ptr_eq(c, channel));
        if registered {
            channels.remove(&channel.topic);
            self.feed.close(&channel.topic);
            info!(topic = %channel.topic, "Channel closed");
        }
    }

    /// Forget a channel the backend failed or closed
    fn retire(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock();
        let registered = channels
            .get(&channel.topic)
            .is_some_and(|c| Arc::ptr_eq(c, channel));
        if registered {
            channels.remove(&channel.topic);
            self.feed.close(&channel.topic);
        }
    }
}

/// Opens and shares backend channels for subscription requests
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                config,
                channels: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Listen to `request`, invoking `on_change` once per delivered change.
    ///
    /// With `enabled == false` the handle stays `idle` and nothing is opened.
    /// Must be called from within a tokio runtime when enabled.
    pub fn subscribe(
        &self,
        request: &SubscriptionRequest,
        on_change: ChangeCallback,
        enabled: bool,
    ) -> SubscriptionHandle {
        let spec = request.channel_spec(&self.inner.config.schema);
        let topic = spec.topic();

        if !enabled {
            debug!(topic = %topic, "Subscription disabled");
            return SubscriptionHandle::idle(topic);
        }

        let (tx, rx) = watch::channel(HandleStatus::new(ConnectionState::Connecting));
        let status = Arc::new(tx);
        let gate = Arc::new(ReentrantMutex::new(Cell::new(true)));
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            gate: gate.clone(),
            callback: on_change,
            status: status.clone(),
        };

        let channel = {
            let mut channels = self.inner.channels.lock();
            match channels.get(&topic) {
                Some(existing) => {
                    existing.attach(listener_id, listener);
                    debug!(
                        topic = %topic,
                        listeners = existing.listener_count(),
                        "Attached to shared channel"
                    );
                    existing.clone()
                }
                None => {
                    let channel = Arc::new(Channel::new(topic.clone()));
                    channel.attach(listener_id, listener);
                    let messages = self.inner.feed.open(&topic, &spec);
                    let task = tokio::spawn(pump(
                        Arc::downgrade(&self.inner),
                        channel.clone(),
                        messages,
                    ));
                    channel.set_pump(task);
                    channels.insert(topic.clone(), channel.clone());
                    info!(topic = %topic, "Channel opened");
                    channel
                }
            }
        };

        SubscriptionHandle::attached(
            topic,
            status,
            rx,
            Attachment {
                manager: Arc::downgrade(&self.inner),
                channel,
                listener_id,
                gate,
            },
        )
    }

    /// One profile row; idle until `profile_id` is known
    pub fn subscribe_profile(
        &self,
        profile_id: Option<&str>,
        on_change: ChangeCallback,
    ) -> SubscriptionHandle {
        self.subscribe_row("profiles", "id", profile_id, on_change)
    }

    /// One event row; idle until `event_id` is known
    pub fn subscribe_event(&self, event_id: Option<&str>, on_change: ChangeCallback) -> SubscriptionHandle {
        self.subscribe_row("events", "id", event_id, on_change)
    }

    /// Participant rows of one event; idle until `event_id` is known
    pub fn subscribe_event_participants(
        &self,
        event_id: Option<&str>,
        on_change: ChangeCallback,
    ) -> SubscriptionHandle {
        self.subscribe_row("event_participants", "event_id", event_id, on_change)
    }

    fn subscribe_row(
        &self,
        table: &str,
        column: &str,
        id: Option<&str>,
        on_change: ChangeCallback,
    ) -> SubscriptionHandle {
        let request = SubscriptionRequest::table(table).filter(column, id.unwrap_or_default());
        self.subscribe(&request, on_change, id.is_some())
    }

    /// Number of backend channels currently open
    pub fn active_channels(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Listeners attached to the channel for `topic`
    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(topic)
            .map(|c| c.listener_count())
            .unwrap_or(0)
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("schema", &self.inner.config.schema)
            .field("active_channels", &self.active_channels())
            .finish()
    }
}

/// Forward feed messages to the channel until it ends
async fn pump(
    manager: Weak<ManagerInner>,
    channel: Arc<Channel>,
    mut messages: mpsc::UnboundedReceiver<FeedMessage>,
) {
    let outcome = loop {
        match messages.recv().await {
            Some(FeedMessage::Change(event)) => channel.deliver(&event),
            Some(FeedMessage::Status(ChannelStatus::Subscribed)) => {
                if channel.acknowledge() {
                    debug!(topic = %channel.topic, "Channel acknowledged");
                }
            }
            Some(FeedMessage::Status(ChannelStatus::ChannelError(message))) => {
                warn!(topic = %channel.topic, error = %message, "Channel rejected");
                break HandleStatus::failed(message);
            }
            Some(FeedMessage::Status(ChannelStatus::TimedOut)) => {
                warn!(topic = %channel.topic, "Channel timed out");
                break HandleStatus::failed("Subscription timed out");
            }
            Some(FeedMessage::Status(ChannelStatus::Closed)) | None => {
                info!(topic = %channel.topic, "Channel closed by backend");
                break HandleStatus::new(ConnectionState::Closed);
            }
        }
    };

    if let Some(inner) = manager.upgrade() {
        inner.retire(&channel);
    }
    channel.transition(outcome);
}
