use super::channel::{Channel, ListenerGate};
use super::manager::ManagerInner;
use super::{ConnectionState, HandleStatus};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

pub(super) struct Attachment {
    pub manager: Weak<ManagerInner>,
    pub channel: Arc<Channel>,
    pub listener_id: u64,
    pub gate: Arc<ListenerGate>,
}

/// One subscriber's view of a (possibly shared) channel
///
/// Dropping the handle disposes it.
pub struct SubscriptionHandle {
    topic: String,
    status_tx: Arc<watch::Sender<HandleStatus>>,
    status_rx: watch::Receiver<HandleStatus>,
    attachment: Mutex<Option<Attachment>>,
}

impl SubscriptionHandle {
    pub(super) fn idle(topic: String) -> Self {
        let (tx, rx) = watch::channel(HandleStatus::default());
        Self {
            topic,
            status_tx: Arc::new(tx),
            status_rx: rx,
            attachment: Mutex::new(None),
        }
    }

    pub(super) fn attached(
        topic: String,
        status_tx: Arc<watch::Sender<HandleStatus>>,
        status_rx: watch::Receiver<HandleStatus>,
        attachment: Attachment,
    ) -> Self {
        Self {
            topic,
            status_tx,
            status_rx,
            attachment: Mutex::new(Some(attachment)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Last connection error reported by the backend
    pub fn error(&self) -> Option<String> {
        self.status_rx.borrow().error.clone()
    }

    pub fn status(&self) -> HandleStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver notified on every state change of this handle
    pub fn watch(&self) -> watch::Receiver<HandleStatus> {
        self.status_rx.clone()
    }

    /// Detach from the channel and move to `closed`.
    ///
    /// Idempotent. An `error` state is kept. Once this returns the callback
    /// is not running and will not be invoked again.
    pub fn dispose(&self) {
        let attachment = self.attachment.lock().take();
        if let Some(attachment) = attachment {
            attachment.gate.lock().set(false);
            match attachment.manager.upgrade() {
                Some(manager) => manager.detach(&attachment.channel, attachment.listener_id),
                None => {
                    attachment.channel.detach(attachment.listener_id);
                }
            }
            debug!(topic = %self.topic, "Subscription disposed");
        }

        self.status_tx.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            status.state = ConnectionState::Closed;
            true
        });
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("status", &*self.status_rx.borrow())
            .finish()
    }
}
