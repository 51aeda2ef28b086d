//! One shared backend channel and its listeners

use super::{ChangeCallback, ConnectionState, HandleStatus};
use crate::backend::ChangeEvent;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

/// Per-listener gate held while its callback runs.
///
/// Disposal flips it under the same lock, so once `dispose` returns no
/// invocation is running or will start. Reentrant so a callback may dispose
/// its own handle.
pub(super) type ListenerGate = ReentrantMutex<Cell<bool>>;

pub(super) struct Listener {
    pub gate: Arc<ListenerGate>,
    pub callback: ChangeCallback,
    pub status: Arc<watch::Sender<HandleStatus>>,
}

struct Shared {
    status: HandleStatus,
    listeners: HashMap<u64, Listener>,
}

pub(super) struct Channel {
    pub topic: String,
    shared: Mutex<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(topic: String) -> Self {
        Self {
            topic,
            shared: Mutex::new(Shared {
                status: HandleStatus::new(ConnectionState::Connecting),
                listeners: HashMap::new(),
            }),
            pump: Mutex::new(None),
        }
    }

    /// Attach a listener; it starts from the channel's current state
    pub fn attach(&self, id: u64, listener: Listener) {
        let mut shared = self.shared.lock();
        listener.status.send_replace(shared.status.clone());
        shared.listeners.insert(id, listener);
    }

    /// Returns the number of listeners left
    pub fn detach(&self, id: u64) -> usize {
        let mut shared = self.shared.lock();
        shared.listeners.remove(&id);
        shared.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.lock().listeners.len()
    }

    /// Move to `status` unless already terminal. Returns whether it moved.
    pub fn transition(&self, status: HandleStatus) -> bool {
        let mut shared = self.shared.lock();
        if shared.status.state.is_terminal() {
            return false;
        }
        for listener in shared.listeners.values() {
            listener.status.send_replace(status.clone());
        }
        shared.status = status;
        true
    }

    /// Acknowledgement only applies while connecting
    pub fn acknowledge(&self) -> bool {
        let connecting = self.shared.lock().status.state == ConnectionState::Connecting;
        connecting && self.transition(HandleStatus::new(ConnectionState::Open))
    }

    pub fn deliver(&self, event: &ChangeEvent) {
        let targets: Vec<(Arc<ListenerGate>, ChangeCallback)> = self
            .shared
            .lock()
            .listeners
            .values()
            .map(|l| (l.gate.clone(), l.callback.clone()))
            .collect();

        trace!(topic = %self.topic, listeners = targets.len(), "Delivering change");
        for (gate, callback) in targets {
            let active = gate.lock();
            if active.get() {
                callback(event.clone());
            }
        }
    }

    pub fn set_pump(&self, task: JoinHandle<()>) {
        *self.pump.lock() = Some(task);
    }

    pub fn stop_pump(&self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &shared.status.state)
            .field("listeners", &shared.listeners.len())
            .finish()
    }
}
