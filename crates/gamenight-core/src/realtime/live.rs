//! Effect-style subscription management for UI components

use super::{ChangeCallback, SubscriptionHandle, SubscriptionManager, SubscriptionRequest};
use crate::backend::{ChangeEvent, ChangeKind};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::warn;

struct Current {
    request: SubscriptionRequest,
    on_change: ChangeCallback,
    enabled: bool,
    handle: SubscriptionHandle,
}

/// Re-subscribes whenever its dependencies change
///
/// Mirrors an effect with `(request, on_change, enabled)` dependencies: the
/// handle is kept while they stay identical, and disposed and replaced
/// otherwise. Dropping it disposes the current handle.
pub struct LiveSubscription {
    manager: SubscriptionManager,
    current: Option<Current>,
}

impl LiveSubscription {
    pub fn new(manager: SubscriptionManager) -> Self {
        Self {
            manager,
            current: None,
        }
    }

    pub fn sync(
        &mut self,
        request: &SubscriptionRequest,
        on_change: &ChangeCallback,
        enabled: bool,
    ) -> &SubscriptionHandle {
        let unchanged = self.current.as_ref().is_some_and(|c| {
            c.enabled == enabled && c.request == *request && same_callback(&c.on_change, on_change)
        });

        if !unchanged {
            if let Some(previous) = self.current.take() {
                previous.handle.dispose();
            }
        }

        let manager = &self.manager;
        &self
            .current
            .get_or_insert_with(|| Current {
                request: request.clone(),
                on_change: on_change.clone(),
                enabled,
                handle: manager.subscribe(request, on_change.clone(), enabled),
            })
            .handle
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.current.as_ref().map(|c| &c.handle)
    }

    pub fn dispose(&mut self) {
        if let Some(current) = self.current.take() {
            current.handle.dispose();
        }
    }
}

fn same_callback(a: &ChangeCallback, b: &ChangeCallback) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Adapt `f` to receive rows decoded into `T`.
///
/// `f` gets the change kind, the decoded new row and the decoded old row.
/// Rows that fail to decode are logged and passed as `None`; a change with
/// neither row decodable is dropped.
pub fn typed_callback<T, F>(f: F) -> ChangeCallback
where
    T: DeserializeOwned + 'static,
    F: Fn(ChangeKind, Option<T>, Option<T>) + Send + Sync + 'static,
{
    Arc::new(move |event: ChangeEvent| {
        let decode = |row: Option<serde_json::Value>| {
            row.and_then(|value| match serde_json::from_value::<T>(value) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(table = %event.table, error = %e, "Dropping undecodable row");
                    None
                }
            })
        };
        let new_row = decode(event.new_row.clone());
        let old_row = decode(event.old_row.clone());
        if new_row.is_none() && old_row.is_none() {
            return;
        }
        f(event.event_type, new_row, old_row);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::RealtimeConfig;
    use crate::realtime::ConnectionState;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Profile {
        id: String,
        display_name: String,
    }

    #[tokio::test]
    async fn test_sync_keeps_handle_until_dependencies_change() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SubscriptionManager::new(backend.clone(), RealtimeConfig::default());
        let mut live = LiveSubscription::new(manager.clone());
        let callback: ChangeCallback = Arc::new(|_| {});
        let first = SubscriptionRequest::table("profiles").filter("id", "u1");

        live.sync(&first, &callback, true);
        live.sync(&first, &callback, true);
        assert_eq!(backend.opens(), 1);

        // New callback identity forces a fresh subscription
        let other: ChangeCallback = Arc::new(|_| {});
        live.sync(&first, &other, true);
        assert_eq!(backend.opens(), 2);
        assert_eq!(manager.active_channels(), 1);

        let handle = live.sync(&first, &other, false);
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(manager.active_channels(), 0);

        live.dispose();
        assert!(live.handle().is_none());
    }

    #[test]
    fn test_typed_callback_decodes_rows() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = typed_callback::<Profile, _>(move |kind, new_row, _old| {
            sink.lock().push((kind, new_row));
        });

        callback(ChangeEvent::insert(
            "profiles",
            json!({"id": "u1", "display_name": "Ada"}),
        ));
        callback(ChangeEvent::insert("profiles", json!({"id": 7})));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            (
                ChangeKind::Insert,
                Some(Profile {
                    id: "u1".into(),
                    display_name: "Ada".into()
                })
            )
        );
    }
}
