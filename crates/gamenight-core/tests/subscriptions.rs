//! Subscription lifecycle against the in-process backend

use gamenight_core::backend::{ChangeEvent, ChangeKind, MemoryBackend, RowFilter};
use gamenight_core::config::RealtimeConfig;
use gamenight_core::realtime::{
    ChangeCallback, ConnectionState, LiveSubscription, SubscriptionHandle, SubscriptionManager,
    SubscriptionRequest,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn setup() -> (Arc<MemoryBackend>, SubscriptionManager) {
    let backend = Arc::new(MemoryBackend::new());
    let manager = SubscriptionManager::new(backend.clone(), RealtimeConfig::default());
    (backend, manager)
}

fn recorder() -> (ChangeCallback, mpsc::UnboundedReceiver<ChangeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ChangeCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (callback, rx)
}

async fn wait_state(handle: &SubscriptionHandle, state: ConnectionState) {
    let mut status = handle.watch();
    tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| s.state == state))
        .await
        .expect("state not reached in time")
        .expect("status channel closed");
}

/// No event within 100ms. A closed channel (listener dropped) counts as none.
async fn nothing_received(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> bool {
    !matches!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv()).await,
        Ok(Some(_))
    )
}

fn event_row() -> SubscriptionRequest {
    SubscriptionRequest::table("events").filter("id", "e1")
}

#[tokio::test(start_paused = true)]
async fn test_dispose_closes_and_stops_callbacks() {
    let (backend, manager) = setup();
    let (callback, mut rx) = recorder();

    let handle = manager.subscribe(&event_row(), callback, true);
    assert_eq!(handle.state(), ConnectionState::Connecting);
    wait_state(&handle, ConnectionState::Open).await;
    assert!(handle.is_connected());

    backend.insert("events", json!({"id": "e1", "title": "Catan night"}));
    backend.insert("events", json!({"id": "e2", "title": "Other"}));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_type, ChangeKind::Insert);
    assert_eq!(event.new_row.unwrap()["title"], "Catan night");

    handle.dispose();
    handle.dispose();
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(handle.error(), None);
    assert!(!backend.is_open(handle.topic()));

    backend.insert("events", json!({"id": "e1", "title": "Again"}));
    assert!(nothing_received(&mut rx).await);
}

#[tokio::test(start_paused = true)]
async fn test_identical_requests_share_channel() {
    let (backend, manager) = setup();
    let (first_cb, mut first_rx) = recorder();
    let (second_cb, mut second_rx) = recorder();

    let first = manager.subscribe(&event_row(), first_cb, true);
    wait_state(&first, ConnectionState::Open).await;

    // Late subscriber inherits the open state
    let second = manager.subscribe(&event_row(), second_cb, true);
    assert_eq!(second.state(), ConnectionState::Open);
    assert_eq!(backend.opens(), 1);
    assert_eq!(manager.listener_count(first.topic()), 2);

    backend.insert("events", json!({"id": "e1"}));
    assert_eq!(first_rx.recv().await.unwrap().event_type, ChangeKind::Insert);
    assert_eq!(second_rx.recv().await.unwrap().event_type, ChangeKind::Insert);

    first.dispose();
    assert!(backend.is_open(second.topic()));
    backend.delete("events", &RowFilter::eq("id", "e1"));
    assert_eq!(second_rx.recv().await.unwrap().event_type, ChangeKind::Delete);
    assert!(nothing_received(&mut first_rx).await);

    drop(second);
    assert_eq!(manager.active_channels(), 0);
    assert_eq!(backend.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_surfaces_error_without_retry() {
    let (backend, manager) = setup();
    backend.set_auto_ack(false);
    let (callback, _rx) = recorder();

    let handle = manager.subscribe(&event_row(), callback.clone(), true);
    tokio::task::yield_now().await;
    assert_eq!(handle.state(), ConnectionState::Connecting);

    assert!(backend.reject(handle.topic(), "permission denied"));
    wait_state(&handle, ConnectionState::Error).await;
    assert_eq!(handle.error().as_deref(), Some("permission denied"));
    assert!(!handle.is_connected());
    assert_eq!(manager.active_channels(), 0);

    // Disposal keeps the error
    handle.dispose();
    assert_eq!(handle.state(), ConnectionState::Error);

    // Nothing reconnects on its own; a new subscribe opens a fresh channel
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.opens(), 1);
    let retry = manager.subscribe(&event_row(), callback, true);
    assert_eq!(retry.state(), ConnectionState::Connecting);
    assert_eq!(backend.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_and_server_close() {
    let (backend, manager) = setup();
    let (callback, _rx) = recorder();

    backend.set_auto_ack(false);
    let timed_out = manager.subscribe(&SubscriptionRequest::table("friendships"), callback.clone(), true);
    assert!(backend.time_out(timed_out.topic()));
    wait_state(&timed_out, ConnectionState::Error).await;
    assert_eq!(timed_out.error().as_deref(), Some("Subscription timed out"));

    backend.set_auto_ack(true);
    let closed = manager.subscribe(&SubscriptionRequest::table("user_games"), callback, true);
    wait_state(&closed, ConnectionState::Open).await;
    assert!(backend.close_from_server(closed.topic()));
    wait_state(&closed, ConnectionState::Closed).await;
    assert_eq!(closed.error(), None);
    assert_eq!(manager.active_channels(), 0);
}

#[tokio::test]
async fn test_disabled_subscription_stays_idle() {
    let (backend, manager) = setup();
    let (callback, _rx) = recorder();

    let handle = manager.subscribe(&event_row(), callback.clone(), false);
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert_eq!(backend.opens(), 0);

    let profile = manager.subscribe_profile(None, callback);
    assert_eq!(profile.state(), ConnectionState::Idle);
    assert_eq!(manager.active_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_callback_may_dispose_its_own_handle() {
    let (backend, manager) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

    let callback: ChangeCallback = {
        let calls = calls.clone();
        let slot = slot.clone();
        Arc::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = slot.lock().as_ref() {
                handle.dispose();
            }
        })
    };

    let handle = manager.subscribe(&event_row(), callback, true);
    wait_state(&handle, ConnectionState::Open).await;
    let topic = handle.topic().to_string();
    *slot.lock() = Some(handle);

    backend.insert("events", json!({"id": "e1"}));
    backend.insert("events", json!({"id": "e1"}));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!backend.is_open(&topic));
    let state = slot.lock().as_ref().map(|h| h.state());
    assert_eq!(state, Some(ConnectionState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_live_subscription_follows_dependencies() {
    let (backend, manager) = setup();
    let (callback, mut rx) = recorder();
    let mut live = LiveSubscription::new(manager.clone());

    let e1 = SubscriptionRequest::table("events").filter("id", "e1");
    let e2 = SubscriptionRequest::table("events").filter("id", "e2");

    live.sync(&e1, &callback, true);
    live.sync(&e1, &callback, true);
    assert_eq!(backend.opens(), 1);

    let handle = live.sync(&e2, &callback, true);
    wait_state(handle, ConnectionState::Open).await;
    assert_eq!(backend.opens(), 2);
    assert_eq!(manager.active_channels(), 1);

    backend.insert("events", json!({"id": "e1"}));
    backend.insert("events", json!({"id": "e2"}));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.new_row.unwrap()["id"], "e2");

    live.sync(&e2, &callback, false);
    assert_eq!(manager.active_channels(), 0);
    assert_eq!(
        live.handle().map(|h| h.state()),
        Some(ConnectionState::Idle)
    );
}
