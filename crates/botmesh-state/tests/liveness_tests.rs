use std::sync::Arc;
use std::time::Duration;

use botmesh_protocol::{ActionResponse, Dialect};
use botmesh_state::*;
use chrono::Utc;
use serde_json::json;

fn monitor(registry: &Arc<Registry>) -> LivenessMonitor {
    LivenessMonitor::new(Arc::clone(registry), LivenessConfig::default())
}

#[tokio::test]
async fn test_silent_peer_is_evicted_once() {
    let registry = Arc::new(Registry::new());
    let (link, mut rx) = PeerLink::channel("bot:1", 8);
    registry
        .register_bot(BotPeer::new("1", "qq", Dialect::String, link))
        .await;

    let later = Utc::now() + chrono::Duration::seconds(121);
    let evicted = monitor(&registry).sweep(later).await;

    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].peer_id, "1");
    assert!(evicted[0].duration_secs >= 0.0);
    assert_eq!(registry.bot_count().await, 0);
    assert_eq!(
        rx.recv().await,
        Some(LinkCommand::Close("heartbeat_timeout".into()))
    );

    let stats = registry.stats().await;
    assert_eq!(stats.disconnect_count(DisconnectReason::HeartbeatTimeout), 1);
    assert_eq!(stats.total_disconnects(), 1);

    // a second sweep finds nothing left to evict
    assert!(monitor(&registry).sweep(later).await.is_empty());
    assert_eq!(registry.stats().await.total_disconnects(), 1);
}

#[tokio::test]
async fn test_recent_heartbeat_keeps_peer() {
    let registry = Arc::new(Registry::new());
    let (link, _rx) = PeerLink::channel("worker:w", 8);
    registry
        .register_worker(WorkerPeer::new("w", Dialect::Array, link))
        .await;
    assert!(registry.touch_heartbeat(PeerKind::Worker, "w").await);

    let soon = Utc::now() + chrono::Duration::seconds(60);
    assert!(monitor(&registry).sweep(soon).await.is_empty());
    assert_eq!(registry.worker_count().await, 1);
}

#[tokio::test]
async fn test_correlation_resolves_at_most_once() {
    let registry = Registry::new();
    let pending = registry.pending();
    let (echo, rx) = pending.register().await;
    pending.mark_sent(&echo).await;

    let first = ActionResponse::ok(json!({"message_id": 1}), Some(json!(echo.clone())));
    let second = ActionResponse::ok(json!({"message_id": 2}), Some(json!(echo.clone())));
    assert!(pending.resolve(&echo, first).await);
    assert!(!pending.resolve(&echo, second).await);

    let got = rx.await.unwrap();
    assert_eq!(got.data["message_id"], 1);
    assert!(pending.is_empty().await);
}

#[tokio::test]
async fn test_unknown_echo_is_ignored() {
    let registry = Registry::new();
    let stray = ActionResponse::ok(json!(null), Some(json!("nope")));
    assert!(!registry.pending().resolve("nope", stray).await);
}

#[tokio::test]
async fn test_monitor_stops_on_shutdown() {
    let registry = Arc::new(Registry::new());
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(monitor(&registry).run(rx));
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
