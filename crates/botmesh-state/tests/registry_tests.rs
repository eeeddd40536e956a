use std::sync::Arc;

use botmesh_protocol::{Capability, Dialect, IdentityResolver};
use botmesh_state::*;
use chrono::Utc;
use serde_json::json;

fn bot(self_id: &str, platform: &str) -> (BotPeer, tokio::sync::mpsc::Receiver<LinkCommand>) {
    let (link, rx) = PeerLink::channel(format!("bot:{self_id}"), 8);
    (BotPeer::new(self_id, platform, Dialect::Array, link), rx)
}

fn worker(id: &str) -> (WorkerPeer, tokio::sync::mpsc::Receiver<LinkCommand>) {
    let (link, rx) = PeerLink::channel(format!("worker:{id}"), 8);
    (WorkerPeer::new(id, Dialect::Array, link), rx)
}

#[tokio::test]
async fn test_reregistration_overwrites_and_closes_old_link() {
    let registry = Registry::new();
    let (first, mut first_rx) = bot("10001", "qq");
    let (second, _second_rx) = bot("10001", "qq");

    let old_conn = registry.register_bot(first).await;
    let new_conn = registry.register_bot(second).await;
    assert_ne!(old_conn, new_conn);
    assert_eq!(registry.bot_count().await, 1);
    assert_eq!(
        first_rx.recv().await,
        Some(LinkCommand::Close("superseded".into()))
    );
    assert_eq!(
        registry.stats().await.disconnect_count(DisconnectReason::Superseded),
        1
    );

    // the superseded socket closing later must not remove the new entry
    let gone = registry
        .remove_connection(PeerKind::Bot, "10001", old_conn, DisconnectReason::ClientClosed, Utc::now())
        .await;
    assert!(gone.is_none());
    assert_eq!(registry.bot_count().await, 1);
}

#[tokio::test]
async fn test_remove_records_reason_before_close() {
    let registry = Registry::new();
    let (w, mut rx) = worker("w1");
    registry.register_worker(w).await;

    let secs = registry
        .remove(PeerKind::Worker, "w1", DisconnectReason::SocketError)
        .await
        .unwrap();
    assert!(secs >= 0.0);
    assert_eq!(registry.worker_count().await, 0);
    assert_eq!(rx.recv().await, Some(LinkCommand::Close("socket_error".into())));

    let stats = registry.stats().await;
    assert_eq!(stats.disconnect_count(DisconnectReason::SocketError), 1);
    assert_eq!(stats.durations["worker:w1"].sessions, 1);

    assert!(registry
        .remove(PeerKind::Worker, "w1", DisconnectReason::SocketError)
        .await
        .is_none());
}

#[tokio::test]
async fn test_capabilities_replaced_wholesale() {
    let registry = Registry::new();
    let (w, _rx) = worker("w1");
    registry.register_worker(w).await;

    let cap = |name: &str| Capability {
        name: name.into(),
        pattern: format!("^/{name}"),
        ..Default::default()
    };
    assert!(registry.set_capabilities("w1", vec![cap("weather"), cap("dice")]).await);
    assert!(registry.set_capabilities("w1", vec![cap("echo")]).await);
    assert!(!registry.set_capabilities("ghost", vec![cap("echo")]).await);

    let caps = registry.worker_capabilities().await;
    assert_eq!(caps.len(), 1);
    let names: Vec<_> = caps[0].1.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["echo"]);
}

#[tokio::test]
async fn test_find_bot_prefers_id_then_platform() {
    let registry = Registry::new();
    let (a, _ra) = bot("1", "qq");
    let (b, _rb) = bot("2", "wechat");
    registry.register_bot(a).await;
    registry.register_bot(b).await;

    assert_eq!(registry.find_bot(Some("2"), None).await.unwrap().self_id, "2");
    assert_eq!(registry.find_bot(None, Some("qq")).await.unwrap().self_id, "1");
    assert!(registry.find_bot(Some("3"), Some("qq")).await.is_none());
    // ambiguous without hints
    assert!(registry.find_bot(None, None).await.is_none());
}

#[tokio::test]
async fn test_processing_and_rtt_samples() {
    let registry = Registry::new();
    let (w, _rx) = worker("w1");
    registry.register_worker(w).await;

    let t0 = Utc::now();
    registry.note_event_forwarded("w1", t0).await;
    registry
        .note_worker_action("w1", t0 + chrono::Duration::milliseconds(250))
        .await;
    registry.record_rtt("w1", 40.0).await;
    registry.record_rtt("w1", 60.0).await;

    let snapshot = registry.list().await;
    let summary = &snapshot.workers[0];
    assert_eq!(summary.handled_count, 1);
    assert_eq!(summary.avg_processing_ms, Some(250.0));
    assert_eq!(summary.avg_rtt_ms, Some(50.0));
}

#[tokio::test]
async fn test_bot_traffic_updates_last_observed() {
    let registry = Registry::new();
    let (b, _rx) = bot("777", "discord");
    registry.register_bot(b).await;
    assert!(registry.last_observed().await.is_none());

    registry.note_bot_received("777", "discord").await;
    registry.count_traffic(StatScope::Bot, "777").await;
    assert_eq!(
        registry.last_observed().await,
        Some(("discord".to_string(), "777".to_string()))
    );
    assert_eq!(registry.list().await.bots[0].received, 1);
    let traffic = registry.traffic().await;
    assert_eq!(traffic[0].total, 1);
}

#[tokio::test]
async fn test_store_identity_directory_is_idempotent() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let directory = Arc::new(StoreIdentityDirectory::new(Arc::clone(&store)));
    let resolver = IdentityResolver::with_base(directory, 500);

    let a = resolver.resolve("wechat", "wxid_a").await.unwrap();
    let b = resolver.resolve("wechat", "wxid_b").await.unwrap();
    assert_eq!(a, 500);
    assert_eq!(b, 501);
    assert_eq!(resolver.resolve("wechat", "wxid_a").await.unwrap(), a);
    assert_eq!(resolver.restore("wechat", b).await.unwrap().as_deref(), Some("wxid_b"));
    assert_eq!(store.get("identity_seq", "wechat").await.unwrap(), Some(json!(501)));
}
