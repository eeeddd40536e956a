use std::sync::Arc;
use std::time::Duration;

use botmesh_broker::*;

fn fields(payload: &str) -> Fields {
    Fields::from([("payload".to_string(), payload.to_string())])
}

fn streams(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_group_delivers_each_entry_once() {
    let broker = MemoryBroker::new();
    broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();
    broker.append("q", fields("a")).await.unwrap();
    broker.append("q", fields("b")).await.unwrap();

    let first = broker.read_group("g", "c1", &streams(&["q"]), 1, Duration::ZERO).await.unwrap();
    let second = broker.read_group("g", "c2", &streams(&["q"]), 10, Duration::ZERO).await.unwrap();
    let third = broker.read_group("g", "c1", &streams(&["q"]), 10, Duration::ZERO).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].field("payload"), Some("a"));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].field("payload"), Some("b"));
    assert!(third.is_empty());
    assert_eq!(broker.pending_count("q", "g").await.unwrap(), 2);
}

#[tokio::test]
async fn test_new_only_group_skips_backlog() {
    let broker = MemoryBroker::new();
    broker.append("q", fields("old")).await.unwrap();
    broker.create_group("q", "g", StartFrom::NewOnly).await.unwrap();
    broker.append("q", fields("new")).await.unwrap();

    let got = broker.read_group("g", "c", &streams(&["q"]), 10, Duration::ZERO).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].field("payload"), Some("new"));
}

#[tokio::test]
async fn test_create_group_twice_fails() {
    let broker = MemoryBroker::new();
    broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();
    let err = broker.create_group("q", "g", StartFrom::Beginning).await.unwrap_err();
    assert!(matches!(err, BrokerError::GroupExists { .. }));
}

#[tokio::test]
async fn test_read_without_group_fails() {
    let broker = MemoryBroker::new();
    broker.append("q", fields("x")).await.unwrap();
    let err = broker
        .read_group("missing", "c", &streams(&["q"]), 1, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoSuchGroup { .. }));
}

#[tokio::test]
async fn test_ack_clears_pending_once() {
    let broker = MemoryBroker::new();
    broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();
    let id = broker.append("q", fields("x")).await.unwrap();
    broker.read_group("g", "c", &streams(&["q"]), 1, Duration::ZERO).await.unwrap();

    assert!(broker.ack("q", "g", id).await.unwrap());
    assert!(!broker.ack("q", "g", id).await.unwrap());
    assert_eq!(broker.pending_count("q", "g").await.unwrap(), 0);
}

#[tokio::test]
async fn test_blocking_read_wakes_on_append() {
    let broker = Arc::new(MemoryBroker::new());
    broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();

    let reader = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .read_group("g", "c", &streams(&["q"]), 1, Duration::from_secs(5))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.append("q", fields("late")).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].field("payload"), Some("late"));
}

#[tokio::test]
async fn test_blocking_read_times_out_empty() {
    let broker = MemoryBroker::new();
    broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();
    let got = broker
        .read_group("g", "c", &streams(&["q"]), 1, Duration::from_millis(30))
        .await
        .unwrap();
    assert!(got.is_empty());
}

#[tokio::test]
async fn test_read_spans_streams_in_order() {
    let broker = MemoryBroker::new();
    for q in ["q1", "q2"] {
        broker.create_group(q, "g", StartFrom::Beginning).await.unwrap();
    }
    broker.append("q2", fields("two")).await.unwrap();
    broker.append("q1", fields("one")).await.unwrap();

    let got = broker.read_group("g", "c", &streams(&["q1", "q2"]), 10, Duration::ZERO).await.unwrap();
    let order: Vec<_> = got.iter().map(|e| e.stream.as_str()).collect();
    assert_eq!(order, vec!["q1", "q2"]);
}

#[tokio::test]
async fn test_legacy_list_key_is_wrong_type() {
    let broker = MemoryBroker::new();
    broker.push_list("queue:default", "{\"legacy\":true}").await.unwrap();

    assert_eq!(
        broker.key_kind("queue:default").await.unwrap(),
        KeyKind::Other("list".into())
    );
    let err = broker
        .create_group("queue:default", "g", StartFrom::Beginning)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::WrongType { .. }));

    assert!(broker.delete("queue:default").await.unwrap());
    broker.create_group("queue:default", "g", StartFrom::Beginning).await.unwrap();
    assert_eq!(broker.key_kind("queue:default").await.unwrap(), KeyKind::Log);
    assert_eq!(broker.len("queue:default").await.unwrap(), 0);
}

#[tokio::test]
async fn test_journal_restores_pending_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.jsonl");

    let (acked, unacked) = {
        let broker = MemoryBroker::open(&path).unwrap();
        broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();
        let a = broker.append("q", fields("a")).await.unwrap();
        let b = broker.append("q", fields("b")).await.unwrap();
        broker.read_group("g", "c", &streams(&["q"]), 10, Duration::ZERO).await.unwrap();
        broker.ack("q", "g", a).await.unwrap();
        (a, b)
    };

    let broker = MemoryBroker::open(&path).unwrap();
    // the acknowledged head was trimmed before the restart
    assert_eq!(broker.len("q").await.unwrap(), 1);

    let pending = broker.read_pending("g", "c", &streams(&["q"]), 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, unacked);
    assert_ne!(pending[0].id, acked);

    // already delivered before the restart
    let fresh = broker.read_group("g", "c", &streams(&["q"]), 10, Duration::ZERO).await.unwrap();
    assert!(fresh.is_empty());

    // ids keep increasing after replay
    let next = broker.append("q", fields("c")).await.unwrap();
    assert!(next > unacked);
}

#[tokio::test]
async fn test_pending_is_per_consumer() {
    let broker = MemoryBroker::new();
    broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();
    broker.append("q", fields("x")).await.unwrap();
    broker.read_group("g", "c1", &streams(&["q"]), 1, Duration::ZERO).await.unwrap();

    assert_eq!(broker.read_pending("g", "c1", &streams(&["q"]), 10).await.unwrap().len(), 1);
    assert!(broker.read_pending("g", "c2", &streams(&["q"]), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_reaches_subscribers() {
    let broker = MemoryBroker::new();
    assert_eq!(broker.publish("worker:register", "nobody").await.unwrap(), 0);

    let mut rx = broker.subscribe("worker:register");
    assert_eq!(broker.publish("worker:register", "hello").await.unwrap(), 1);
    assert_eq!(rx.recv().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_failed_read_delivers_nothing() {
    let broker = MemoryBroker::new();
    for q in ["a", "b"] {
        broker.create_group(q, "g", StartFrom::Beginning).await.unwrap();
    }
    broker.delete("b").await.unwrap();
    broker.append("a", fields("kept")).await.unwrap();

    let err = broker
        .read_group("g", "c", &streams(&["a", "b"]), 2, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoSuchGroup { stream, .. } if stream == "b"));
    assert_eq!(broker.pending_count("a", "g").await.unwrap(), 0);

    let got = broker.read_group("g", "c", &streams(&["a"]), 2, Duration::ZERO).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].field("payload"), Some("kept"));
}

#[tokio::test]
async fn test_acked_head_is_trimmed() {
    let broker = MemoryBroker::new();
    broker.create_group("q", "g1", StartFrom::Beginning).await.unwrap();
    broker.create_group("q", "g2", StartFrom::Beginning).await.unwrap();
    let a = broker.append("q", fields("a")).await.unwrap();
    let b = broker.append("q", fields("b")).await.unwrap();
    broker.read_group("g1", "c", &streams(&["q"]), 10, Duration::ZERO).await.unwrap();
    broker.read_group("g2", "c", &streams(&["q"]), 1, Duration::ZERO).await.unwrap();

    // g2 has not seen b yet, and g1 still holds a
    broker.ack("q", "g1", b).await.unwrap();
    assert_eq!(broker.len("q").await.unwrap(), 2);
    broker.ack("q", "g2", a).await.unwrap();
    assert_eq!(broker.len("q").await.unwrap(), 2);

    broker.ack("q", "g1", a).await.unwrap();
    let left = broker.entries("q").await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, b);

    // the next id still moves forward
    let c = broker.append("q", fields("c")).await.unwrap();
    assert!(c > b);
}

#[tokio::test]
async fn test_unconsumed_log_is_capped() {
    let broker = MemoryBroker::new().with_max_len(3);
    for n in 0..5 {
        broker.append("queue:remote_hub", fields(&n.to_string())).await.unwrap();
    }
    let left: Vec<_> = broker
        .entries("queue:remote_hub")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.fields["payload"].clone())
        .collect();
    assert_eq!(left, vec!["2", "3", "4"]);
}

#[tokio::test]
async fn test_journal_is_compacted_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.jsonl");

    let pending = {
        let broker = MemoryBroker::open(&path).unwrap();
        broker.create_group("q", "g", StartFrom::Beginning).await.unwrap();
        for n in 0..20 {
            let id = broker.append("q", fields(&n.to_string())).await.unwrap();
            broker.read_group("g", "c", &streams(&["q"]), 1, Duration::ZERO).await.unwrap();
            if n < 19 {
                broker.ack("q", "g", id).await.unwrap();
            }
        }
        broker.push_list("legacy", "x").await.unwrap();
        broker.push_list("legacy", "y").await.unwrap();
        broker.entries("q").await.unwrap()
    };
    let before = std::fs::read_to_string(&path).unwrap().lines().count();

    let broker = MemoryBroker::open(&path).unwrap();
    let after = std::fs::read_to_string(&path).unwrap().lines().count();
    assert!(after < before, "journal went from {before} to {after} lines");

    assert_eq!(broker.entries("q").await.unwrap(), pending);
    let replay = broker.read_pending("g", "c", &streams(&["q"]), 10).await.unwrap();
    assert_eq!(replay, pending);
    assert_eq!(broker.key_kind("legacy").await.unwrap(), KeyKind::Other("list".into()));

    // a second restart over the compacted file sees the same state
    drop(broker);
    let broker = MemoryBroker::open(&path).unwrap();
    assert_eq!(broker.entries("q").await.unwrap(), pending);
    assert_eq!(broker.pending_count("q", "g").await.unwrap(), 1);
}
