use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use botmesh_broker::{BrokerError, EntryId, Fields, KeyKind, LogBroker, MemoryBroker, StartFrom, StreamEntry};
use botmesh_gateway::*;
use botmesh_protocol::*;
use botmesh_state::*;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

const GROUP: &str = "group:workers";
const CONSUMER: &str = "gw-test";
const PARTITION: &str = "queue:default";

struct Harness {
    registry: Arc<Registry>,
    broker: Arc<MemoryBroker>,
    skills: Arc<SkillRegistry>,
    consumer: QueueConsumer,
}

fn harness() -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    harness_over(broker.clone(), broker)
}

/// `broker` is the backing store the assertions inspect; `log` is what the
/// consumer and dispatcher talk to.
fn harness_over(broker: Arc<MemoryBroker>, log: Arc<dyn LogBroker>) -> Harness {
    let registry = Arc::new(Registry::new());
    let dispatcher = Dispatcher::new(
        registry.clone(),
        log.clone(),
        Arc::new(RoutingTable::new(None)),
        DispatchConfig::default(),
    );
    let skills = Arc::new(SkillRegistry::new());
    let consumer = QueueConsumer::new(
        log,
        dispatcher,
        skills.clone(),
        ConsumerConfig {
            group: GROUP.into(),
            consumer: CONSUMER.into(),
            partitions: vec![PARTITION.into()],
            block: Duration::from_millis(50),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
        },
    );
    Harness {
        registry,
        broker,
        skills,
        consumer,
    }
}

/// Delegates to a [`MemoryBroker`] but can be told to fail publishes and
/// appends to the remote hub, as an unreachable broker would.
struct FlakyBroker {
    inner: Arc<MemoryBroker>,
    fail_publish: AtomicBool,
    fail_hub_append: AtomicBool,
}

impl FlakyBroker {
    fn new(inner: Arc<MemoryBroker>) -> Self {
        Self {
            inner,
            fail_publish: AtomicBool::new(false),
            fail_hub_append: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LogBroker for FlakyBroker {
    async fn key_kind(&self, key: &str) -> Result<KeyKind, BrokerError> {
        self.inner.key_kind(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        self.inner.delete(key).await
    }

    async fn create_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<(), BrokerError> {
        self.inner.create_group(stream, group, start).await
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
        if stream == REMOTE_HUB_PARTITION && self.fail_hub_append.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        self.inner.append(stream, fields).await
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.inner.read_group(group, consumer, streams, count, block).await
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.inner.read_pending(group, consumer, streams, count).await
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError> {
        self.inner.ack(stream, group, id).await
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        self.inner.len(stream).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".into()));
        }
        self.inner.publish(channel, payload).await
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.inner.subscribe(channel)
    }
}

fn flaky_harness() -> (Harness, Arc<FlakyBroker>) {
    let inner = Arc::new(MemoryBroker::new());
    let flaky = Arc::new(FlakyBroker::new(inner.clone()));
    (harness_over(inner, flaky.clone()), flaky)
}

async fn register_echo(skills: &SkillRegistry) {
    skills
        .register(
            "echo",
            Arc::new(FnSkill(|p: &SkillParams| {
                p.get("text").cloned().ok_or_else(|| "text is required".to_string())
            })),
        )
        .await;
}

fn echo_call(text: &str) -> Fields {
    let mut params = SkillParams::new();
    params.insert("text".into(), text.into());
    let mut entry = QueueEntry::skill_call("echo", params);
    entry.task_id = format!("task-{text}");
    entry.to_fields()
}

/// Append and deliver one entry to the test consumer.
async fn deliver(h: &Harness, fields: Fields) -> StreamEntry {
    h.broker.append(PARTITION, fields).await.unwrap();
    let mut entries = h
        .broker
        .read_group(GROUP, CONSUMER, &[PARTITION.to_string()], 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    entries.remove(0)
}

#[tokio::test]
async fn test_legacy_list_is_replaced_by_log() {
    let h = harness();
    h.broker.push_list(PARTITION, "old").await.unwrap();
    assert_eq!(
        h.broker.key_kind(PARTITION).await.unwrap(),
        KeyKind::Other("list".into())
    );

    h.consumer.ensure_groups().await.unwrap();
    assert_eq!(h.broker.key_kind(PARTITION).await.unwrap(), KeyKind::Log);
    // a second pass finds the group already there
    h.consumer.ensure_groups().await.unwrap();
}

#[tokio::test]
async fn test_skill_call_publishes_result_and_acks() {
    let h = harness();
    register_echo(&h.skills).await;
    h.consumer.ensure_groups().await.unwrap();
    let mut results = h.broker.subscribe(SKILL_RESULT_CHANNEL);

    let entry = deliver(&h, echo_call("hi")).await;
    assert_eq!(h.consumer.process_entry(&entry).await, EntryOutcome::Processed);

    let result: SkillResult = serde_json::from_str(&results.recv().await.unwrap()).unwrap();
    assert_eq!(result.skill, "echo");
    assert_eq!(result.status, SkillStatus::Succeeded);
    assert_eq!(result.result, "hi");
    assert_eq!(result.task_id, "task-hi");
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 0);
    assert!(!h.broker.ack(PARTITION, GROUP, entry.id).await.unwrap());
}

#[tokio::test]
async fn test_unknown_skill_reports_failure() {
    let h = harness();
    h.consumer.ensure_groups().await.unwrap();
    let mut results = h.broker.subscribe(SKILL_RESULT_CHANNEL);

    let entry = deliver(&h, QueueEntry::skill_call("nope", SkillParams::new()).to_fields()).await;
    assert_eq!(h.consumer.process_entry(&entry).await, EntryOutcome::Processed);

    let result: SkillResult = serde_json::from_str(&results.recv().await.unwrap()).unwrap();
    assert_eq!(result.status, SkillStatus::Failed);
    assert!(result.error.unwrap().contains("nope"));
}

#[tokio::test]
async fn test_malformed_entry_is_acked() {
    let h = harness();
    h.consumer.ensure_groups().await.unwrap();

    let mut fields = Fields::new();
    fields.insert("type".into(), "event".into());
    fields.insert("payload".into(), "{not json".into());
    let entry = deliver(&h, fields).await;

    assert!(matches!(
        h.consumer.process_entry(&entry).await,
        EntryOutcome::Rejected(_)
    ));
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 0);
}

#[tokio::test]
async fn test_panicking_skill_is_acked() {
    let h = harness();
    h.skills
        .register(
            "boom",
            Arc::new(FnSkill(|_: &SkillParams| -> Result<String, String> {
                panic!("skill exploded")
            })),
        )
        .await;
    h.consumer.ensure_groups().await.unwrap();

    let entry = deliver(&h, QueueEntry::skill_call("boom", SkillParams::new()).to_fields()).await;
    assert_eq!(h.consumer.process_entry(&entry).await, EntryOutcome::Panicked);
    assert!(!h.broker.ack(PARTITION, GROUP, entry.id).await.unwrap());
}

#[tokio::test]
async fn test_run_loop_survives_poison_entry() {
    let h = harness();
    register_echo(&h.skills).await;
    h.skills
        .register(
            "boom",
            Arc::new(FnSkill(|_: &SkillParams| -> Result<String, String> {
                panic!("skill exploded")
            })),
        )
        .await;
    let mut results = h.broker.subscribe(SKILL_RESULT_CHANNEL);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.consumer.clone().run(shutdown_rx));

    h.broker
        .append(PARTITION, QueueEntry::skill_call("boom", SkillParams::new()).to_fields())
        .await
        .unwrap();
    h.broker.append(PARTITION, echo_call("after")).await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    let result: SkillResult = serde_json::from_str(&payload).unwrap();
    assert_eq!(result.result, "after");

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while h.broker.pending_count(PARTITION, GROUP).await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_event_entry_reaches_worker() {
    let h = harness();
    let (link, mut worker_rx) = PeerLink::channel("worker:w1", 8);
    h.registry
        .register_worker(WorkerPeer::new("w1", Dialect::String, link))
        .await;
    h.consumer.ensure_groups().await.unwrap();

    let event = json!({
        "post_type": "message",
        "message_type": "private",
        "self_id": 10001,
        "user_id": 42,
        "message": [{"type": "text", "data": {"text": "queued hello"}}]
    });
    let entry = deliver(&h, QueueEntry::event(event).to_fields()).await;
    assert_eq!(h.consumer.process_entry(&entry).await, EntryOutcome::Processed);

    match worker_rx.recv().await {
        Some(LinkCommand::Frame(text)) => {
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(frame["message"], "queued hello");
        }
        other => panic!("expected a frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unacked_entries_are_replayed() {
    let h = harness();
    register_echo(&h.skills).await;
    h.consumer.ensure_groups().await.unwrap();

    // delivered to this consumer, never acknowledged
    deliver(&h, echo_call("again")).await;
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 1);

    assert_eq!(h.consumer.drain_pending().await, 1);
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 0);
}

#[test]
fn test_remote_hub_is_never_consumed() {
    let config = ConsumerConfig::from_queue(&GatewayConfig::default().queue);
    assert!(!config.partitions.contains(&REMOTE_HUB_PARTITION.to_string()));
    assert_eq!(config.partitions[0], DEFAULT_PARTITION);
}

#[tokio::test]
async fn test_skill_result_falls_back_to_workers_when_publish_fails() {
    let (h, flaky) = flaky_harness();
    register_echo(&h.skills).await;
    let (link, mut worker_rx) = PeerLink::channel("worker:w1", 8);
    h.registry
        .register_worker(WorkerPeer::new("w1", Dialect::Array, link))
        .await;
    h.consumer.ensure_groups().await.unwrap();
    flaky.fail_publish.store(true, Ordering::SeqCst);

    let entry = deliver(&h, echo_call("direct")).await;
    assert_eq!(h.consumer.process_entry(&entry).await, EntryOutcome::Processed);

    let frame: Value = match worker_rx.recv().await {
        Some(LinkCommand::Frame(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a frame, got {other:?}"),
    };
    assert_eq!(frame["type"], "skill_result");
    assert_eq!(frame["skill"], "echo");
    assert_eq!(frame["result"], "direct");
    assert_eq!(frame["task_id"], "task-direct");
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_failure_leaves_entry_pending() {
    let (h, flaky) = flaky_harness();
    h.consumer.ensure_groups().await.unwrap();
    flaky.fail_hub_append.store(true, Ordering::SeqCst);

    // no bot is connected, so the action has to go through the remote hub
    let action = json!({
        "action": "send_group_msg",
        "params": {"self_id": "10001", "group_id": 777, "message": "later"}
    });
    let entry = deliver(&h, QueueEntry::event(action).to_fields()).await;
    assert!(matches!(
        h.consumer.process_entry(&entry).await,
        EntryOutcome::Retry(_)
    ));
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 1);

    // still failing: replayed, and still pending
    assert_eq!(h.consumer.drain_pending().await, 1);
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 1);

    flaky.fail_hub_append.store(false, Ordering::SeqCst);
    assert_eq!(h.consumer.drain_pending().await, 1);
    assert_eq!(h.broker.pending_count(PARTITION, GROUP).await.unwrap(), 0);
    let hub = h.broker.entries(REMOTE_HUB_PARTITION).await.unwrap();
    assert_eq!(hub.len(), 1);
    assert_eq!(hub[0].field("action"), Some("send_group_msg"));
}
