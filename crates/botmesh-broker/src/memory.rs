//! In-process [`LogBroker`] with optional journal durability.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};

use crate::journal::{Journal, JournalOp};
use crate::log::{EntryId, Fields, KeyKind, LogBroker, StartFrom, StreamEntry};
use crate::BrokerError;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct PendingEntry {
    consumer: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Log {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    /// Highest id ever dropped by a trim.
    trimmed_through: EntryId,
    groups: HashMap<String, ConsumerGroup>,
}

impl Log {
    /// Last id of the leading run of entries every group has delivered and
    /// acknowledged. Logs without groups are never trimmed this way.
    fn acked_prefix(&self) -> Option<EntryId> {
        if self.groups.is_empty() {
            return None;
        }
        self.entries
            .keys()
            .take_while(|id| {
                self.groups
                    .values()
                    .all(|g| **id <= g.last_delivered && !g.pending.contains_key(*id))
            })
            .last()
            .copied()
    }

    /// Id up to which entries must go to keep at most `max_len`.
    fn overflow_bound(&self, max_len: usize) -> Option<EntryId> {
        let excess = self.entries.len().checked_sub(max_len)?;
        if excess == 0 {
            return None;
        }
        self.entries.keys().nth(excess - 1).copied()
    }

    fn trim_through(&mut self, up_to: EntryId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| *id > up_to);
        self.trimmed_through = self.trimmed_through.max(up_to);
        self.last_id = self.last_id.max(up_to);
        before - self.entries.len()
    }
}

#[derive(Debug)]
enum KeyValue {
    Log(Log),
    /// Pre-log queue format still found in older deployments.
    List(VecDeque<String>),
}

impl KeyValue {
    fn kind_name(&self) -> &'static str {
        match self {
            KeyValue::Log(_) => "log",
            KeyValue::List(_) => "list",
        }
    }
}

#[derive(Default)]
struct Keyspace {
    keys: HashMap<String, KeyValue>,
    journal: Option<Journal>,
}

impl Keyspace {
    fn record(&mut self, op: JournalOp) -> Result<(), BrokerError> {
        match self.journal.as_mut() {
            Some(journal) => journal.record(&op),
            None => Ok(()),
        }
    }

    fn log_mut(&mut self, key: &str) -> Result<Option<&mut Log>, BrokerError> {
        match self.keys.get_mut(key) {
            None => Ok(None),
            Some(KeyValue::Log(log)) => Ok(Some(log)),
            Some(other) => Err(BrokerError::WrongType {
                key: key.to_string(),
                kind: other.kind_name().to_string(),
            }),
        }
    }

    fn log_or_create(&mut self, key: &str) -> Result<&mut Log, BrokerError> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| KeyValue::Log(Log::default()))
        {
            KeyValue::Log(log) => Ok(log),
            other => Err(BrokerError::WrongType {
                key: key.to_string(),
                kind: other.kind_name().to_string(),
            }),
        }
    }

    /// Apply a journaled operation without re-recording it.
    fn replay(&mut self, op: JournalOp) -> Result<(), BrokerError> {
        match op {
            JournalOp::Append { stream, id, fields } => {
                let log = self.log_or_create(&stream)?;
                log.last_id = log.last_id.max(id);
                log.entries.insert(id, fields);
            }
            JournalOp::CreateGroup {
                stream,
                group,
                last_delivered,
            } => {
                let log = self.log_or_create(&stream)?;
                log.groups.entry(group).or_insert_with(|| ConsumerGroup {
                    last_delivered,
                    pending: BTreeMap::new(),
                });
            }
            JournalOp::Deliver {
                stream,
                group,
                consumer,
                id,
            } => {
                if let Some(g) = self
                    .log_mut(&stream)?
                    .and_then(|log| log.groups.get_mut(&group))
                {
                    g.last_delivered = g.last_delivered.max(id);
                    let pending = g.pending.entry(id).or_default();
                    pending.consumer = consumer;
                    pending.deliveries += 1;
                }
            }
            JournalOp::Ack { stream, group, id } => {
                if let Some(g) = self
                    .log_mut(&stream)?
                    .and_then(|log| log.groups.get_mut(&group))
                {
                    g.pending.remove(&id);
                }
            }
            JournalOp::ListPush { key, value } => {
                if let KeyValue::List(list) = self
                    .keys
                    .entry(key)
                    .or_insert_with(|| KeyValue::List(VecDeque::new()))
                {
                    list.push_front(value);
                }
            }
            JournalOp::Delete { key } => {
                self.keys.remove(&key);
            }
            JournalOp::Trim { stream, up_to } => {
                self.log_or_create(&stream)?.trim_through(up_to);
            }
        }
        Ok(())
    }

    /// The shortest op sequence that replays into the current state.
    fn snapshot(&self) -> Vec<JournalOp> {
        let mut ops = Vec::new();
        for (key, value) in &self.keys {
            match value {
                KeyValue::List(list) => {
                    // replay pushes to the front
                    for v in list.iter().rev() {
                        ops.push(JournalOp::ListPush {
                            key: key.clone(),
                            value: v.clone(),
                        });
                    }
                }
                KeyValue::Log(log) => {
                    ops.push(JournalOp::Trim {
                        stream: key.clone(),
                        up_to: log.trimmed_through,
                    });
                    for (id, fields) in &log.entries {
                        ops.push(JournalOp::Append {
                            stream: key.clone(),
                            id: *id,
                            fields: fields.clone(),
                        });
                    }
                    for (group, g) in &log.groups {
                        ops.push(JournalOp::CreateGroup {
                            stream: key.clone(),
                            group: group.clone(),
                            last_delivered: g.last_delivered,
                        });
                        for (id, pending) in &g.pending {
                            for _ in 0..pending.deliveries.max(1) {
                                ops.push(JournalOp::Deliver {
                                    stream: key.clone(),
                                    group: group.clone(),
                                    consumer: pending.consumer.clone(),
                                    id: *id,
                                });
                            }
                        }
                    }
                }
            }
        }
        ops
    }
}

/// Log broker held in process memory.
///
/// Opened with [`MemoryBroker::open`], every mutation is journaled first so a
/// restarted gateway sees the same logs, groups and pending entries.
pub struct MemoryBroker {
    space: Mutex<Keyspace>,
    appended: Notify,
    channels: std::sync::Mutex<HashMap<String, broadcast::Sender<String>>>,
    /// Per-log entry cap; the oldest entries go first.
    max_len: Option<usize>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker with no journal; contents are lost on drop.
    pub fn new() -> Self {
        Self {
            space: Mutex::new(Keyspace::default()),
            appended: Notify::new(),
            channels: std::sync::Mutex::new(HashMap::new()),
            max_len: None,
        }
    }

    /// Cap every log at `max_len` entries. Logs nobody consumes here, such
    /// as the remote hub, are otherwise only bounded by this.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len.max(1));
        self
    }

    /// A broker journaled at `path`, replaying whatever the journal holds.
    /// The journal is compacted to a snapshot once replayed.
    pub fn open(path: &Path) -> Result<Self, BrokerError> {
        let (mut journal, ops) = Journal::open(path)?;
        let mut space = Keyspace::default();
        let replayed = ops.len();
        for op in ops {
            if let Err(e) = space.replay(op) {
                tracing::warn!(error = %e, "Skipping journal operation that no longer applies");
            }
        }
        let snapshot = space.snapshot();
        if snapshot.len() < replayed {
            journal.rewrite(&snapshot)?;
        }
        space.journal = Some(journal);
        tracing::info!(path = %path.display(), replayed, kept = snapshot.len().min(replayed), "Broker journal opened");

        Ok(Self {
            space: Mutex::new(space),
            appended: Notify::new(),
            channels: std::sync::Mutex::new(HashMap::new()),
            max_len: None,
        })
    }

    /// Rewrite the journal as a snapshot of the current state. Returns the
    /// number of records written, or 0 without a journal.
    pub async fn compact(&self) -> Result<usize, BrokerError> {
        let mut space = self.space.lock().await;
        let snapshot = space.snapshot();
        match space.journal.as_mut() {
            Some(journal) => {
                journal.rewrite(&snapshot)?;
                Ok(snapshot.len())
            }
            None => Ok(0),
        }
    }

    /// Push onto a list key, the storage format used before logs existed.
    pub async fn push_list(&self, key: &str, value: &str) -> Result<usize, BrokerError> {
        let mut space = self.space.lock().await;
        let len = match space
            .keys
            .entry(key.to_string())
            .or_insert_with(|| KeyValue::List(VecDeque::new()))
        {
            KeyValue::List(list) => {
                list.push_front(value.to_string());
                list.len()
            }
            other => {
                return Err(BrokerError::WrongType {
                    key: key.to_string(),
                    kind: other.kind_name().to_string(),
                })
            }
        };
        space.record(JournalOp::ListPush {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(len)
    }

    /// All entries of a log, oldest first.
    pub async fn entries(&self, stream: &str) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut space = self.space.lock().await;
        Ok(space
            .log_mut(stream)?
            .map(|log| {
                log.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry {
                        stream: stream.to_string(),
                        id: *id,
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Number of delivered but unacknowledged entries in a group.
    pub async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, BrokerError> {
        let mut space = self.space.lock().await;
        Ok(space
            .log_mut(stream)?
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0))
    }

    /// How many times an entry has been delivered to its group.
    pub async fn delivery_count(&self, stream: &str, group: &str, id: EntryId) -> Result<u32, BrokerError> {
        let mut space = self.space.lock().await;
        Ok(space
            .log_mut(stream)?
            .and_then(|log| log.groups.get(group))
            .and_then(|g| g.pending.get(&id))
            .map(|p| p.deliveries)
            .unwrap_or(0))
    }

    async fn take_new(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut space = self.space.lock().await;

        // A read that fails must not have delivered anything, so every
        // stream is checked before any group moves.
        for stream in streams {
            let has_group = space
                .log_mut(stream)?
                .is_some_and(|log| log.groups.contains_key(group));
            if !has_group {
                return Err(BrokerError::NoSuchGroup {
                    stream: stream.clone(),
                    group: group.to_string(),
                });
            }
        }

        let mut out = Vec::new();
        for stream in streams {
            if out.len() >= count {
                break;
            }
            let Some(log) = space.log_mut(stream)? else {
                continue;
            };
            let Some(g) = log.groups.get(group) else {
                continue;
            };
            let fresh: Vec<StreamEntry> = log
                .entries
                .range((std::ops::Bound::Excluded(g.last_delivered), std::ops::Bound::Unbounded))
                .take(count - out.len())
                .map(|(id, fields)| StreamEntry {
                    stream: stream.clone(),
                    id: *id,
                    fields: fields.clone(),
                })
                .collect();
            out.extend(fresh);
        }

        for entry in &out {
            space.record(JournalOp::Deliver {
                stream: entry.stream.clone(),
                group: group.to_string(),
                consumer: consumer.to_string(),
                id: entry.id,
            })?;
        }
        for entry in &out {
            if let Some(g) = space
                .log_mut(&entry.stream)?
                .and_then(|log| log.groups.get_mut(group))
            {
                g.last_delivered = g.last_delivered.max(entry.id);
                let pending = g.pending.entry(entry.id).or_default();
                pending.consumer = consumer.to_string();
                pending.deliveries += 1;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl LogBroker for MemoryBroker {
    async fn key_kind(&self, key: &str) -> Result<KeyKind, BrokerError> {
        let space = self.space.lock().await;
        Ok(match space.keys.get(key) {
            None => KeyKind::Missing,
            Some(KeyValue::Log(_)) => KeyKind::Log,
            Some(other) => KeyKind::Other(other.kind_name().to_string()),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let mut space = self.space.lock().await;
        let existed = space.keys.remove(key).is_some();
        if existed {
            space.record(JournalOp::Delete {
                key: key.to_string(),
            })?;
        }
        Ok(existed)
    }

    async fn create_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<(), BrokerError> {
        let mut space = self.space.lock().await;
        let log = space.log_or_create(stream)?;
        if log.groups.contains_key(group) {
            return Err(BrokerError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = match start {
            StartFrom::Beginning => EntryId::ZERO,
            StartFrom::NewOnly => log.last_id,
        };
        log.groups.insert(
            group.to_string(),
            ConsumerGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        space.record(JournalOp::CreateGroup {
            stream: stream.to_string(),
            group: group.to_string(),
            last_delivered,
        })?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
        let mut space = self.space.lock().await;
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let log = space.log_or_create(stream)?;
        let id = EntryId::next_after(log.last_id, now_ms);
        log.last_id = id;
        log.entries.insert(id, fields.clone());
        let overflow = self.max_len.and_then(|max| log.overflow_bound(max));
        if let Some(up_to) = overflow {
            let dropped = log.trim_through(up_to);
            tracing::debug!(stream, dropped, "Log over its length cap, oldest entries dropped");
        }
        space.record(JournalOp::Append {
            stream: stream.to_string(),
            id,
            fields,
        })?;
        if let Some(up_to) = overflow {
            space.record(JournalOp::Trim {
                stream: stream.to_string(),
                up_to,
            })?;
        }
        drop(space);

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register interest before looking, so an append between the
            // look and the wait still wakes us.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.take_new(group, consumer, streams, count.max(1)).await?;
            if !entries.is_empty() || block.is_zero() {
                return Ok(entries);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(entries);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut space = self.space.lock().await;
        let mut out = Vec::new();
        for stream in streams {
            let Some(log) = space.log_mut(stream)? else {
                continue;
            };
            let Some(g) = log.groups.get(group) else {
                continue;
            };
            for (id, pending) in &g.pending {
                if out.len() >= count {
                    return Ok(out);
                }
                if pending.consumer != consumer {
                    continue;
                }
                if let Some(fields) = log.entries.get(id) {
                    out.push(StreamEntry {
                        stream: stream.clone(),
                        id: *id,
                        fields: fields.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError> {
        let mut space = self.space.lock().await;
        let Some(log) = space.log_mut(stream)? else {
            return Ok(false);
        };
        let removed = log
            .groups
            .get_mut(group)
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false);
        if !removed {
            return Ok(false);
        }
        let acked_prefix = log.acked_prefix();
        if let Some(up_to) = acked_prefix {
            log.trim_through(up_to);
        }

        space.record(JournalOp::Ack {
            stream: stream.to_string(),
            group: group.to_string(),
            id,
        })?;
        if let Some(up_to) = acked_prefix {
            space.record(JournalOp::Trim {
                stream: stream.to_string(),
                up_to,
            })?;
        }
        Ok(true)
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        let mut space = self.space.lock().await;
        Ok(space.log_mut(stream)?.map(|log| log.entries.len()).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        let sender = {
            let channels = self
                .channels
                .lock()
                .map_err(|_| BrokerError::Unavailable("channel table poisoned".into()))?;
            channels.get(channel).cloned()
        };
        // No subscriber is not an error for pub/sub.
        Ok(sender
            .and_then(|tx| tx.send(payload.to_string()).ok())
            .unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}
