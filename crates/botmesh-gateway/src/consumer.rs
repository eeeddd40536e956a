//! Consumer-group reader over the durable log.
//!
//! Each entry runs in its own task. Entries are acknowledged once handled,
//! including malformed ones and ones whose handler panicked; only transient
//! failures leave an entry pending for redelivery.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;

use botmesh_broker::{BrokerError, KeyKind, LogBroker, StartFrom, StreamEntry};
use botmesh_protocol::{EntryKind, QueueEntry, SkillResult, SkillStatus, SKILL_RESULT_CHANNEL};

use crate::config::QueueConfig;
use crate::dispatch::Dispatcher;
use crate::skills::SkillRegistry;
use crate::DispatchError;

const PENDING_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    pub consumer: String,
    pub partitions: Vec<String>,
    pub block: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl ConsumerConfig {
    pub fn from_queue(queue: &QueueConfig) -> Self {
        Self {
            group: queue.group.clone(),
            consumer: queue.consumer.clone(),
            partitions: queue.partitions(),
            block: Duration::from_secs(queue.block_secs),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Processed,
    /// Could not be decoded or dispatched. Acknowledged and dropped.
    Rejected(String),
    /// The handler panicked. Acknowledged so it is not redelivered forever.
    Panicked,
    /// Left pending for redelivery.
    Retry(String),
}

/// Delay before retry number `attempt` (1-based): exponential from `base`,
/// capped at `max`, plus up to a quarter of jitter.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let scaled = base.saturating_mul(1u32 << exponent).min(max);
    let spread = u64::try_from(scaled.as_millis() / 4).unwrap_or(u64::MAX);
    let jitter = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    (scaled + Duration::from_millis(jitter)).min(max)
}

#[derive(Clone)]
pub struct QueueConsumer {
    broker: Arc<dyn LogBroker>,
    dispatcher: Dispatcher,
    skills: Arc<SkillRegistry>,
    config: Arc<ConsumerConfig>,
}

impl QueueConsumer {
    pub fn new(
        broker: Arc<dyn LogBroker>,
        dispatcher: Dispatcher,
        skills: Arc<SkillRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            skills,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Make every partition a log with our consumer group on it. A key still
    /// holding a pre-log structure is deleted first.
    pub async fn ensure_groups(&self) -> Result<(), BrokerError> {
        for partition in &self.config.partitions {
            if let KeyKind::Other(kind) = self.broker.key_kind(partition).await? {
                tracing::warn!(
                    partition = %partition,
                    kind = %kind,
                    "Partition holds a legacy structure, replacing it with a log"
                );
                self.broker.delete(partition).await?;
            }
            match self
                .broker
                .create_group(partition, &self.config.group, StartFrom::Beginning)
                .await
            {
                Ok(()) => tracing::info!(
                    partition = %partition,
                    group = %self.config.group,
                    "Consumer group created"
                ),
                Err(BrokerError::GroupExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Consume until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        loop {
            match self.ensure_groups().await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, attempt);
                    tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Failed to prepare consumer groups");
                    if self.pause(delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }

        tracing::info!(
            group = %self.config.group,
            consumer = %self.config.consumer,
            partitions = ?self.config.partitions,
            "Queue consumer started"
        );
        self.drain_pending().await;

        let mut failures = 0u32;
        loop {
            let read = tokio::select! {
                read = self.broker.read_group(
                    &self.config.group,
                    &self.config.consumer,
                    &self.config.partitions,
                    1,
                    self.config.block,
                ) => read,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match read {
                Ok(entries) => {
                    failures = 0;
                    for entry in entries {
                        let this = self.clone();
                        tokio::spawn(async move {
                            this.process_entry(&entry).await;
                        });
                    }
                }
                Err(e) => {
                    failures += 1;
                    if matches!(e, BrokerError::NoSuchGroup { .. }) {
                        if let Err(e) = self.ensure_groups().await {
                            tracing::warn!(error = %e, "Failed to recreate consumer groups");
                        }
                    }
                    let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, failures);
                    tracing::warn!(error = %e, attempt = failures, delay_ms = delay.as_millis() as u64, "Queue read failed");
                    if self.pause(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("Queue consumer stopped");
    }

    /// Sleep for `delay`. Returns true if shutdown was requested meanwhile.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    /// Re-handle entries delivered to this consumer before a restart and
    /// never acknowledged.
    pub async fn drain_pending(&self) -> usize {
        let entries = match self
            .broker
            .read_pending(&self.config.group, &self.config.consumer, &self.config.partitions, PENDING_BATCH)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read pending entries");
                return 0;
            }
        };
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Replaying unacknowledged entries");
        }
        for entry in &entries {
            self.process_entry(entry).await;
        }
        entries.len()
    }

    /// Handle one entry and acknowledge it unless it should be retried.
    pub async fn process_entry(&self, entry: &StreamEntry) -> EntryOutcome {
        let outcome = match AssertUnwindSafe(self.handle_entry(entry)).catch_unwind().await {
            Ok(Ok(())) => EntryOutcome::Processed,
            Ok(Err(e)) if e.is_transient() => EntryOutcome::Retry(e.to_string()),
            Ok(Err(e)) => EntryOutcome::Rejected(e.to_string()),
            Err(_) => EntryOutcome::Panicked,
        };

        match &outcome {
            EntryOutcome::Processed => {
                tracing::debug!(stream = %entry.stream, entry = %entry.id, "Queue entry processed");
            }
            EntryOutcome::Rejected(reason) => {
                tracing::warn!(stream = %entry.stream, entry = %entry.id, reason = %reason, "Dropping queue entry");
            }
            EntryOutcome::Panicked => {
                tracing::error!(stream = %entry.stream, entry = %entry.id, "Queue entry handler panicked");
            }
            EntryOutcome::Retry(reason) => {
                tracing::warn!(stream = %entry.stream, entry = %entry.id, reason = %reason, "Queue entry left pending");
                return outcome;
            }
        }

        if let Err(e) = self.broker.ack(&entry.stream, &self.config.group, entry.id).await {
            tracing::warn!(stream = %entry.stream, entry = %entry.id, error = %e, "Failed to acknowledge entry");
        }
        outcome
    }

    async fn handle_entry(&self, entry: &StreamEntry) -> Result<(), DispatchError> {
        let queued = QueueEntry::from_fields(&entry.fields)?;
        match queued.kind {
            EntryKind::SkillCall => self.run_skill(queued).await,
            EntryKind::Control => {
                tracing::info!(
                    stream = %entry.stream,
                    action = queued.action.as_deref().unwrap_or(""),
                    "Control entry received"
                );
                Ok(())
            }
            EntryKind::Event => {
                let payload = queued
                    .payload
                    .as_ref()
                    .ok_or_else(|| DispatchError::Malformed("entry has no payload".into()))?;
                let outcome = self.dispatcher.dispatch_internal_event(payload).await?;
                tracing::debug!(stream = %entry.stream, outcome = ?outcome, "Queue entry dispatched");
                Ok(())
            }
        }
    }

    async fn run_skill(&self, queued: QueueEntry) -> Result<(), DispatchError> {
        let skill = queued.skill.clone().unwrap_or_default();
        let (status, result, error) = match self.skills.get(&skill).await {
            Some(handler) => match handler.handle(&queued.params).await {
                Ok(result) => (SkillStatus::Succeeded, result, None),
                Err(e) => (SkillStatus::Failed, String::new(), Some(e)),
            },
            None => (
                SkillStatus::Failed,
                String::new(),
                Some(format!("unknown skill '{skill}'")),
            ),
        };

        let report = SkillResult {
            task_id: queued.task_id,
            execution_id: queued.execution_id,
            worker_id: if queued.worker_id.is_empty() {
                self.config.consumer.clone()
            } else {
                queued.worker_id
            },
            skill,
            status,
            result,
            error,
            timestamp: Utc::now().timestamp(),
        };
        self.report_skill_result(&report).await
    }

    /// Publish on the result channel; if that fails, push the result to the
    /// connected workers directly.
    async fn report_skill_result(&self, report: &SkillResult) -> Result<(), DispatchError> {
        let payload = serde_json::to_string(report).map_err(botmesh_protocol::ProtocolError::from)?;
        match self.broker.publish(SKILL_RESULT_CHANNEL, &payload).await {
            Ok(subscribers) => {
                tracing::debug!(skill = %report.skill, subscribers, "Skill result published");
            }
            Err(e) => {
                let mut frame = serde_json::to_value(report).map_err(botmesh_protocol::ProtocolError::from)?;
                if let Value::Object(map) = &mut frame {
                    map.insert("type".into(), Value::from("skill_result"));
                }
                let reached = self.dispatcher.broadcast_to_workers(&frame).await;
                tracing::warn!(error = %e, reached, "Skill result channel unavailable, sent to workers directly");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        let first = backoff_delay(base, max, 1);
        assert!(first >= base && first <= Duration::from_millis(125));
        let third = backoff_delay(base, max, 3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[test]
    fn zero_base_has_no_jitter() {
        assert_eq!(backoff_delay(Duration::ZERO, Duration::from_secs(1), 3), Duration::ZERO);
    }
}
