//! The broker contract: append-only partitions ("logs") read through
//! consumer groups, plus fire-and-forget pub/sub channels.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::BrokerError;

/// Entry identifier: milliseconds since the epoch plus a sequence number for
/// entries appended within the same millisecond. Totally ordered per log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `last` at time `now_ms`.
    pub fn next_after(last: EntryId, now_ms: u64) -> Self {
        if now_ms > last.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        let ms = ms.parse().map_err(|_| BrokerError::InvalidId(s.to_string()))?;
        let seq = seq.parse().map_err(|_| BrokerError::InvalidId(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

impl TryFrom<String> for EntryId {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.to_string()
    }
}

/// Field map of one log entry.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: EntryId,
    pub fields: Fields,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// What a key currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Missing,
    Log,
    /// Any other structure, named by its type ("list", ...).
    Other(String),
}

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Every entry already in the log is delivered.
    Beginning,
    /// Only entries appended after group creation are delivered.
    NewOnly,
}

#[async_trait]
pub trait LogBroker: Send + Sync {
    async fn key_kind(&self, key: &str) -> Result<KeyKind, BrokerError>;

    /// Remove a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, BrokerError>;

    /// Create a consumer group, creating the log if it is missing.
    /// Fails with [`BrokerError::GroupExists`] if the group is already there
    /// and [`BrokerError::WrongType`] if the key is not a log.
    async fn create_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<(), BrokerError>;

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError>;

    /// Read entries never delivered to `group` before (`>` semantics), across
    /// `streams` in order, at most `count` in total. Waits up to `block` for
    /// new entries when none are available; `Duration::ZERO` never waits.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Entries delivered to `consumer` and not yet acknowledged.
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledge an entry. Returns false if it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError>;

    async fn len(&self, stream: &str) -> Result<usize, BrokerError>;

    /// Publish on a channel. Returns the number of live subscribers reached.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_parse_and_display() {
        let id: EntryId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("42".parse::<EntryId>().unwrap(), EntryId::new(42, 0));
        assert!("x-1".parse::<EntryId>().is_err());
    }

    #[test]
    fn next_after_is_strictly_increasing() {
        let a = EntryId::new(100, 0);
        assert_eq!(EntryId::next_after(a, 100), EntryId::new(100, 1));
        assert_eq!(EntryId::next_after(a, 99), EntryId::new(100, 1));
        assert_eq!(EntryId::next_after(a, 101), EntryId::new(101, 0));
    }
}
