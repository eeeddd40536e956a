//! Observational counters: connection lifetimes, disconnect reasons and
//! per-entity traffic. Nothing here feeds back into routing.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Samples kept per worker for RTT and processing-time averages.
pub const SAMPLE_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    HeartbeatTimeout,
    SocketError,
    ClientClosed,
    /// A newer connection registered under the same peer id.
    Superseded,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SocketError => "socket_error",
            Self::ClientClosed => "client_closed",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded sliding window of millisecond samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(SAMPLE_WINDOW)
    }
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, sample_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms.max(0.0));
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Lifetime totals for one peer id across all its connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerDurations {
    pub sessions: u64,
    pub total_secs: f64,
    pub last_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Keyed by `<kind>:<id>`.
    pub durations: HashMap<String, PeerDurations>,
    pub disconnects: BTreeMap<DisconnectReason, u64>,
    pub last_activity: HashMap<String, DateTime<Utc>>,
}

impl ConnectionStats {
    pub fn record_disconnect(&mut self, peer_key: &str, reason: DisconnectReason, duration_secs: f64) {
        let duration_secs = duration_secs.max(0.0);
        let entry = self.durations.entry(peer_key.to_string()).or_default();
        entry.sessions += 1;
        entry.total_secs += duration_secs;
        entry.last_secs = duration_secs;
        *self.disconnects.entry(reason).or_insert(0) += 1;
    }

    pub fn touch(&mut self, peer_key: &str, at: DateTime<Utc>) {
        self.last_activity.insert(peer_key.to_string(), at);
    }

    pub fn disconnect_count(&self, reason: DisconnectReason) -> u64 {
        self.disconnects.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_disconnects(&self) -> u64 {
        self.disconnects.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatScope {
    Bot,
    Group,
    Worker,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounter {
    pub today: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    pub scope: StatScope,
    pub id: String,
    pub today: u64,
    pub total: u64,
}

/// Message counters per bot, group and worker, split into today and
/// all-time. Rolling the day zeroes `today` and keeps `total`.
#[derive(Debug, Clone)]
pub struct TrafficStats {
    day: NaiveDate,
    counters: HashMap<(StatScope, String), DailyCounter>,
}

impl TrafficStats {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            counters: HashMap::new(),
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn increment(&mut self, scope: StatScope, id: &str, amount: u64) {
        if id.is_empty() {
            return;
        }
        let counter = self.counters.entry((scope, id.to_string())).or_default();
        counter.today += amount;
        counter.total += amount;
    }

    pub fn get(&self, scope: StatScope, id: &str) -> DailyCounter {
        self.counters
            .get(&(scope, id.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Move to `today`. Returns true if the date changed and daily counters
    /// were reset.
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if today == self.day {
            return false;
        }
        self.day = today;
        for counter in self.counters.values_mut() {
            counter.today = 0;
        }
        true
    }

    pub fn snapshot(&self) -> Vec<TrafficEntry> {
        let mut entries: Vec<TrafficEntry> = self
            .counters
            .iter()
            .map(|((scope, id), c)| TrafficEntry {
                scope: *scope,
                id: id.clone(),
                today: c.today,
                total: c.total,
            })
            .collect();
        entries.sort_by(|a, b| (a.scope, &a.id).cmp(&(b.scope, &b.id)));
        entries
    }
}
