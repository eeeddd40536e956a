//! Live bot and worker connections, plus the state that hangs off them:
//! pending correlations, connection stats and traffic counters.
//!
//! One lock per collection. No lock is held across a socket write: callers
//! get a cloned [`PeerLink`] out of the registry and send on it afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use botmesh_protocol::{Capability, Dialect};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::correlation::PendingCorrelations;
use crate::link::PeerLink;
use crate::stats::{
    ConnectionStats, DisconnectReason, SampleWindow, StatScope, TrafficEntry, TrafficStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Bot,
    Worker,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bot => write!(f, "bot"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Key under which a peer's stats are filed.
pub fn peer_key(kind: PeerKind, id: &str) -> String {
    format!("{kind}:{id}")
}

fn elapsed_secs(since: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
    ((until - since).num_milliseconds().max(0)) as f64 / 1000.0
}

/// One live adapter connection.
#[derive(Debug, Clone)]
pub struct BotPeer {
    pub self_id: String,
    pub platform: String,
    pub dialect: Dialect,
    pub link: PeerLink,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Frames sent to the bot during this session.
    pub sent: u64,
    /// Frames received from the bot during this session.
    pub received: u64,
}

impl BotPeer {
    pub fn new(self_id: &str, platform: &str, dialect: Dialect, link: PeerLink) -> Self {
        Self {
            self_id: self_id.to_string(),
            platform: platform.to_string(),
            dialect,
            link,
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            last_heartbeat_at: None,
            sent: 0,
            received: 0,
        }
    }
}

/// One live business-logic connection.
#[derive(Debug, Clone)]
pub struct WorkerPeer {
    pub worker_id: String,
    pub dialect: Dialect,
    pub link: PeerLink,
    /// Replaced wholesale on every announcement.
    pub capabilities: Arc<Vec<Capability>>,
    pub rtt: SampleWindow,
    pub processing: SampleWindow,
    pub handled_count: u64,
    pub last_event_forwarded_at: Option<DateTime<Utc>>,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl WorkerPeer {
    pub fn new(worker_id: &str, dialect: Dialect, link: PeerLink) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            dialect,
            link,
            capabilities: Arc::new(Vec::new()),
            rtt: SampleWindow::default(),
            processing: SampleWindow::default(),
            handled_count: 0,
            last_event_forwarded_at: None,
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            last_heartbeat_at: None,
        }
    }
}

/// What a sender needs to reach a bot.
#[derive(Debug, Clone)]
pub struct BotRoute {
    pub self_id: String,
    pub platform: String,
    pub dialect: Dialect,
    pub link: PeerLink,
}

#[derive(Debug, Clone)]
pub struct WorkerRoute {
    pub worker_id: String,
    pub dialect: Dialect,
    pub link: PeerLink,
}

/// A peer whose last sign of life is older than the liveness timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct StalePeer {
    pub kind: PeerKind,
    pub id: String,
    pub connection_id: Uuid,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSummary {
    pub self_id: String,
    pub platform: String,
    pub dialect: Dialect,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub dialect: Dialect,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub handled_count: u64,
    pub avg_rtt_ms: Option<f64>,
    pub avg_processing_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub bots: Vec<BotSummary>,
    pub workers: Vec<WorkerSummary>,
}

pub struct Registry {
    bots: RwLock<HashMap<String, BotPeer>>,
    workers: RwLock<HashMap<String, WorkerPeer>>,
    stats: RwLock<ConnectionStats>,
    traffic: RwLock<TrafficStats>,
    /// Platform and bot id of the most recent inbound bot traffic.
    last_observed: RwLock<Option<(String, String)>>,
    pending: PendingCorrelations,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            bots: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            stats: RwLock::new(ConnectionStats::default()),
            traffic: RwLock::new(TrafficStats::new(chrono::Local::now().date_naive())),
            last_observed: RwLock::new(None),
            pending: PendingCorrelations::new(),
        }
    }

    pub fn pending(&self) -> &PendingCorrelations {
        &self.pending
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a bot. An existing entry under the same id is closed and
    /// replaced.
    pub async fn register_bot(&self, peer: BotPeer) -> Uuid {
        let self_id = peer.self_id.clone();
        let platform = peer.platform.clone();
        let connection_id = peer.connection_id;
        let key = peer_key(PeerKind::Bot, &self_id);

        let previous = self.bots.write().await.insert(self_id.clone(), peer);
        let now = Utc::now();
        if let Some(old) = previous {
            self.record_disconnect(&key, DisconnectReason::Superseded, old.connected_at, now)
                .await;
            old.link.close(DisconnectReason::Superseded.as_str());
            tracing::info!(self_id = %self_id, "Bot connection superseded by a new one");
        }
        self.stats.write().await.touch(&key, now);
        tracing::info!(self_id = %self_id, platform = %platform, "Bot registered");
        connection_id
    }

    pub async fn register_worker(&self, peer: WorkerPeer) -> Uuid {
        let worker_id = peer.worker_id.clone();
        let connection_id = peer.connection_id;
        let key = peer_key(PeerKind::Worker, &worker_id);

        let previous = self.workers.write().await.insert(worker_id.clone(), peer);
        let now = Utc::now();
        if let Some(old) = previous {
            self.record_disconnect(&key, DisconnectReason::Superseded, old.connected_at, now)
                .await;
            old.link.close(DisconnectReason::Superseded.as_str());
            tracing::info!(worker_id = %worker_id, "Worker connection superseded by a new one");
        }
        self.stats.write().await.touch(&key, now);
        tracing::info!(worker_id = %worker_id, "Worker registered");
        connection_id
    }

    /// Replace a worker's declared capabilities. Returns false if the worker
    /// is not connected here.
    pub async fn set_capabilities(&self, worker_id: &str, capabilities: Vec<Capability>) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(w) => {
                w.capabilities = Arc::new(capabilities);
                true
            }
            None => false,
        }
    }

    // ── Removal ──────────────────────────────────────────────────────────────

    /// Remove a peer, record why, then close its link. Returns the
    /// connection duration in seconds if the peer was registered.
    pub async fn remove(&self, kind: PeerKind, id: &str, reason: DisconnectReason) -> Option<f64> {
        self.remove_inner(kind, id, None, reason, Utc::now()).await
    }

    /// Like [`Registry::remove`], but only if the registered connection is
    /// still `connection_id`. A socket that closes after being superseded
    /// must not take its replacement down with it.
    pub async fn remove_connection(
        &self,
        kind: PeerKind,
        id: &str,
        connection_id: Uuid,
        reason: DisconnectReason,
        at: DateTime<Utc>,
    ) -> Option<f64> {
        self.remove_inner(kind, id, Some(connection_id), reason, at).await
    }

    async fn remove_inner(
        &self,
        kind: PeerKind,
        id: &str,
        connection_id: Option<Uuid>,
        reason: DisconnectReason,
        at: DateTime<Utc>,
    ) -> Option<f64> {
        let matches = |conn: Uuid| connection_id.map_or(true, |c| c == conn);
        let (link, connected_at) = match kind {
            PeerKind::Bot => {
                let mut bots = self.bots.write().await;
                if !bots.get(id).is_some_and(|p| matches(p.connection_id)) {
                    return None;
                }
                let peer = bots.remove(id)?;
                (peer.link, peer.connected_at)
            }
            PeerKind::Worker => {
                let mut workers = self.workers.write().await;
                if !workers.get(id).is_some_and(|p| matches(p.connection_id)) {
                    return None;
                }
                let peer = workers.remove(id)?;
                (peer.link, peer.connected_at)
            }
        };

        let secs = self
            .record_disconnect(&peer_key(kind, id), reason, connected_at, at)
            .await;
        link.close(reason.as_str());
        tracing::info!(kind = %kind, peer = %id, reason = %reason, duration_secs = secs, "Peer removed");
        Some(secs)
    }

    async fn record_disconnect(
        &self,
        key: &str,
        reason: DisconnectReason,
        connected_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> f64 {
        let secs = elapsed_secs(connected_at, at);
        self.stats.write().await.record_disconnect(key, reason, secs);
        secs
    }

    /// Close and drop every peer, e.g. on shutdown.
    pub async fn clear(&self, reason: DisconnectReason) -> usize {
        let bot_ids: Vec<String> = self.bots.read().await.keys().cloned().collect();
        let worker_ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        let mut removed = 0;
        for id in bot_ids {
            removed += self.remove(PeerKind::Bot, &id, reason).await.is_some() as usize;
        }
        for id in worker_ids {
            removed += self.remove(PeerKind::Worker, &id, reason).await.is_some() as usize;
        }
        removed
    }

    // ── Liveness ─────────────────────────────────────────────────────────────

    pub async fn touch_heartbeat(&self, kind: PeerKind, id: &str) -> bool {
        let now = Utc::now();
        let found = match kind {
            PeerKind::Bot => self
                .bots
                .write()
                .await
                .get_mut(id)
                .map(|p| p.last_heartbeat_at = Some(now))
                .is_some(),
            PeerKind::Worker => self
                .workers
                .write()
                .await
                .get_mut(id)
                .map(|p| p.last_heartbeat_at = Some(now))
                .is_some(),
        };
        if found {
            self.stats.write().await.touch(&peer_key(kind, id), now);
        }
        found
    }

    /// Peers whose last heartbeat (or connection time, if they never sent
    /// one) is more than `timeout_secs` before `now`.
    pub async fn stale_peers(&self, now: DateTime<Utc>, timeout_secs: i64) -> Vec<StalePeer> {
        let cutoff = now - chrono::Duration::seconds(timeout_secs);
        let mut stale = Vec::new();
        for p in self.bots.read().await.values() {
            let last_seen = p.last_heartbeat_at.unwrap_or(p.connected_at);
            if last_seen < cutoff {
                stale.push(StalePeer {
                    kind: PeerKind::Bot,
                    id: p.self_id.clone(),
                    connection_id: p.connection_id,
                    last_seen,
                });
            }
        }
        for p in self.workers.read().await.values() {
            let last_seen = p.last_heartbeat_at.unwrap_or(p.connected_at);
            if last_seen < cutoff {
                stale.push(StalePeer {
                    kind: PeerKind::Worker,
                    id: p.worker_id.clone(),
                    connection_id: p.connection_id,
                    last_seen,
                });
            }
        }
        stale
    }

    // ── Traffic bookkeeping ──────────────────────────────────────────────────

    /// An inbound frame from a bot.
    pub async fn note_bot_received(&self, self_id: &str, platform: &str) {
        let now = Utc::now();
        if let Some(p) = self.bots.write().await.get_mut(self_id) {
            p.received += 1;
        }
        *self.last_observed.write().await = Some((platform.to_string(), self_id.to_string()));
        self.stats
            .write()
            .await
            .touch(&peer_key(PeerKind::Bot, self_id), now);
    }

    pub async fn note_bot_sent(&self, self_id: &str) {
        if let Some(p) = self.bots.write().await.get_mut(self_id) {
            p.sent += 1;
        }
    }

    /// An event was forwarded to a worker. Starts the processing clock.
    pub async fn note_event_forwarded(&self, worker_id: &str, at: DateTime<Utc>) {
        if let Some(w) = self.workers.write().await.get_mut(worker_id) {
            w.handled_count += 1;
            w.last_event_forwarded_at = Some(at);
        }
        self.count_traffic(StatScope::Worker, worker_id).await;
    }

    /// A worker sent an action. Closes the processing clock, if running.
    pub async fn note_worker_action(&self, worker_id: &str, at: DateTime<Utc>) {
        let now = Utc::now();
        if let Some(w) = self.workers.write().await.get_mut(worker_id) {
            if let Some(forwarded) = w.last_event_forwarded_at.take() {
                w.processing
                    .push((at - forwarded).num_milliseconds().max(0) as f64);
            }
        }
        self.stats
            .write()
            .await
            .touch(&peer_key(PeerKind::Worker, worker_id), now);
    }

    pub async fn record_rtt(&self, worker_id: &str, rtt_ms: f64) {
        if let Some(w) = self.workers.write().await.get_mut(worker_id) {
            w.rtt.push(rtt_ms);
        }
    }

    pub async fn count_traffic(&self, scope: StatScope, id: &str) {
        self.traffic.write().await.increment(scope, id, 1);
    }

    pub async fn roll_day(&self, today: NaiveDate) -> bool {
        self.traffic.write().await.roll_day(today)
    }

    pub async fn last_observed(&self) -> Option<(String, String)> {
        self.last_observed.read().await.clone()
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    /// Find a bot for an outbound action: by id if given, else the first bot
    /// on `platform`, else the only bot connected.
    pub async fn find_bot(&self, self_id: Option<&str>, platform: Option<&str>) -> Option<BotRoute> {
        let bots = self.bots.read().await;
        let route = |p: &BotPeer| BotRoute {
            self_id: p.self_id.clone(),
            platform: p.platform.clone(),
            dialect: p.dialect,
            link: p.link.clone(),
        };

        if let Some(id) = self_id {
            return bots.get(id).map(route);
        }
        if let Some(platform) = platform {
            let mut on_platform: Vec<&BotPeer> =
                bots.values().filter(|p| p.platform == platform).collect();
            on_platform.sort_by(|a, b| a.self_id.cmp(&b.self_id));
            if let Some(p) = on_platform.first() {
                return Some(route(p));
            }
        }
        if bots.len() == 1 {
            return bots.values().next().map(route);
        }
        None
    }

    pub async fn worker_route(&self, worker_id: &str) -> Option<WorkerRoute> {
        self.workers.read().await.get(worker_id).map(|w| WorkerRoute {
            worker_id: w.worker_id.clone(),
            dialect: w.dialect,
            link: w.link.clone(),
        })
    }

    /// Connected worker ids, sorted.
    pub async fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every worker's capability list, sorted by worker id.
    pub async fn worker_capabilities(&self) -> Vec<(String, Arc<Vec<Capability>>)> {
        let mut caps: Vec<(String, Arc<Vec<Capability>>)> = self
            .workers
            .read()
            .await
            .values()
            .map(|w| (w.worker_id.clone(), Arc::clone(&w.capabilities)))
            .collect();
        caps.sort_by(|a, b| a.0.cmp(&b.0));
        caps
    }

    pub async fn bot_count(&self) -> usize {
        self.bots.read().await.len()
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    // ── Observation ──────────────────────────────────────────────────────────

    pub async fn list(&self) -> RegistrySnapshot {
        let mut bots: Vec<BotSummary> = self
            .bots
            .read()
            .await
            .values()
            .map(|p| BotSummary {
                self_id: p.self_id.clone(),
                platform: p.platform.clone(),
                dialect: p.dialect,
                connected_at: p.connected_at,
                last_heartbeat_at: p.last_heartbeat_at,
                sent: p.sent,
                received: p.received,
            })
            .collect();
        bots.sort_by(|a, b| a.self_id.cmp(&b.self_id));

        let mut workers: Vec<WorkerSummary> = self
            .workers
            .read()
            .await
            .values()
            .map(|w| WorkerSummary {
                worker_id: w.worker_id.clone(),
                dialect: w.dialect,
                capabilities: w.capabilities.iter().map(|c| c.name.clone()).collect(),
                connected_at: w.connected_at,
                last_heartbeat_at: w.last_heartbeat_at,
                handled_count: w.handled_count,
                avg_rtt_ms: w.rtt.average(),
                avg_processing_ms: w.processing.average(),
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        RegistrySnapshot { bots, workers }
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.stats.read().await.clone()
    }

    pub async fn traffic(&self) -> Vec<TrafficEntry> {
        self.traffic.read().await.snapshot()
    }
}
