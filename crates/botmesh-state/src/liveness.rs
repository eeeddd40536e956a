//! Periodic sweep that evicts silent peers, expires abandoned correlations
//! and rolls daily traffic counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::registry::{PeerKind, Registry};
use crate::stats::DisconnectReason;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub sweep_interval: Duration,
    /// Silence after which a peer is evicted.
    pub timeout: Duration,
    pub correlation_ttl: Duration,
    pub correlation_sweep_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
            correlation_ttl: Duration::from_secs(60),
            correlation_sweep_interval: Duration::from_secs(10),
        }
    }
}

/// One peer removed by a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub kind: PeerKind,
    pub peer_id: String,
    pub duration_secs: f64,
}

pub struct LivenessMonitor {
    registry: Arc<Registry>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<Registry>, config: LivenessConfig) -> Self {
        Self { registry, config }
    }

    /// Evict every peer silent for longer than the timeout as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<Eviction> {
        let timeout_secs = self.config.timeout.as_secs() as i64;
        let mut evicted = Vec::new();

        for stale in self.registry.stale_peers(now, timeout_secs).await {
            // Re-checked by connection id: the peer may have reconnected
            // since the scan.
            let removed = self
                .registry
                .remove_connection(
                    stale.kind,
                    &stale.id,
                    stale.connection_id,
                    DisconnectReason::HeartbeatTimeout,
                    now,
                )
                .await;
            if let Some(duration_secs) = removed {
                tracing::warn!(
                    kind = %stale.kind,
                    peer = %stale.id,
                    last_seen = %stale.last_seen,
                    duration_secs,
                    "Evicted peer after heartbeat timeout"
                );
                evicted.push(Eviction {
                    kind: stale.kind,
                    peer_id: stale.id,
                    duration_secs,
                });
            }
        }
        evicted
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut peer_sweep = tokio::time::interval(self.config.sweep_interval);
        let mut correlation_sweep = tokio::time::interval(self.config.correlation_sweep_interval);
        let mut day_check = tokio::time::interval(Duration::from_secs(60));

        tracing::info!(
            sweep_secs = self.config.sweep_interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Liveness monitor started"
        );

        loop {
            tokio::select! {
                _ = peer_sweep.tick() => {
                    self.sweep(Utc::now()).await;
                }
                _ = correlation_sweep.tick() => {
                    let expired = self
                        .registry
                        .pending()
                        .sweep_expired(self.config.correlation_ttl)
                        .await;
                    if expired > 0 {
                        tracing::debug!(expired, "Expired pending correlations");
                    }
                }
                _ = day_check.tick() => {
                    let today = chrono::Local::now().date_naive();
                    if self.registry.roll_day(today).await {
                        tracing::info!(day = %today, "Daily traffic counters reset");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Liveness monitor stopped");
    }
}
