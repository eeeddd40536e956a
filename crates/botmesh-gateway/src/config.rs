//! Gateway configuration, read from TOML.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use botmesh_protocol::{worker_partition, CONSUMER_GROUP, DEFAULT_PARTITION, REMOTE_HUB_PARTITION, VIRTUAL_ID_BASE};
use botmesh_state::LivenessConfig;

use crate::GatewayError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub liveness: LivenessSection,
    pub correlation: CorrelationConfig,
    pub queue: QueueConfig,
    pub broker: BrokerConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Bots and workers together.
    pub max_connections: usize,
    /// Frames buffered per peer before sends start failing.
    pub link_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            max_connections: 1024,
            link_capacity: botmesh_state::LINK_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSection {
    pub sweep_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a relayed action waits for the bot's response.
    pub action_timeout_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            sweep_interval_secs: 10,
            action_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub group: String,
    /// Consumer name inside the group. Must be stable across restarts for
    /// unacknowledged entries to be picked up again.
    pub consumer: String,
    /// Workers that get their own partition.
    pub worker_ids: Vec<String>,
    pub block_secs: u64,
    pub remote_hub_partition: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: CONSUMER_GROUP.into(),
            consumer: default_consumer_name(),
            worker_ids: Vec::new(),
            block_secs: 30,
            remote_hub_partition: REMOTE_HUB_PARTITION.into(),
        }
    }
}

impl QueueConfig {
    /// The default partition followed by one partition per worker.
    pub fn partitions(&self) -> Vec<String> {
        let mut partitions = vec![DEFAULT_PARTITION.to_string()];
        for id in &self.worker_ids {
            let p = worker_partition(id);
            if !partitions.contains(&p) {
                partitions.push(p);
            }
        }
        partitions
    }
}

fn default_consumer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .map(|h| format!("gateway-{h}"))
        .unwrap_or_else(|| "gateway".into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Journal file for the log broker. Without one, queued entries do not
    /// survive a restart.
    pub journal_path: Option<PathBuf>,
    /// Entries kept per log before the oldest are dropped. Bounds the remote
    /// hub partition, which this gateway never consumes.
    pub max_len: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            max_len: Some(100_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub virtual_id_base: i64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            virtual_id_base: VIRTUAL_ID_BASE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

impl GatewayConfig {
    /// `~/.config/botmesh/gateway.toml` (platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("botmesh").join("gateway.toml"))
    }

    /// Load from `path`, or from the default path if it exists, or fall back
    /// to defaults. An explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };
        let config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(&p)
                    .map_err(|e| anyhow::anyhow!("reading {}: {e}", p.display()))?;
                let config = Self::from_toml_str(&text)
                    .map_err(|e| anyhow::anyhow!("{}: {e}", p.display()))?;
                tracing::debug!(path = %p.display(), "Loaded gateway config");
                config
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, GatewayError> {
        toml::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let nonzero = [
            ("liveness.sweep_interval_secs", self.liveness.sweep_interval_secs),
            ("liveness.timeout_secs", self.liveness.timeout_secs),
            ("correlation.ttl_secs", self.correlation.ttl_secs),
            ("correlation.sweep_interval_secs", self.correlation.sweep_interval_secs),
            ("correlation.action_timeout_secs", self.correlation.action_timeout_secs),
            ("queue.block_secs", self.queue.block_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(GatewayError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.liveness.timeout_secs < self.liveness.sweep_interval_secs {
            return Err(GatewayError::Config(
                "liveness.timeout_secs must not be smaller than liveness.sweep_interval_secs".into(),
            ));
        }
        if self.server.max_connections == 0 || self.server.link_capacity == 0 {
            return Err(GatewayError::Config(
                "server.max_connections and server.link_capacity must be positive".into(),
            ));
        }
        if self.queue.group.is_empty() || self.queue.consumer.is_empty() {
            return Err(GatewayError::Config("queue.group and queue.consumer must be set".into()));
        }
        if self.queue.partitions().contains(&self.queue.remote_hub_partition) {
            return Err(GatewayError::Config(format!(
                "queue.remote_hub_partition '{}' would be consumed by this gateway",
                self.queue.remote_hub_partition
            )));
        }
        Ok(())
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            sweep_interval: Duration::from_secs(self.liveness.sweep_interval_secs),
            timeout: Duration::from_secs(self.liveness.timeout_secs),
            correlation_ttl: Duration::from_secs(self.correlation.ttl_secs),
            correlation_sweep_interval: Duration::from_secs(self.correlation.sweep_interval_secs),
        }
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.correlation.action_timeout_secs)
    }
}
