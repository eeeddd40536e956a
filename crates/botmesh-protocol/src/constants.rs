//! Names shared by every component that talks to peers or to the log.

/// Default log partition consumed by every gateway.
pub const DEFAULT_PARTITION: &str = "queue:default";

/// Prefix of the per-worker log partitions (`queue:worker:<id>`).
pub const WORKER_PARTITION_PREFIX: &str = "queue:worker:";

/// Partition that receives actions the gateway could not deliver directly.
/// Never consumed by the gateway itself.
pub const REMOTE_HUB_PARTITION: &str = "queue:remote_hub";

/// Consumer group shared by all gateway consumers.
pub const CONSUMER_GROUP: &str = "group:workers";

/// Pub/sub channel carrying worker capability announcements.
pub const WORKER_REGISTER_CHANNEL: &str = "worker:register";

/// Pub/sub channel carrying asynchronous skill outcomes.
pub const SKILL_RESULT_CHANNEL: &str = "worker:skill_result";

/// Handshake headers.
pub const HEADER_SELF_ID: &str = "x-self-id";
pub const HEADER_PLATFORM: &str = "x-platform";
pub const HEADER_PROTOCOL: &str = "x-protocol";
pub const HEADER_WORKER_ID: &str = "x-worker-id";
pub const HEADER_CLIENT_ROLE: &str = "x-client-role";

/// Platform assumed when a bot does not announce one.
pub const DEFAULT_PLATFORM: &str = "qq";

/// First numeric identity handed out to platforms with opaque user IDs.
pub const VIRTUAL_ID_BASE: i64 = 980_000_000_000;

/// Retcodes used in structured failure responses.
pub const RETCODE_OK: i64 = 0;
pub const RETCODE_ASYNC: i64 = 1;
pub const RETCODE_BAD_REQUEST: i64 = 1400;
pub const RETCODE_NOT_FOUND: i64 = 1404;
pub const RETCODE_TIMEOUT: i64 = 1408;
pub const RETCODE_INTERNAL: i64 = 1500;

/// Log partition for a worker ID.
pub fn worker_partition(worker_id: &str) -> String {
    format!("{WORKER_PARTITION_PREFIX}{worker_id}")
}
