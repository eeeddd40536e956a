use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The key exists but holds something other than a log.
    #[error("key '{key}' holds a {kind}, not a log")]
    WrongType { key: String, kind: String },

    /// `create_group` on a group that already exists.
    #[error("consumer group '{group}' already exists on '{stream}'")]
    GroupExists { stream: String, group: String },

    #[error("no consumer group '{group}' on '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("invalid entry id '{0}'")]
    InvalidId(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Errors worth retrying after a pause, as opposed to caller mistakes.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_) | Self::Journal(_))
    }
}
