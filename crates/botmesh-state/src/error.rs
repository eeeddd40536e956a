use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    /// The peer's writer task is gone.
    #[error("link to {0} is closed")]
    LinkClosed(String),

    #[error("link to {0} is full")]
    LinkFull(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
