use thiserror::Error;

use botmesh_broker::BrokerError;
use botmesh_protocol::{ProtocolError, RETCODE_BAD_REQUEST, RETCODE_INTERNAL, RETCODE_NOT_FOUND, RETCODE_TIMEOUT};
use botmesh_state::StateError;

/// Why a frame or queue entry could not be delivered.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The peer's socket could not take the frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// No bot or worker can take this frame.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl DispatchError {
    /// Retcode reported to the peer in a failed action response.
    pub fn retcode(&self) -> i64 {
        match self {
            Self::UnknownTarget(_) => RETCODE_NOT_FOUND,
            Self::Malformed(_) | Self::Protocol(_) => RETCODE_BAD_REQUEST,
            Self::Timeout(_) => RETCODE_TIMEOUT,
            Self::Transport(_) | Self::Broker(_) | Self::State(_) => RETCODE_INTERNAL,
        }
    }

    /// Worth retrying later, as opposed to dropping.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Broker(e) => e.is_transient(),
            Self::State(StateError::LinkClosed(_) | StateError::LinkFull(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("routing rule error: {0}")]
    Rule(String),

    #[error(transparent)]
    State(#[from] StateError),
}
