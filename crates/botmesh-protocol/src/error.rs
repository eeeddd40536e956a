use thiserror::Error;

/// Errors raised while translating between wire dialects and the
/// internal message model.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame could not be decoded at all (not JSON, not an object, ...).
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame decoded but a required field is missing or has the wrong type.
    #[error("missing or invalid field '{0}'")]
    MissingField(String),

    /// The frame names a dialect, post type or action this gateway does not know.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The identity directory collaborator failed.
    #[error("identity directory error: {0}")]
    Identity(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
