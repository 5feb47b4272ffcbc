//! Protocol errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    /// A remote-chat request could not be understood. `event_id` is kept when
    /// it was readable so a fallback can still be addressed to it.
    #[error("malformed request: {reason}")]
    MalformedRequest {
        event_id: Option<String>,
        reason: String,
    },

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bridge frame has no proto name separator")]
    MissingProtoName,

    #[error("bridge frame proto name is not UTF-8")]
    InvalidProtoName,

    #[error("failed to decode {proto}: {source}")]
    Decode {
        proto: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("unrecognized topic: {0}")]
    UnknownTopic(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
