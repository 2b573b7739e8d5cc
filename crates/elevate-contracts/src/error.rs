//! Protocol error types.

use crate::messages::ProtocolVersion;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame shorter than its {0} byte header")]
    TruncatedFrame(usize),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("incompatible protocol version: local {local}, remote {remote}")]
    VersionMismatch {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Transport-level failures that a fresh connection may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }
}
