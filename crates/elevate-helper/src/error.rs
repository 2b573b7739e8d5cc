//! Helper runtime error types.

use elevate_contracts::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("broker closed the connection before the handshake")]
    NoHandshake,

    #[error("expected a handshake request, got {0}")]
    UnexpectedFirstMessage(&'static str),
}
