/// Failure to obtain a ready helper session.
///
/// Carries rendered messages rather than sources so one spawn outcome can
/// be shared by every request waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("no helper registered with id '{0}'")]
    UnknownHelper(String),

    #[error("failed to spawn helper {helper_id}: {reason}")]
    Spawn { helper_id: String, reason: String },

    #[error("helper {helper_id} did not complete the handshake in time")]
    HandshakeTimeout { helper_id: String },

    #[error("helper {helper_id} handshake failed: {reason}")]
    Handshake {
        helper_id: String,
        reason: String,
        transient: bool,
    },

    #[error("helper launcher is shutting down")]
    ShuttingDown,
}

impl LaunchError {
    /// Failures worth one retry with a fresh process.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HandshakeTimeout { .. } => true,
            Self::Handshake { transient, .. } => *transient,
            _ => false,
        }
    }
}
