use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a policy evaluation. Transient: recomputed for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Authorized,
    Denied,
    AuthRequired,
    UserCancelled,
    Invalid,
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Authorized => "authorized",
            Self::Denied => "denied",
            Self::AuthRequired => "auth_required",
            Self::UserCancelled => "user_cancelled",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a request inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    PolicyCheck,
    AuthPending,
    Dispatched,
    Completed,
    Cancelled,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::PolicyCheck => "policy_check",
            Self::AuthPending => "auth_pending",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
