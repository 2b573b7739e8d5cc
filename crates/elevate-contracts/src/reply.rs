//! Final results of actions.

use crate::action::ArgumentMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse outcome of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Success,
    Failed,
    UserCancelled,
    AuthorizationDenied,
    HelperBusy,
    InvalidAction,
}

/// Broker error taxonomy carried in [`ActionReply::error_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    InvalidAction = 1,
    AuthorizationDenied = 2,
    UserCancelled = 3,
    Timeout = 4,
    HelperCrashed = 5,
    HelperBusy = 6,
    InternalError = 7,
}

impl ErrorCode {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::NoError,
            1 => Self::InvalidAction,
            2 => Self::AuthorizationDenied,
            3 => Self::UserCancelled,
            4 => Self::Timeout,
            5 => Self::HelperCrashed,
            6 => Self::HelperBusy,
            7 => Self::InternalError,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether resubmitting the same action may succeed without user
    /// intervention.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::HelperCrashed | Self::HelperBusy | Self::Timeout)
    }
}

/// Who produced a reply. Helper replies may carry helper-defined error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOrigin {
    #[default]
    Broker,
    Helper,
}

/// The final structured result of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(default)]
    pub data: ArgumentMap,
    #[serde(default)]
    pub origin: ReplyOrigin,
}

impl ActionReply {
    fn with_status(status: ReplyStatus, code: ErrorCode) -> Self {
        Self {
            status,
            error_code: code.code(),
            error_description: None,
            data: ArgumentMap::new(),
            origin: ReplyOrigin::Broker,
        }
    }

    pub fn success() -> Self {
        Self::with_status(ReplyStatus::Success, ErrorCode::NoError)
    }

    pub fn success_with_data(data: ArgumentMap) -> Self {
        Self {
            data,
            ..Self::success()
        }
    }

    /// Failure reported by helper code with a helper-defined error code.
    pub fn helper_error(code: i32) -> Self {
        Self {
            status: ReplyStatus::Failed,
            error_code: code,
            error_description: None,
            data: ArgumentMap::new(),
            origin: ReplyOrigin::Helper,
        }
    }

    pub fn invalid_action() -> Self {
        Self::with_status(ReplyStatus::InvalidAction, ErrorCode::InvalidAction)
    }

    pub fn authorization_denied() -> Self {
        Self::with_status(ReplyStatus::AuthorizationDenied, ErrorCode::AuthorizationDenied)
    }

    pub fn user_cancelled() -> Self {
        Self::with_status(ReplyStatus::UserCancelled, ErrorCode::UserCancelled)
    }

    pub fn helper_busy() -> Self {
        Self::with_status(ReplyStatus::HelperBusy, ErrorCode::HelperBusy)
    }

    pub fn helper_crashed() -> Self {
        Self::with_status(ReplyStatus::Failed, ErrorCode::HelperCrashed)
    }

    pub fn timeout() -> Self {
        Self::with_status(ReplyStatus::Failed, ErrorCode::Timeout)
    }

    pub fn internal_error() -> Self {
        Self::with_status(ReplyStatus::Failed, ErrorCode::InternalError)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }

    /// Broker error code, if this reply carries one.
    pub fn error(&self) -> Option<ErrorCode> {
        match self.origin {
            ReplyOrigin::Broker => ErrorCode::from_code(self.error_code),
            ReplyOrigin::Helper => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_and_busy_are_distinct() {
        let crashed = ActionReply::helper_crashed();
        let busy = ActionReply::helper_busy();

        assert_eq!(crashed.status, ReplyStatus::Failed);
        assert_eq!(crashed.error(), Some(ErrorCode::HelperCrashed));
        assert_eq!(busy.status, ReplyStatus::HelperBusy);
        assert_eq!(busy.error(), Some(ErrorCode::HelperBusy));
        assert_ne!(crashed, busy);
    }

    #[test]
    fn test_helper_error_codes_do_not_map_to_taxonomy() {
        let reply = ActionReply::helper_error(4).with_description("disk full");
        assert!(reply.failed());
        assert_eq!(reply.origin, ReplyOrigin::Helper);
        assert_eq!(reply.error(), None);
        assert_eq!(reply.error_code, 4);
    }

    #[test]
    fn test_error_code_round_trip() {
        for code in 0..=7 {
            let parsed = ErrorCode::from_code(code).unwrap();
            assert_eq!(parsed.code(), code);
        }
        assert!(ErrorCode::from_code(42).is_none());
        assert!(ErrorCode::HelperCrashed.is_retryable());
        assert!(!ErrorCode::AuthorizationDenied.is_retryable());
    }

    #[test]
    fn test_success_with_data() {
        let reply = ActionReply::success().with_data("bytes", 12);
        assert!(reply.succeeded());
        assert_eq!(reply.error(), Some(ErrorCode::NoError));
        assert_eq!(reply.data["bytes"], 12);
    }
}
