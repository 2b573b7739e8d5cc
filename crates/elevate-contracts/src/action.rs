//! Action value object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Ordered argument map carried by actions, replies and progress data.
pub type ArgumentMap = BTreeMap<String, Value>;

const MAX_ACTION_NAME_LEN: usize = 255;

/// How far the broker should take an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Authorize, then run the action in its helper.
    #[default]
    Execute,
    /// Only run the authorization part; never dispatch to a helper.
    AuthorizeOnly,
}

/// Details shown to the user when authentication is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A named privileged operation requested by a client.
///
/// Immutable once submitted: the broker and helpers only ever read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub arguments: ArgumentMap,
    #[serde(default)]
    pub helper_id: String,
    /// Overall deadline in milliseconds; zero or negative selects the broker default.
    #[serde(default)]
    pub timeout_ms: i64,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub details: ActionDetails,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: ArgumentMap::new(),
            helper_id: String::new(),
            timeout_ms: -1,
            mode: ExecutionMode::Execute,
            details: ActionDetails::default(),
        }
    }

    pub fn with_helper(mut self, helper_id: impl Into<String>) -> Self {
        self.helper_id = helper_id.into();
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_arguments(mut self, arguments: ArgumentMap) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.details.message = Some(message.into());
        self
    }

    pub fn has_helper(&self) -> bool {
        !self.helper_id.is_empty()
    }

    /// Syntactic validity only; registration is checked by the broker.
    pub fn is_valid(&self) -> bool {
        is_valid_action_name(&self.name)
    }

    /// Timeout requested by the client, if it asked for one.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        u64::try_from(self.timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(std::time::Duration::from_millis)
    }
}

/// Reverse-DNS style name: dot-separated, non-empty segments of
/// `[0-9A-Za-z_-]`.
pub fn is_valid_action_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_ACTION_NAME_LEN {
        return false;
    }
    name.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}
