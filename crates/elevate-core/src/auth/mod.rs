//! Interactive authentication for actions whose policy requires it.

pub mod agent;
pub mod grants;
pub mod prompt;

pub use agent::{AuthOutcome, AuthRequest, AuthenticationAgent};
pub use grants::KeepGrants;
pub use prompt::{CommandPrompt, DenyPrompt, PROMPT_EXIT_CANCELLED, PromptAgent, PromptOutcome, PromptRequest};
