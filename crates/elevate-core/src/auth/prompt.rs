//! Prompt collaborators: the external programs or stubs that actually ask
//! the user for credentials.

use crate::policy::AuthRequirement;
use async_trait::async_trait;
use elevate_contracts::Identity;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status a prompt program uses to report that the user dismissed it.
pub const PROMPT_EXIT_CANCELLED: i32 = 2;

#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub identity: Identity,
    pub action: String,
    pub message: Option<String>,
    pub requirement: AuthRequirement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The user authenticated; the token is handed to the helper.
    Verified(String),
    Cancelled,
    Failed(String),
}

/// Asks a user to authenticate. Dropping the returned future abandons the
/// prompt.
#[async_trait]
pub trait PromptAgent: Send + Sync {
    async fn prompt(&self, request: PromptRequest) -> PromptOutcome;
}

/// Headless default: nobody can answer, so every prompt fails.
pub struct DenyPrompt;

#[async_trait]
impl PromptAgent for DenyPrompt {
    async fn prompt(&self, request: PromptRequest) -> PromptOutcome {
        debug!(action = %request.action, "No authentication agent configured");
        PromptOutcome::Failed("no authentication agent configured".to_string())
    }
}

/// Runs an agent program per prompt.
///
/// The program receives the request in `ELEVATE_*` environment variables.
/// Exit 0 with a token on stdout means verified, exit 2 means the user
/// cancelled, anything else is a failure.
pub struct CommandPrompt {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandPrompt {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn command(&self, request: &PromptRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("ELEVATE_ACTION", &request.action)
            .env("ELEVATE_UID", request.identity.uid.to_string())
            .env("ELEVATE_GID", request.identity.gid.to_string())
            .env("ELEVATE_SESSION", request.identity.session_id.to_string())
            .env("ELEVATE_AUTH_KIND", request.requirement.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(pid) = request.identity.pid {
            cmd.env("ELEVATE_PID", pid.to_string());
        }
        if let Some(message) = &request.message {
            cmd.env("ELEVATE_MESSAGE", message);
        }
        cmd
    }
}

#[async_trait]
impl PromptAgent for CommandPrompt {
    async fn prompt(&self, request: PromptRequest) -> PromptOutcome {
        let output = match self.command(&request).output().await {
            Ok(output) => output,
            Err(err) => {
                warn!(program = %self.program.display(), error = %err, "Failed to run prompt agent");
                return PromptOutcome::Failed(format!("prompt agent failed to start: {err}"));
            }
        };

        match output.status.code() {
            Some(0) => {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if token.is_empty() {
                    PromptOutcome::Failed("prompt agent returned no token".to_string())
                } else {
                    PromptOutcome::Verified(token)
                }
            }
            Some(PROMPT_EXIT_CANCELLED) => PromptOutcome::Cancelled,
            Some(code) => PromptOutcome::Failed(format!("prompt agent exited with status {code}")),
            None => PromptOutcome::Failed("prompt agent was killed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PromptRequest {
        PromptRequest {
            identity: Identity::new(1000, 1000).with_session(7),
            action: "org.example.write".to_string(),
            message: Some("Write the file".to_string()),
            requirement: AuthRequirement::AdminAuth,
        }
    }

    fn shell(script: &str) -> CommandPrompt {
        CommandPrompt::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_deny_prompt_fails() {
        assert!(matches!(
            DenyPrompt.prompt(request()).await,
            PromptOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_command_prompt_passes_request_in_env() {
        let agent = shell("echo \"$ELEVATE_ACTION:$ELEVATE_UID:$ELEVATE_SESSION:$ELEVATE_AUTH_KIND\"");
        assert_eq!(
            agent.prompt(request()).await,
            PromptOutcome::Verified("org.example.write:1000:7:admin".to_string())
        );
    }

    #[tokio::test]
    async fn test_command_prompt_exit_codes() {
        assert_eq!(shell("exit 2").prompt(request()).await, PromptOutcome::Cancelled);
        assert!(matches!(
            shell("exit 1").prompt(request()).await,
            PromptOutcome::Failed(_)
        ));
        assert!(matches!(
            shell("exit 0").prompt(request()).await,
            PromptOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let agent = CommandPrompt::new("/nonexistent/elevate-agent");
        assert!(matches!(
            agent.prompt(request()).await,
            PromptOutcome::Failed(_)
        ));
    }
}
