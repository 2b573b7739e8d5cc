use super::grants::{KeepGrants, satisfies};
use super::prompt::{PromptAgent, PromptOutcome, PromptRequest};
use crate::policy::AuthRequirement;
use elevate_contracts::Identity;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Result of authenticating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Verified { token: String },
    Cancelled,
    Failed(String),
    TimedOut,
}

impl AuthOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

/// What the caller wants authenticated.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub identity: Identity,
    pub action: String,
    pub message: Option<String>,
    pub requirement: AuthRequirement,
    /// Remember a successful authentication for this action.
    pub keep: bool,
}

type PromptFuture = BoxFuture<'static, AuthOutcome>;
type PromptKey = (u32, u32);

struct InFlight {
    generation: u64,
    requirement: AuthRequirement,
    prompt: WeakShared<PromptFuture>,
}

/// Runs authentication prompts with at most one prompt in flight per
/// `(uid, session)`.
///
/// Concurrent requests for the same identity await the same prompt and all
/// see its outcome. The prompt only lives as long as someone awaits it, so
/// cancelling every waiting request abandons the prompt.
pub struct AuthenticationAgent {
    agent: Arc<dyn PromptAgent>,
    timeout: Duration,
    in_flight: Arc<Mutex<HashMap<PromptKey, InFlight>>>,
    next_generation: AtomicU64,
    prompts_started: AtomicU64,
    grants: KeepGrants,
}

impl AuthenticationAgent {
    pub fn new(agent: Arc<dyn PromptAgent>, timeout: Duration, keep_for: Duration) -> Self {
        Self {
            agent,
            timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            prompts_started: AtomicU64::new(0),
            grants: KeepGrants::new(keep_for),
        }
    }

    pub async fn authenticate(&self, request: AuthRequest) -> AuthOutcome {
        if request.keep
            && let Some(token) =
                self.grants
                    .lookup(&request.identity, &request.action, request.requirement)
        {
            debug!(action = %request.action, uid = request.identity.uid, "Reusing kept authorization");
            return AuthOutcome::Verified { token };
        }

        let outcome = loop {
            let (prompt, covers_request) = self.join_or_start(&request);
            let outcome = prompt.await;
            if covers_request {
                break outcome;
            }
            // The prompt we waited behind asked for weaker credentials.
        };

        if request.keep
            && let AuthOutcome::Verified { token } = &outcome
        {
            self.grants.remember(
                &request.identity,
                &request.action,
                request.requirement,
                token,
            );
        }
        outcome
    }

    /// Drop every remembered authorization.
    pub fn clear_grants(&self) {
        self.grants.clear();
    }

    pub fn grants(&self) -> &KeepGrants {
        &self.grants
    }

    /// Number of prompts started since creation.
    pub fn prompts_started(&self) -> u64 {
        self.prompts_started.load(Ordering::Relaxed)
    }

    fn join_or_start(&self, request: &AuthRequest) -> (Shared<PromptFuture>, bool) {
        let key = (request.identity.uid, request.identity.session_id);
        let mut in_flight = self.in_flight.lock();

        if let Some(entry) = in_flight.get(&key)
            && let Some(prompt) = entry.prompt.upgrade()
        {
            debug!(uid = key.0, session = key.1, "Joining in-flight prompt");
            return (prompt, satisfies(entry.requirement, request.requirement));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.prompts_started.fetch_add(1, Ordering::Relaxed);
        info!(
            action = %request.action,
            uid = key.0,
            session = key.1,
            kind = request.requirement.as_str(),
            "Prompting for authentication"
        );

        let agent = self.agent.clone();
        let table = self.in_flight.clone();
        let timeout = self.timeout;
        let prompt_request = PromptRequest {
            identity: request.identity.clone(),
            action: request.action.clone(),
            message: request.message.clone(),
            requirement: request.requirement,
        };
        let prompt = async move {
            let outcome = match tokio::time::timeout(timeout, agent.prompt(prompt_request)).await {
                Ok(PromptOutcome::Verified(token)) => AuthOutcome::Verified { token },
                Ok(PromptOutcome::Cancelled) => AuthOutcome::Cancelled,
                Ok(PromptOutcome::Failed(reason)) => AuthOutcome::Failed(reason),
                Err(_) => AuthOutcome::TimedOut,
            };
            let mut table = table.lock();
            if table
                .get(&key)
                .is_some_and(|entry| entry.generation == generation)
            {
                table.remove(&key);
            }
            outcome
        }
        .boxed()
        .shared();

        if let Some(weak) = prompt.downgrade() {
            in_flight.insert(
                key,
                InFlight {
                    generation,
                    requirement: request.requirement,
                    prompt: weak,
                },
            );
        }
        (prompt, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Blocks until released, then answers with a fixed outcome.
    struct GatedPrompt {
        calls: AtomicUsize,
        gate: Notify,
        outcome: PromptOutcome,
    }

    impl GatedPrompt {
        fn new(outcome: PromptOutcome) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                outcome,
            })
        }
    }

    #[async_trait]
    impl PromptAgent for GatedPrompt {
        async fn prompt(&self, _request: PromptRequest) -> PromptOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.outcome.clone()
        }
    }

    struct InstantPrompt(PromptOutcome);

    #[async_trait]
    impl PromptAgent for InstantPrompt {
        async fn prompt(&self, _request: PromptRequest) -> PromptOutcome {
            self.0.clone()
        }
    }

    fn request(uid: u32, requirement: AuthRequirement, keep: bool) -> AuthRequest {
        AuthRequest {
            identity: Identity::new(uid, uid),
            action: "org.example.write".to_string(),
            message: None,
            requirement,
            keep,
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_prompt() {
        let prompt = GatedPrompt::new(PromptOutcome::Verified("tok".to_string()));
        let agent = Arc::new(AuthenticationAgent::new(
            prompt.clone(),
            Duration::from_secs(5),
            Duration::ZERO,
        ));

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let agent = agent.clone();
            waiters.push(tokio::spawn(async move {
                agent
                    .authenticate(request(1000, AuthRequirement::SelfAuth, false))
                    .await
            }));
        }
        while prompt.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        prompt.gate.notify_waiters();

        for waiter in waiters {
            assert_eq!(
                waiter.await.unwrap(),
                AuthOutcome::Verified {
                    token: "tok".to_string()
                }
            );
        }
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.prompts_started(), 1);
    }

    #[tokio::test]
    async fn test_different_identities_prompt_separately() {
        let agent = AuthenticationAgent::new(
            Arc::new(InstantPrompt(PromptOutcome::Cancelled)),
            Duration::from_secs(5),
            Duration::ZERO,
        );
        let first = agent.authenticate(request(1000, AuthRequirement::SelfAuth, false));
        let second = agent.authenticate(request(1001, AuthRequirement::SelfAuth, false));
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, AuthOutcome::Cancelled);
        assert_eq!(second, AuthOutcome::Cancelled);
        assert_eq!(agent.prompts_started(), 2);
    }

    #[tokio::test]
    async fn test_prompt_timeout() {
        let prompt = GatedPrompt::new(PromptOutcome::Cancelled);
        let agent = AuthenticationAgent::new(prompt, Duration::from_millis(20), Duration::ZERO);
        assert_eq!(
            agent
                .authenticate(request(1000, AuthRequirement::AdminAuth, false))
                .await,
            AuthOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_abandoned_prompt_is_restarted() {
        let prompt = GatedPrompt::new(PromptOutcome::Verified("tok".to_string()));
        let agent = Arc::new(AuthenticationAgent::new(
            prompt.clone(),
            Duration::from_secs(5),
            Duration::ZERO,
        ));

        let first = {
            let agent = agent.clone();
            tokio::spawn(async move {
                agent
                    .authenticate(request(1000, AuthRequirement::SelfAuth, false))
                    .await
            })
        };
        while prompt.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        first.abort();
        let _ = first.await;

        let second = {
            let agent = agent.clone();
            tokio::spawn(async move {
                agent
                    .authenticate(request(1000, AuthRequirement::SelfAuth, false))
                    .await
            })
        };
        while prompt.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        prompt.gate.notify_waiters();
        assert!(second.await.unwrap().is_verified());
        assert_eq!(agent.prompts_started(), 2);
    }

    #[tokio::test]
    async fn test_keep_grant_skips_second_prompt() {
        let agent = AuthenticationAgent::new(
            Arc::new(InstantPrompt(PromptOutcome::Verified("tok".to_string()))),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        for _ in 0..3 {
            assert!(
                agent
                    .authenticate(request(1000, AuthRequirement::AdminAuth, true))
                    .await
                    .is_verified()
            );
        }
        assert_eq!(agent.prompts_started(), 1);

        agent.clear_grants();
        agent
            .authenticate(request(1000, AuthRequirement::AdminAuth, true))
            .await;
        assert_eq!(agent.prompts_started(), 2);
    }

    #[tokio::test]
    async fn test_non_keep_policy_always_prompts() {
        let agent = AuthenticationAgent::new(
            Arc::new(InstantPrompt(PromptOutcome::Verified("tok".to_string()))),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        agent
            .authenticate(request(1000, AuthRequirement::SelfAuth, false))
            .await;
        agent
            .authenticate(request(1000, AuthRequirement::SelfAuth, false))
            .await;
        assert_eq!(agent.prompts_started(), 2);
    }
}
