use super::request::{PendingRequest, RequestHandle};
use crate::auth::{
    AuthOutcome, AuthRequest, AuthenticationAgent, CommandPrompt, DenyPrompt, PromptAgent,
};
use crate::config::BrokerConfig;
use crate::helper::{
    HelperLauncher, HelperSpawner, HelperStatus, LaunchError, LauncherConfig, ProcessSpawner,
    SessionEvent,
};
use crate::policy::{AuthRequirement, PolicyEvaluator};
use crate::registry::HelperRegistry;
use crate::snapshot::SharedSnapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use elevate_contracts::{
    Action, ActionReply, ActionRequest, AuthorizationStatus, ExecutionMode, Identity,
    ReplyOrigin, RequestState,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Bookkeeping for a request that has not delivered its reply yet.
struct InFlightRequest {
    action: String,
    uid: u32,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub started_at: DateTime<Utc>,
    pub pending_requests: usize,
    pub registered_actions: usize,
    pub policy_degraded: bool,
    pub helpers: Vec<HelperStatus>,
}

pub struct BrokerBuilder {
    config: BrokerConfig,
    registry: Option<HelperRegistry>,
    spawner: Option<Arc<dyn HelperSpawner>>,
    prompt: Option<Arc<dyn PromptAgent>>,
}

impl BrokerBuilder {
    /// Use a fixed registry instead of the manifests in the helpers
    /// directory. Reloads then only re-read the policy store.
    pub fn registry(mut self, registry: HelperRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn HelperSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn prompt_agent(mut self, prompt: Arc<dyn PromptAgent>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn build(self) -> Result<Arc<Broker>> {
        self.config.validate()?;

        let (registry, helpers_dir) = match self.registry {
            Some(registry) => (registry, None),
            None => {
                let dir = self.config.resolve_helpers_dir()?;
                let registry = HelperRegistry::load_dir(&dir)
                    .with_context(|| format!("Failed to load helpers from {}", dir.display()))?;
                (registry, Some(dir))
            }
        };
        info!(
            helpers = registry.len(),
            actions = registry.action_names().len(),
            "Helper registry loaded"
        );
        let registry = Arc::new(SharedSnapshot::new(registry));

        let policy = PolicyEvaluator::open(self.config.resolve_policy_path()?, registry.clone());

        let prompt: Arc<dyn PromptAgent> = match (self.prompt, &self.config.prompt_command) {
            (Some(prompt), _) => prompt,
            (None, Some(program)) => Arc::new(CommandPrompt::new(program)),
            (None, None) => Arc::new(DenyPrompt),
        };
        let auth = AuthenticationAgent::new(
            prompt,
            self.config.prompt_timeout(),
            self.config.auth_keep(),
        );

        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(ProcessSpawner));
        let launcher = Arc::new(HelperLauncher::new(
            spawner,
            LauncherConfig::from_broker_config(&self.config),
        ));
        let shutdown = CancellationToken::new();
        launcher.spawn_reaper(shutdown.clone());

        Ok(Arc::new(Broker {
            config: self.config,
            registry,
            helpers_dir,
            policy,
            auth,
            launcher,
            pending: DashMap::new(),
            accepting: AtomicBool::new(true),
            shutdown,
            started_at: Utc::now(),
        }))
    }
}

/// Runs requests through policy, authentication and helper dispatch.
///
/// Each submitted request gets its own task. Only the helper slots, the
/// prompt table and the in-flight request table are shared between them.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<SharedSnapshot<HelperRegistry>>,
    helpers_dir: Option<PathBuf>,
    policy: PolicyEvaluator,
    auth: AuthenticationAgent,
    launcher: Arc<HelperLauncher>,
    pending: DashMap<Uuid, InFlightRequest>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Broker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            registry: None,
            spawner: None,
            prompt: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn policy(&self) -> &PolicyEvaluator {
        &self.policy
    }

    pub fn auth(&self) -> &AuthenticationAgent {
        &self.auth
    }

    pub fn launcher(&self) -> &Arc<HelperLauncher> {
        &self.launcher
    }

    pub fn registry(&self) -> Arc<HelperRegistry> {
        self.registry.load()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            started_at: self.started_at,
            pending_requests: self.pending.len(),
            registered_actions: self.registry.load().action_names().len(),
            policy_degraded: self.policy.is_degraded(),
            helpers: self.launcher.status(),
        }
    }

    /// Start processing `action` on behalf of `identity`. Progress, state
    /// changes and the reply arrive on the returned handle.
    pub fn submit(self: &Arc<Self>, identity: Identity, action: Action) -> RequestHandle {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        self.pending.insert(
            id,
            InFlightRequest {
                action: action.name.clone(),
                uid: identity.uid,
                cancel: cancel.clone(),
            },
        );
        let request = PendingRequest::new(id, identity, action, cancel.clone(), tx);
        let broker = self.clone();
        tokio::spawn(async move {
            broker.run(request).await;
            broker.pending.remove(&id);
        });

        RequestHandle::new(id, rx, cancel)
    }

    async fn run(&self, mut request: PendingRequest) {
        debug!(
            request_id = %request.id,
            action = %request.action.name,
            uid = request.identity.uid,
            pid = ?request.identity.pid,
            "Request received"
        );
        let (state, reply) = self.drive(&mut request).await;
        request.finish(state, reply);
    }

    async fn drive(&self, request: &mut PendingRequest) -> (RequestState, ActionReply) {
        if !self.is_accepting() {
            return (
                RequestState::Failed,
                ActionReply::internal_error().with_description("broker is shutting down"),
            );
        }
        if !request.action.is_valid() {
            return (
                RequestState::Failed,
                ActionReply::invalid_action().with_description("malformed action name"),
            );
        }
        let registry = self.registry.load();
        let Some(resolved) = registry.resolve(&request.action) else {
            return (
                RequestState::Failed,
                ActionReply::invalid_action().with_description(format!(
                    "action '{}' is not registered",
                    request.action.name
                )),
            );
        };

        let cancel = request.cancel.clone();
        let deadline = Instant::now()
            + request
                .action
                .timeout()
                .unwrap_or_else(|| self.config.default_timeout());

        request.transition(RequestState::PolicyCheck);
        if cancel.is_cancelled() {
            return cancelled();
        }
        let decision = self.policy.evaluate_detailed(&request.identity, &request.action);
        debug!(
            request_id = %request.id,
            status = %decision.status,
            source = ?decision.source,
            "Policy decision"
        );

        let mut verification_token = None;
        match decision.status {
            AuthorizationStatus::Authorized => {}
            AuthorizationStatus::Invalid => {
                return (RequestState::Failed, ActionReply::invalid_action());
            }
            AuthorizationStatus::Denied | AuthorizationStatus::UserCancelled => {
                return (RequestState::Failed, ActionReply::authorization_denied());
            }
            AuthorizationStatus::AuthRequired => {
                request.transition(RequestState::AuthPending);
                let auth = AuthRequest {
                    identity: request.identity.clone(),
                    action: request.action.name.clone(),
                    message: request
                        .action
                        .details
                        .message
                        .clone()
                        .or_else(|| resolved.action.message.clone()),
                    requirement: decision.requirement.unwrap_or(AuthRequirement::AdminAuth),
                    keep: decision.keep,
                };
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return cancelled(),
                    _ = tokio::time::sleep_until(deadline) => return timed_out(),
                    outcome = self.auth.authenticate(auth) => outcome,
                };
                match outcome {
                    AuthOutcome::Verified { token } => verification_token = Some(token),
                    AuthOutcome::Cancelled => {
                        return (RequestState::Cancelled, ActionReply::user_cancelled());
                    }
                    AuthOutcome::Failed(reason) => {
                        return (
                            RequestState::Failed,
                            ActionReply::authorization_denied().with_description(reason),
                        );
                    }
                    AuthOutcome::TimedOut => {
                        return (
                            RequestState::Failed,
                            ActionReply::timeout()
                                .with_description("authentication prompt timed out"),
                        );
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return cancelled();
        }
        if request.action.mode == ExecutionMode::AuthorizeOnly {
            return (RequestState::Completed, ActionReply::success());
        }

        request.transition(RequestState::Dispatched);
        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            _ = tokio::time::sleep_until(deadline) => return timed_out(),
            lease = self.launcher.acquire(resolved.helper.clone()) => match lease {
                Ok(lease) => lease,
                Err(LaunchError::ShuttingDown) => {
                    return (
                        RequestState::Failed,
                        ActionReply::internal_error().with_description("broker is shutting down"),
                    );
                }
                Err(err) => {
                    warn!(request_id = %request.id, error = %err, "Could not start helper");
                    return (
                        RequestState::Failed,
                        ActionReply::helper_crashed().with_description(err.to_string()),
                    );
                }
            },
        };
        if lease.session().in_flight() > resolved.helper.max_concurrent {
            return (RequestState::Failed, ActionReply::helper_busy());
        }

        let mut dispatched = lease.dispatch(ActionRequest {
            action: request.action.clone(),
            caller: Some(request.identity.clone()),
            verification_token,
        });
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    dispatched.cancel();
                    return cancelled();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    dispatched.cancel();
                    return timed_out();
                }
                event = dispatched.next_event() => match event {
                    Some(SessionEvent::Progress(update)) => request.progress(update),
                    Some(SessionEvent::Reply(reply)) => {
                        let state = if reply.succeeded() || reply.origin == ReplyOrigin::Helper {
                            RequestState::Completed
                        } else {
                            RequestState::Failed
                        };
                        return (state, reply);
                    }
                    None => return (RequestState::Failed, ActionReply::helper_crashed()),
                },
            }
        }
    }

    /// Re-read helper manifests and the policy store and forget kept
    /// authorizations. A broken policy file leaves the broker denying
    /// everything until the next successful reload.
    pub fn reload(&self) -> Result<()> {
        if let Some(dir) = &self.helpers_dir {
            let registry = HelperRegistry::load_dir(dir)
                .with_context(|| format!("Failed to reload helpers from {}", dir.display()))?;
            info!(
                helpers = registry.len(),
                actions = registry.action_names().len(),
                "Helper registry reloaded"
            );
            self.registry.replace(registry);
        }
        self.auth.clear_grants();
        self.policy
            .reload()
            .with_context(|| format!("Failed to reload policy from {}", self.policy.path().display()))
    }

    /// Stop accepting requests, give in-flight ones `drain_timeout` to
    /// finish, cancel the rest and terminate every helper.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(pending = self.pending.len(), "Broker shutting down");

        let drain_until = Instant::now() + self.config.drain_timeout();
        while !self.pending.is_empty() && Instant::now() < drain_until {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if !self.pending.is_empty() {
            for entry in self.pending.iter() {
                warn!(
                    request_id = %entry.key(),
                    action = %entry.action,
                    uid = entry.uid,
                    "Cancelling request at shutdown"
                );
                entry.cancel.cancel();
            }
            let settle_until = Instant::now() + DRAIN_POLL * 10;
            while !self.pending.is_empty() && Instant::now() < settle_until {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        }

        self.shutdown.cancel();
        self.launcher.shutdown().await;
        info!("Broker stopped");
    }
}

fn cancelled() -> (RequestState, ActionReply) {
    (RequestState::Cancelled, ActionReply::user_cancelled())
}

fn timed_out() -> (RequestState, ActionReply) {
    (RequestState::Failed, ActionReply::timeout())
}
