use super::store::{PolicyLoadError, PolicyResult, PolicyStore, PolicyValue};
use crate::registry::HelperRegistry;
use crate::snapshot::SharedSnapshot;
use elevate_contracts::{Action, AuthorizationStatus, Identity};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Which credentials an authentication prompt must collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequirement {
    SelfAuth,
    AdminAuth,
}

impl AuthRequirement {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfAuth => "self",
            Self::AdminAuth => "admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum DecisionSource {
    /// A store entry with this pattern decided.
    Rule(String),
    /// The helper manifest's default for the action.
    ManifestDefault,
    /// Nothing matched.
    Fallback,
    /// The store could not be read.
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub status: AuthorizationStatus,
    pub requirement: Option<AuthRequirement>,
    pub keep: bool,
    pub source: DecisionSource,
}

impl PolicyDecision {
    fn from_value(value: PolicyValue, source: DecisionSource) -> Self {
        let (status, requirement) = match value.result {
            PolicyResult::Yes => (AuthorizationStatus::Authorized, None),
            PolicyResult::No => (AuthorizationStatus::Denied, None),
            PolicyResult::AuthSelf => (
                AuthorizationStatus::AuthRequired,
                Some(AuthRequirement::SelfAuth),
            ),
            PolicyResult::AuthAdmin => (
                AuthorizationStatus::AuthRequired,
                Some(AuthRequirement::AdminAuth),
            ),
        };
        Self {
            status,
            requirement,
            keep: value.keep && requirement.is_some(),
            source,
        }
    }

    fn fixed(status: AuthorizationStatus, source: DecisionSource) -> Self {
        Self {
            status,
            requirement: None,
            keep: false,
            source,
        }
    }
}

/// Loaded state of the policy store.
#[derive(Debug)]
pub enum StoreState {
    Ready(PolicyStore),
    /// Reading failed; every evaluation is denied until a reload succeeds.
    Unavailable(String),
}

/// Decides whether an identity may run an action.
///
/// Holds only snapshots: evaluation takes no lock beyond cloning an `Arc`
/// and can run concurrently with a reload.
pub struct PolicyEvaluator {
    path: PathBuf,
    store: SharedSnapshot<StoreState>,
    registry: Arc<SharedSnapshot<HelperRegistry>>,
}

impl PolicyEvaluator {
    /// Load the store at `path`. A failing store starts the evaluator in the
    /// unavailable state rather than failing startup.
    pub fn open(path: impl Into<PathBuf>, registry: Arc<SharedSnapshot<HelperRegistry>>) -> Self {
        let path = path.into();
        let evaluator = Self {
            store: SharedSnapshot::new(StoreState::Ready(PolicyStore::default())),
            path,
            registry,
        };
        let _ = evaluator.reload();
        evaluator
    }

    pub fn with_store(store: PolicyStore, registry: Arc<SharedSnapshot<HelperRegistry>>) -> Self {
        Self {
            path: PathBuf::new(),
            store: SharedSnapshot::new(StoreState::Ready(store)),
            registry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the store file, replacing the snapshot either way.
    pub fn reload(&self) -> Result<(), PolicyLoadError> {
        match PolicyStore::load(&self.path) {
            Ok(store) => {
                info!(
                    path = %self.path.display(),
                    entries = store.entries().len(),
                    "Policy store loaded"
                );
                self.store.replace(StoreState::Ready(store));
                Ok(())
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Policy store unavailable, denying all actions until reload"
                );
                self.store.replace(StoreState::Unavailable(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(*self.store.load(), StoreState::Unavailable(_))
    }

    pub fn store(&self) -> Arc<StoreState> {
        self.store.load()
    }

    pub fn evaluate(&self, identity: &Identity, action: &Action) -> AuthorizationStatus {
        self.evaluate_detailed(identity, action).status
    }

    pub fn evaluate_detailed(&self, identity: &Identity, action: &Action) -> PolicyDecision {
        let registry = self.registry.load();
        let Some(resolved) = registry.resolve(action) else {
            return PolicyDecision::fixed(AuthorizationStatus::Invalid, DecisionSource::Fallback);
        };

        let store = self.store.load();
        let store = match &*store {
            StoreState::Ready(store) => store,
            StoreState::Unavailable(_) => {
                return PolicyDecision::fixed(
                    AuthorizationStatus::Denied,
                    DecisionSource::StoreUnavailable,
                );
            }
        };

        if let Some(found) = store.lookup(identity, &action.name) {
            return PolicyDecision::from_value(found.value, DecisionSource::Rule(found.pattern));
        }
        match resolved.action.policy {
            Some(value) => PolicyDecision::from_value(value, DecisionSource::ManifestDefault),
            None => PolicyDecision::fixed(AuthorizationStatus::Denied, DecisionSource::Fallback),
        }
    }
}
