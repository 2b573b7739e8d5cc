use crate::policy::AuthRequirement;
use elevate_contracts::Identity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

type GrantKey = (u32, u32, String);

struct Grant {
    token: String,
    requirement: AuthRequirement,
    expires_at: Instant,
}

/// Remembered authentications for `_keep` policies, per
/// `(uid, session, action)`.
pub struct KeepGrants {
    ttl: Duration,
    grants: Mutex<HashMap<GrantKey, Grant>>,
}

impl KeepGrants {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            grants: Mutex::new(HashMap::new()),
        }
    }

    /// Token of a live grant covering `requirement`. An admin grant also
    /// covers self authentication.
    pub fn lookup(
        &self,
        identity: &Identity,
        action: &str,
        requirement: AuthRequirement,
    ) -> Option<String> {
        let key = key(identity, action);
        let mut grants = self.grants.lock();
        let grant = grants.get(&key)?;
        if grant.expires_at <= Instant::now() {
            grants.remove(&key);
            return None;
        }
        satisfies(grant.requirement, requirement).then(|| grant.token.clone())
    }

    pub fn remember(
        &self,
        identity: &Identity,
        action: &str,
        requirement: AuthRequirement,
        token: &str,
    ) {
        if self.ttl.is_zero() {
            return;
        }
        self.grants.lock().insert(
            key(identity, action),
            Grant {
                token: token.to_string(),
                requirement,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.grants.lock().clear();
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut grants = self.grants.lock();
        grants.retain(|_, grant| grant.expires_at > now);
        grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether an authentication of kind `held` is enough for `needed`.
pub fn satisfies(held: AuthRequirement, needed: AuthRequirement) -> bool {
    held == needed || held == AuthRequirement::AdminAuth
}

fn key(identity: &Identity, action: &str) -> GrantKey {
    (identity.uid, identity.session_id, action.to_string())
}
