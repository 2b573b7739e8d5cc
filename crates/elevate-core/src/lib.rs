//! Elevate Core - the privileged-action broker.
//!
//! Unprivileged clients ask the broker to run named actions. For each
//! request the broker:
//! - checks the action against the helper registry and the policy store
//! - authenticates the caller through a prompt agent when policy asks for it
//! - starts or reuses the helper that owns the action and relays its
//!   progress and reply back to the client
//!
//! The client socket, pid file and signal handling live in [`daemon`].

pub mod auth;
pub mod broker;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod helper;
pub mod logging;
pub mod paths;
pub mod policy;
pub mod registry;
pub mod snapshot;

pub use broker::{Broker, BrokerBuilder, BrokerStatus, RequestEvent, RequestHandle};
pub use config::BrokerConfig;
pub use registry::{HelperManifest, HelperRegistry};

/// How the broker introduces itself in handshakes.
pub const BROKER_PEER: &str = concat!("elevate-broker/", env!("CARGO_PKG_VERSION"));

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that touch process environment variables.
    pub fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
