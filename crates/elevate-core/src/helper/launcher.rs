use super::error::LaunchError;
use super::session::{HelperLease, HelperSession};
use super::spawner::HelperSpawner;
use crate::config::BrokerConfig;
use crate::registry::HelperManifest;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Default launcher constants
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
const DEFAULT_REAP_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub handshake_timeout: Duration,
    /// Used when a manifest does not set its own idle timeout.
    pub default_idle_timeout: Duration,
    pub shutdown_grace: Duration,
    pub reap_interval: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            default_idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            reap_interval: Duration::from_millis(DEFAULT_REAP_INTERVAL_MS),
        }
    }
}

impl LauncherConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        let default_idle_timeout = config.helper_idle_timeout();
        Self {
            handshake_timeout: config.handshake_timeout(),
            default_idle_timeout,
            shutdown_grace: config.helper_shutdown_grace(),
            reap_interval: (default_idle_timeout / 4)
                .clamp(Duration::from_millis(100), Duration::from_millis(DEFAULT_REAP_INTERVAL_MS)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperState {
    Starting,
    Ready,
    Exited,
}

/// Point-in-time view of one helper slot.
#[derive(Debug, Clone, Serialize)]
pub struct HelperStatus {
    pub helper_id: String,
    pub state: HelperState,
    pub pid: Option<u32>,
    pub in_flight: usize,
    pub idle_secs: Option<u64>,
    pub uptime_secs: Option<u64>,
}

type SpawnFuture = Shared<BoxFuture<'static, Result<Arc<HelperSession>, LaunchError>>>;

enum Slot {
    Starting(SpawnFuture),
    Ready(Arc<HelperSession>),
}

/// Starts helpers on demand and keeps one session per helper id.
pub struct HelperLauncher {
    spawner: Arc<dyn HelperSpawner>,
    config: LauncherConfig,
    slots: Mutex<HashMap<String, Slot>>,
    shutting_down: AtomicBool,
    spawn_count: AtomicU64,
}

impl HelperLauncher {
    pub fn new(spawner: Arc<dyn HelperSpawner>, config: LauncherConfig) -> Self {
        Self {
            spawner,
            config,
            slots: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            spawn_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Lease a ready session for `manifest`, spawning the helper when none
    /// is running. Callers racing on a helper that is still starting share
    /// its spawn. A transient handshake failure is retried once.
    pub async fn acquire(&self, manifest: Arc<HelperManifest>) -> Result<HelperLease, LaunchError> {
        let mut retried = false;
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(LaunchError::ShuttingDown);
            }

            let spawn = {
                let mut slots = self.slots.lock();
                match slots.get(&manifest.id) {
                    Some(Slot::Ready(session)) if session.is_alive() => {
                        return Ok(session.lease());
                    }
                    Some(Slot::Starting(spawn)) => spawn.clone(),
                    _ => {
                        let spawn = self.start_spawn(manifest.clone());
                        if let Some(Slot::Ready(dead)) =
                            slots.insert(manifest.id.clone(), Slot::Starting(spawn.clone()))
                        {
                            let grace = self.config.shutdown_grace;
                            tokio::spawn(async move { dead.terminate(grace).await });
                        }
                        spawn
                    }
                }
            };

            let result = spawn.clone().await;
            let outcome = {
                let mut slots = self.slots.lock();
                let ours = matches!(
                    slots.get(&manifest.id),
                    Some(Slot::Starting(current)) if current.ptr_eq(&spawn)
                );
                match result {
                    Ok(session) => {
                        if ours {
                            slots.insert(manifest.id.clone(), Slot::Ready(session.clone()));
                        }
                        Ok(session.lease())
                    }
                    Err(err) => {
                        if ours {
                            slots.remove(&manifest.id);
                        }
                        Err(err)
                    }
                }
            };

            match outcome {
                Ok(lease) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        let session = lease.session().clone();
                        drop(lease);
                        session.terminate(self.config.shutdown_grace).await;
                        return Err(LaunchError::ShuttingDown);
                    }
                    return Ok(lease);
                }
                Err(err) if err.is_transient() && !retried => {
                    warn!(helper_id = %manifest.id, error = %err, "Helper start failed, retrying once");
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Give a lease back. Equivalent to dropping it.
    pub fn release(&self, lease: HelperLease) {
        drop(lease);
    }

    fn start_spawn(&self, manifest: Arc<HelperManifest>) -> SpawnFuture {
        self.spawn_count.fetch_add(1, Ordering::Relaxed);
        let spawner = self.spawner.clone();
        let handshake_timeout = self.config.handshake_timeout;
        let idle_timeout = manifest
            .idle_timeout()
            .unwrap_or(self.config.default_idle_timeout);
        debug!(helper_id = %manifest.id, "Starting helper");

        async move {
            let channel = spawner
                .spawn(&manifest)
                .await
                .map_err(|err| LaunchError::Spawn {
                    helper_id: manifest.id.clone(),
                    reason: err.to_string(),
                })?;
            let session =
                HelperSession::establish(&manifest, channel, handshake_timeout, idle_timeout).await?;
            for action in &manifest.actions {
                if !session.actions().iter().any(|name| name == &action.name) {
                    warn!(
                        helper_id = %manifest.id,
                        action = %action.name,
                        "Helper did not announce a registered action"
                    );
                }
            }
            Ok::<_, LaunchError>(session)
        }
        .boxed()
        .shared()
    }

    /// Number of helper starts attempted since creation.
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::Relaxed)
    }

    pub fn session(&self, helper_id: &str) -> Option<Arc<HelperSession>> {
        match self.slots.lock().get(helper_id) {
            Some(Slot::Ready(session)) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn status(&self) -> Vec<HelperStatus> {
        let slots = self.slots.lock();
        let mut status: Vec<HelperStatus> = slots
            .iter()
            .map(|(id, slot)| match slot {
                Slot::Starting(_) => HelperStatus {
                    helper_id: id.clone(),
                    state: HelperState::Starting,
                    pid: None,
                    in_flight: 0,
                    idle_secs: None,
                    uptime_secs: None,
                },
                Slot::Ready(session) => HelperStatus {
                    helper_id: id.clone(),
                    state: if session.is_alive() {
                        HelperState::Ready
                    } else {
                        HelperState::Exited
                    },
                    pid: session.pid(),
                    in_flight: session.in_flight(),
                    idle_secs: session.idle_for().map(|idle| idle.as_secs()),
                    uptime_secs: Some(session.uptime().as_secs()),
                },
            })
            .collect();
        status.sort_by(|a, b| a.helper_id.cmp(&b.helper_id));
        status
    }

    /// Terminate sessions that exited or sat idle past their timeout.
    /// Returns how many were removed.
    pub async fn reap_idle(&self) -> usize {
        let expired: Vec<Arc<HelperSession>> = {
            let mut slots = self.slots.lock();
            let ids: Vec<String> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready(session)
                        if !session.is_alive()
                            || session
                                .idle_for()
                                .is_some_and(|idle| idle >= session.idle_timeout()) =>
                    {
                        Some(id.clone())
                    }
                    _ => None,
                })
                .collect();
            ids.into_iter()
                .filter_map(|id| match slots.remove(&id) {
                    Some(Slot::Ready(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };

        for session in &expired {
            if session.is_alive() {
                info!(helper_id = %session.helper_id(), "Stopping idle helper");
            } else {
                debug!(helper_id = %session.helper_id(), "Removing exited helper");
            }
            session.terminate(self.config.shutdown_grace).await;
        }
        expired.len()
    }

    /// Periodically reap idle helpers until `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let launcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(launcher.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        launcher.reap_idle().await;
                    }
                }
            }
        })
    }

    /// Refuse new acquires and terminate every running helper.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<HelperSession>> = self
            .slots
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(session) => Some(session),
                Slot::Starting(_) => None,
            })
            .collect();
        if !sessions.is_empty() {
            info!(helpers = sessions.len(), "Terminating helpers");
        }
        let grace = self.config.shutdown_grace;
        futures::future::join_all(sessions.iter().map(|session| session.terminate(grace))).await;
    }
}
