use super::ipc_server::BrokerServer;
use crate::broker::Broker;
use crate::policy::PolicyWatcher;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A bound broker with its reload triggers: SIGHUP and, when enabled, the
/// policy file watcher.
pub struct BrokerDaemon {
    broker: Arc<Broker>,
    server: BrokerServer,
    hangups: Signal,
}

impl BrokerDaemon {
    /// Bind the socket and take over SIGHUP. Must be called inside a Tokio
    /// runtime.
    pub fn bind(broker: Arc<Broker>, socket_path: PathBuf) -> Result<Self> {
        let hangups = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        let server = BrokerServer::bind(broker.clone(), socket_path)?;
        Ok(Self {
            broker,
            server,
            hangups,
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Serve until `shutdown` fires, then drain requests and stop helpers.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let broker = self.broker;

        let _watcher = if broker.config().watch_policy {
            start_watcher(&broker)
        } else {
            None
        };

        let mut hangups = self.hangups;
        let reload_broker = broker.clone();
        let reload_stop = shutdown.clone();
        let reloader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reload_stop.cancelled() => break,
                    received = hangups.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!("SIGHUP received, reloading");
                        reload(&reload_broker);
                    }
                }
            }
        });

        info!("Broker running");
        let served = self.server.serve(shutdown.clone()).await;
        reloader.abort();
        broker.shutdown().await;
        served
    }
}

fn reload(broker: &Broker) {
    match broker.reload() {
        Ok(()) => info!("Broker reloaded"),
        Err(err) => warn!(error = %format!("{err:#}"), "Reload failed"),
    }
}

fn start_watcher(broker: &Arc<Broker>) -> Option<PolicyWatcher> {
    let helpers_dir = match broker.config().resolve_helpers_dir() {
        Ok(dir) => dir,
        Err(err) => {
            warn!(error = %err, "Cannot resolve helpers directory, not watching");
            return None;
        }
    };
    let policy_path = broker.policy().path().to_path_buf();
    let target = Arc::downgrade(broker);
    let watcher = PolicyWatcher::spawn(policy_path, helpers_dir, move || {
        if let Some(broker) = target.upgrade() {
            info!("Policy or helper manifests changed, reloading");
            reload(&broker);
        }
    });
    match watcher {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Policy watcher unavailable");
            None
        }
    }
}
