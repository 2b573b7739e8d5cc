//! File system watcher triggering policy and registry reloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, warn};

const DEBOUNCE: Duration = Duration::from_millis(300);

/// Calls `on_change` once a burst of writes to the policy file or the
/// helpers directory has settled. Dropping the watcher stops it.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
}

impl PolicyWatcher {
    pub fn spawn<F>(policy_path: PathBuf, helpers_dir: PathBuf, on_change: F) -> anyhow::Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        let last_seen = Arc::new(Mutex::new(None::<Instant>));
        let on_change = Arc::new(on_change);

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.blocking_send(res);
        })?;

        let policy_dir = policy_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if policy_dir.is_dir() {
            watcher
                .watch(&policy_dir, RecursiveMode::NonRecursive)
                .context("Failed to watch policy directory")?;
        } else {
            warn!(path = %policy_dir.display(), "Policy directory missing, not watching it");
        }
        if helpers_dir.is_dir() && helpers_dir != policy_dir {
            watcher
                .watch(&helpers_dir, RecursiveMode::NonRecursive)
                .context("Failed to watch helpers directory")?;
        }

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event: notify::Event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(error = %err, "Watcher error");
                        continue;
                    }
                };
                if !event
                    .paths
                    .iter()
                    .any(|path| is_relevant(path, &policy_path, &helpers_dir))
                {
                    continue;
                }

                let now = Instant::now();
                *last_seen.lock() = Some(now);

                let last_seen = last_seen.clone();
                let on_change = on_change.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(DEBOUNCE).await;
                    let should_fire = {
                        let mut guard = last_seen.lock();
                        match *guard {
                            Some(seen) if seen == now => {
                                *guard = None;
                                true
                            }
                            _ => false,
                        }
                    };
                    if should_fire {
                        debug!("Policy inputs changed");
                        on_change();
                    }
                });
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

fn is_relevant(path: &Path, policy_path: &Path, helpers_dir: &Path) -> bool {
    if path == policy_path {
        return true;
    }
    path.parent() == Some(helpers_dir) && path.extension().is_some_and(|ext| ext == "toml")
}
