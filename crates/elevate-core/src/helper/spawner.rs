//! Starting helper processes.

use crate::registry::HelperManifest;
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle on whatever runs a helper, used to stop it.
#[async_trait]
pub trait HelperProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Wait up to `grace` for the helper to exit on its own, then kill it.
    /// Its input has already been closed.
    async fn terminate(&mut self, grace: Duration);
}

/// A freshly started helper: the protocol channel plus its process.
pub struct HelperChannel {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Box<dyn HelperProcess>,
}

#[async_trait]
pub trait HelperSpawner: Send + Sync {
    async fn spawn(&self, manifest: &HelperManifest) -> io::Result<HelperChannel>;
}

/// Spawns the manifest's executable and speaks the protocol over its
/// stdin/stdout. Helper stderr is re-emitted under the `helper` target.
#[derive(Debug, Default, Clone)]
pub struct ProcessSpawner;

#[async_trait]
impl HelperSpawner for ProcessSpawner {
    async fn spawn(&self, manifest: &HelperManifest) -> io::Result<HelperChannel> {
        let mut cmd = Command::new(&manifest.executable);
        cmd.args(&manifest.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("helper stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("helper stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            let helper_id = manifest.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "helper", helper_id = %helper_id, "{}", line);
                }
            });
        }

        info!(helper_id = %manifest.id, pid = ?child.id(), "Spawned helper");
        Ok(HelperChannel {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess {
                helper_id: manifest.id.clone(),
                child,
            }),
        })
    }
}

struct ChildProcess {
    helper_id: String,
    child: Child,
}

#[async_trait]
impl HelperProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(helper_id = %self.helper_id, %status, "Helper exited"),
            Ok(Err(err)) => warn!(helper_id = %self.helper_id, error = %err, "Failed to wait for helper"),
            Err(_) => {
                warn!(helper_id = %self.helper_id, "Helper ignored shutdown, killing it");
                if let Err(err) = self.child.kill().await {
                    warn!(helper_id = %self.helper_id, error = %err, "Failed to kill helper");
                }
            }
        }
    }
}
