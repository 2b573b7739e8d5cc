use crate::paths;
use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

const STARTUP_LOG: &str = "broker.out";

#[derive(Debug, Clone, PartialEq)]
pub enum DaemonStatus {
    Running { pid: u32 },
    NotRunning,
    Stale { pid: u32 },
}

/// Options forwarded to a broker started in the background.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub config_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub verbose: bool,
}

/// Starts, stops and signals the broker process through its pid file.
pub struct ProcessManager {
    pid_file: PathBuf,
    log_dir: PathBuf,
}

impl ProcessManager {
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            pid_file: paths::broker_pid_path()?,
            log_dir,
        })
    }

    pub fn with_pid_file(pid_file: PathBuf, log_dir: PathBuf) -> Self {
        Self { pid_file, log_dir }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Re-run the current executable as a foreground broker in a new
    /// session and wait until it has written its pid file.
    pub fn start(&self, options: &StartOptions) -> Result<u32> {
        if let Some(pid) = self.get_running_pid()? {
            return Ok(pid);
        }

        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        if let Some(config) = &options.config_path {
            cmd.arg("--config").arg(config);
        }
        if let Some(socket) = &options.socket_path {
            cmd.arg("--socket").arg(socket);
        }
        if options.verbose {
            cmd.arg("--verbose");
        }
        cmd.args(["broker", "start", "--foreground", "--log-to-file"]);

        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create {}", self.log_dir.display()))?;
        let log = File::create(self.log_dir.join(STARTUP_LOG))?;
        cmd.stdout(log.try_clone()?);
        cmd.stderr(log);
        cmd.stdin(Stdio::null());

        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::other)
                });
            }
        }

        let mut child = cmd.spawn()?;
        let bootstrap_pid = child.id();

        std::thread::sleep(Duration::from_millis(150));
        if let Some(status) = child.try_wait()? {
            anyhow::bail!(
                "Broker exited early with status {} (see {})",
                status,
                self.log_dir.join(STARTUP_LOG).display()
            );
        }

        // The broker writes its pid file once the socket is bound.
        for _ in 0..60 {
            if let Some(pid) = self.get_running_pid()? {
                return Ok(pid);
            }
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("Broker exited during startup with status {}", status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        warn!(
            bootstrap_pid,
            "Broker started but PID file not available yet; returning bootstrap pid"
        );
        Ok(bootstrap_pid)
    }

    /// Send SIGTERM and wait for the broker to exit.
    pub fn stop(&self) -> Result<bool> {
        let Some(pid) = self.get_running_pid()? else {
            return Ok(false);
        };
        signal(pid, Signal::SIGTERM)?;
        info!(pid, "Sent stop signal to broker");

        for _ in 0..150 {
            if !is_process_alive(pid) {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        let _ = std::fs::remove_file(&self.pid_file);
        Ok(true)
    }

    /// Ask a running broker to reload helpers and policy.
    pub fn reload(&self) -> Result<bool> {
        let Some(pid) = self.get_running_pid()? else {
            return Ok(false);
        };
        signal(pid, Signal::SIGHUP)?;
        info!(pid, "Sent reload signal to broker");
        Ok(true)
    }

    pub fn status(&self) -> Result<DaemonStatus> {
        if !self.pid_file.exists() {
            return Ok(DaemonStatus::NotRunning);
        }
        let Some(pid) = self.read_pid()? else {
            return Ok(DaemonStatus::NotRunning);
        };
        if is_process_alive(pid) {
            Ok(DaemonStatus::Running { pid })
        } else {
            let _ = std::fs::remove_file(&self.pid_file);
            Ok(DaemonStatus::Stale { pid })
        }
    }

    pub fn get_running_pid(&self) -> Result<Option<u32>> {
        match self.status()? {
            DaemonStatus::Running { pid } => Ok(Some(pid)),
            _ => Ok(None),
        }
    }

    /// Record the current process as the running broker.
    pub fn write_pid_file(&self) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.pid_file, std::process::id().to_string())
            .with_context(|| format!("Failed to write {}", self.pid_file.display()))
    }

    pub fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
    }

    fn read_pid(&self) -> Result<Option<u32>> {
        let pid_str = std::fs::read_to_string(&self.pid_file)?;
        match pid_str.trim().parse() {
            Ok(pid) => Ok(Some(pid)),
            Err(err) => {
                warn!(
                    path = %self.pid_file.display(),
                    error = %err,
                    "Invalid broker PID file contents; removing stale file"
                );
                let _ = std::fs::remove_file(&self.pid_file);
                Ok(None)
            }
        }
    }
}

fn signal(pid: u32, signal: Signal) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    kill(Pid::from_raw(pid), signal)?;
    Ok(())
}

fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), None).is_ok()
}
