use anyhow::{Context, Result};
use std::path::PathBuf;

const ELEVATE_DIR: &str = ".elevate";
const SYSTEM_DIR: &str = "/etc/elevate";
const CONFIG_FILE: &str = "broker.toml";
const POLICY_FILE: &str = "policy.toml";
const HELPERS_DIR: &str = "helpers";
const LOGS_DIR: &str = "logs";
const SOCKET_FILE: &str = "broker.sock";
const PID_FILE: &str = "broker.pid";

/// Environment variable to override the elevate directory.
pub const ELEVATE_DIR_ENV: &str = "ELEVATE_DIR";
/// Environment variable to override the broker socket path.
pub const ELEVATE_SOCKET_ENV: &str = "ELEVATE_SOCKET";
/// Environment variable to override the broker config file.
pub const ELEVATE_CONFIG_ENV: &str = "ELEVATE_CONFIG";

/// Resolve the elevate directory.
/// Priority: ELEVATE_DIR env var > /etc/elevate (root) > ~/.elevate/
pub fn resolve_elevate_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ELEVATE_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    if is_root() {
        return Ok(PathBuf::from(SYSTEM_DIR));
    }
    dirs::home_dir()
        .map(|h| h.join(ELEVATE_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Ensure the elevate directory exists and return its path.
pub fn ensure_elevate_dir() -> Result<PathBuf> {
    let dir = resolve_elevate_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir)
}

/// Broker config file: ELEVATE_CONFIG env var > <dir>/broker.toml
pub fn config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(ELEVATE_CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    Ok(resolve_elevate_dir()?.join(CONFIG_FILE))
}

pub fn default_policy_path() -> Result<PathBuf> {
    Ok(resolve_elevate_dir()?.join(POLICY_FILE))
}

pub fn default_helpers_dir() -> Result<PathBuf> {
    Ok(resolve_elevate_dir()?.join(HELPERS_DIR))
}

pub fn default_logs_dir() -> Result<PathBuf> {
    Ok(resolve_elevate_dir()?.join(LOGS_DIR))
}

pub fn default_socket_path() -> Result<PathBuf> {
    Ok(resolve_elevate_dir()?.join(SOCKET_FILE))
}

/// Socket override from the environment, if set.
pub fn socket_from_env() -> Option<PathBuf> {
    std::env::var(ELEVATE_SOCKET_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
}

/// PID file of a running broker: <dir>/broker.pid
pub fn broker_pid_path() -> Result<PathBuf> {
    Ok(resolve_elevate_dir()?.join(PID_FILE))
}

fn is_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(not(unix))]
    {
        false
    }
}
