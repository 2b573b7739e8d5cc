//! Broker configuration.

use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Default configuration constants
const DEFAULT_TIMEOUT_MS: u64 = 300_000; // 5 minutes
const DEFAULT_HELPER_IDLE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PROMPT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_AUTH_KEEP_SECS: u64 = 300;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HELPER_SHUTDOWN_GRACE_MS: u64 = 2_000;
const MIN_TIMEOUT_MS: u64 = 100;
const MIN_HANDSHAKE_TIMEOUT_MS: u64 = 50;

/// Broker configuration, read from `broker.toml`.
///
/// Unset paths fall back to locations under the elevate directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub socket_path: Option<PathBuf>,
    pub policy_path: Option<PathBuf>,
    pub helpers_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Deadline for actions that do not carry their own timeout.
    pub default_timeout_ms: u64,
    pub helper_idle_timeout_secs: u64,
    /// Bounds the protocol handshake with helpers and with clients.
    pub handshake_timeout_ms: u64,
    pub prompt_timeout_secs: u64,
    /// Authentication agent program. Without one every prompt fails.
    pub prompt_command: Option<PathBuf>,
    pub auth_keep_secs: u64,
    pub drain_timeout_secs: u64,
    pub helper_shutdown_grace_ms: u64,
    pub watch_policy: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            policy_path: None,
            helpers_dir: None,
            log_dir: None,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            helper_idle_timeout_secs: DEFAULT_HELPER_IDLE_TIMEOUT_SECS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            prompt_timeout_secs: DEFAULT_PROMPT_TIMEOUT_SECS,
            prompt_command: None,
            auth_keep_secs: DEFAULT_AUTH_KEEP_SECS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            helper_shutdown_grace_ms: DEFAULT_HELPER_SHUTDOWN_GRACE_MS,
            watch_policy: true,
        }
    }
}

impl BrokerConfig {
    /// Load the config file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `--config`, `ELEVATE_CONFIG` or the elevate directory.
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Self::load(&paths::config_path()?),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms < MIN_TIMEOUT_MS {
            return Err(anyhow::anyhow!(
                "Default timeout must be at least {} ms",
                MIN_TIMEOUT_MS
            ));
        }

        if self.handshake_timeout_ms < MIN_HANDSHAKE_TIMEOUT_MS {
            return Err(anyhow::anyhow!(
                "Handshake timeout must be at least {} ms",
                MIN_HANDSHAKE_TIMEOUT_MS
            ));
        }

        if self.helper_idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Helper idle timeout must be at least 1 second"));
        }

        if self.prompt_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Prompt timeout must be at least 1 second"));
        }

        if let Some(command) = &self.prompt_command
            && command.as_os_str().is_empty()
        {
            return Err(anyhow::anyhow!("Prompt command must not be empty"));
        }

        Ok(())
    }

    /// Socket path: ELEVATE_SOCKET env var > config > <dir>/broker.sock
    pub fn resolve_socket_path(&self) -> Result<PathBuf> {
        if let Some(path) = paths::socket_from_env() {
            return Ok(path);
        }
        match &self.socket_path {
            Some(path) => Ok(path.clone()),
            None => paths::default_socket_path(),
        }
    }

    pub fn resolve_policy_path(&self) -> Result<PathBuf> {
        match &self.policy_path {
            Some(path) => Ok(path.clone()),
            None => paths::default_policy_path(),
        }
    }

    pub fn resolve_helpers_dir(&self) -> Result<PathBuf> {
        match &self.helpers_dir {
            Some(path) => Ok(path.clone()),
            None => paths::default_helpers_dir(),
        }
    }

    pub fn resolve_log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(path) => Ok(path.clone()),
            None => paths::default_logs_dir(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn helper_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn auth_keep(&self) -> Duration {
        Duration::from_secs(self.auth_keep_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn helper_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.helper_shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_lock;

    #[test]
    fn test_defaults_are_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_timeout(), Duration::from_secs(300));
        assert_eq!(config.helper_idle_timeout(), Duration::from_secs(10));
        assert!(config.watch_policy);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broker.toml");
        std::fs::write(
            &path,
            "default_timeout_ms = 1500\nwatch_policy = false\npolicy_path = \"/srv/policy.toml\"\n",
        )
        .unwrap();

        let config = BrokerConfig::load(&path).unwrap();
        assert_eq!(config.default_timeout_ms, 1500);
        assert!(!config.watch_policy);
        assert_eq!(
            config.resolve_policy_path().unwrap(),
            PathBuf::from("/srv/policy.toml")
        );
        assert_eq!(config.auth_keep_secs, DEFAULT_AUTH_KEEP_SECS);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = BrokerConfig::load(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broker.toml");
        std::fs::write(&path, "default_timeout_ms = 5\n").unwrap();
        assert!(BrokerConfig::load(&path).is_err());

        let config = BrokerConfig {
            helper_idle_timeout_secs: 0,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socket_resolution_order() {
        let _lock = env_lock();
        let config = BrokerConfig {
            socket_path: Some(PathBuf::from("/run/elevate/custom.sock")),
            ..BrokerConfig::default()
        };
        assert_eq!(
            config.resolve_socket_path().unwrap(),
            PathBuf::from("/run/elevate/custom.sock")
        );

        unsafe { std::env::set_var(paths::ELEVATE_SOCKET_ENV, "/tmp/env.sock") };
        assert_eq!(
            config.resolve_socket_path().unwrap(),
            PathBuf::from("/tmp/env.sock")
        );
        unsafe { std::env::remove_var(paths::ELEVATE_SOCKET_ENV) };
    }
}
