pub mod broker;
pub mod exec;
pub mod helpers;
pub mod policy;

use crate::output::OutputFormat;
use anyhow::{Context, Result};
use elevate_core::{BrokerConfig, HelperRegistry};
use std::path::PathBuf;

/// Global options shared by every command.
pub struct CliContext {
    pub config_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub verbose: bool,
    pub format: OutputFormat,
}

impl CliContext {
    /// Broker config with `--socket` applied on top.
    pub fn load_config(&self) -> Result<BrokerConfig> {
        let mut config = BrokerConfig::load_default(self.config_path.as_deref())?;
        if let Some(socket) = &self.socket_path {
            config.socket_path = Some(socket.clone());
        }
        Ok(config)
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.socket_path {
            Some(socket) => Ok(socket.clone()),
            None => self.load_config()?.resolve_socket_path(),
        }
    }

    pub fn log_directive(&self) -> &'static str {
        if self.verbose { "debug" } else { "warn" }
    }

    pub fn broker_log_directive(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }
}

pub fn load_registry(config: &BrokerConfig) -> Result<HelperRegistry> {
    let dir = config.resolve_helpers_dir()?;
    HelperRegistry::load_dir(&dir)
        .with_context(|| format!("Failed to load helpers from {}", dir.display()))
}
