use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const BROKER_LOG_PREFIX: &str = "broker.log";

/// Where log output goes.
#[derive(Debug, Clone)]
pub enum LogOutput {
    Stderr,
    /// Daily rolling files in this directory.
    Daily(PathBuf),
}

/// Install the global subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Keep the returned guard alive for as long as file output should be
/// flushed.
pub fn init_tracing(output: LogOutput, default_directive: &str) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    match output {
        LogOutput::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init()
                .map_err(|err| anyhow::anyhow!("Failed to install log subscriber: {err}"))?;
            Ok(None)
        }
        LogOutput::Daily(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, BROKER_LOG_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_level(true)
                .try_init()
                .map_err(|err| anyhow::anyhow!("Failed to install log subscriber: {err}"))?;
            Ok(Some(guard))
        }
    }
}
