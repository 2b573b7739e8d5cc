use super::CliContext;
use crate::cli::BrokerCommands;
use crate::output::print_json;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use elevate_core::Broker;
use elevate_core::daemon::{
    BrokerDaemon, DaemonStatus, ProcessManager, StartOptions, is_broker_available,
};
use elevate_core::logging::{LogOutput, init_tracing};
use serde_json::json;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(ctx: &CliContext, command: BrokerCommands) -> Result<()> {
    match command {
        BrokerCommands::Start {
            foreground: true,
            log_to_file,
        } => run_foreground(ctx, log_to_file).await,
        BrokerCommands::Start { .. } => start_background(ctx),
        BrokerCommands::Stop => stop(ctx),
        BrokerCommands::Status => status(ctx).await,
        BrokerCommands::Reload => reload(ctx),
    }
}

fn process_manager(ctx: &CliContext) -> Result<ProcessManager> {
    let config = ctx.load_config()?;
    ProcessManager::new(config.resolve_log_dir()?)
}

/// Run the broker in this process until SIGTERM or Ctrl+C.
pub async fn run_foreground(ctx: &CliContext, log_to_file: bool) -> Result<()> {
    let config = ctx.load_config()?;
    let log_dir = config.resolve_log_dir()?;
    let output = if log_to_file {
        LogOutput::Daily(log_dir.clone())
    } else {
        LogOutput::Stderr
    };
    let _guard = init_tracing(output, ctx.broker_log_directive())?;

    let manager = ProcessManager::new(log_dir)?;
    if let Some(pid) = manager.get_running_pid()?
        && pid != std::process::id()
    {
        bail!("Broker already running (PID: {pid})");
    }

    let socket_path = config.resolve_socket_path()?;
    let broker = Broker::builder(config).build()?;
    let daemon = BrokerDaemon::bind(broker, socket_path)?;
    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;
    // Signal handlers are in place before anyone can find us.
    manager.write_pid_file()?;

    if !log_to_file {
        println!("Broker running. Press Ctrl+C to stop.");
    }

    let result = daemon.run(shutdown).await;
    manager.remove_pid_file();
    info!("Broker exited");
    result
}

fn watch_signals(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}

fn start_background(ctx: &CliContext) -> Result<()> {
    let manager = process_manager(ctx)?;
    if let DaemonStatus::Running { pid } = manager.status()? {
        println!("Broker already running (PID: {pid})");
        return Ok(());
    }

    let pid = manager.start(&StartOptions {
        config_path: ctx.config_path.clone(),
        socket_path: ctx.socket_path.clone(),
        verbose: ctx.verbose,
    })?;
    if ctx.format.is_json() {
        return print_json(&json!({ "started": true, "pid": pid }));
    }
    println!("{} (PID: {pid})", "Broker started".green());
    Ok(())
}

fn stop(ctx: &CliContext) -> Result<()> {
    let stopped = process_manager(ctx)?.stop()?;
    if ctx.format.is_json() {
        return print_json(&json!({ "stopped": stopped }));
    }
    if stopped {
        println!("Broker stopped");
    } else {
        println!("Broker not running");
    }
    Ok(())
}

fn reload(ctx: &CliContext) -> Result<()> {
    let signalled = process_manager(ctx)?.reload()?;
    if ctx.format.is_json() {
        return print_json(&json!({ "reloaded": signalled }));
    }
    if signalled {
        println!("Sent reload signal to broker");
    } else {
        println!("Broker not running");
    }
    Ok(())
}

async fn status(ctx: &CliContext) -> Result<()> {
    let config = ctx.load_config()?;
    let socket_path = config.resolve_socket_path()?;
    let manager = ProcessManager::new(config.resolve_log_dir()?)?;
    let status = manager.status()?;
    let reachable = is_broker_available(&socket_path).await;

    let (label, pid, stale_pid) = match status {
        DaemonStatus::Running { pid } => ("running", Some(pid), None),
        DaemonStatus::NotRunning => ("not_running", None, None),
        DaemonStatus::Stale { pid } => ("stale", None, Some(pid)),
    };

    if ctx.format.is_json() {
        return print_json(&json!({
            "broker_status": label,
            "pid": pid,
            "stale_pid": stale_pid,
            "socket_reachable": reachable,
            "socket_path": socket_path,
            "pid_path": manager.pid_file(),
            "policy_path": config.resolve_policy_path()?,
            "helpers_dir": config.resolve_helpers_dir()?,
        }));
    }

    println!("Elevate Status");
    match status {
        DaemonStatus::Running { pid } => println!("Broker: {} (PID: {pid})", "running".green()),
        DaemonStatus::NotRunning => println!("Broker: {}", "not running".yellow()),
        DaemonStatus::Stale { pid } => {
            println!("Broker: {} (PID: {pid})", "stale pid file".red())
        }
    }
    let socket_state = if reachable { "reachable" } else { "unreachable" };
    println!("Socket: {} ({socket_state})", socket_path.display());
    println!("PID file: {}", manager.pid_file().display());
    println!("Policy: {}", config.resolve_policy_path()?.display());
    println!("Helpers: {}", config.resolve_helpers_dir()?.display());
    Ok(())
}
