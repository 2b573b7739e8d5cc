use crate::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "elevate")]
#[command(version, about = "Elevate - run privileged actions through a policy-checked broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Broker config file (defaults to <elevate dir>/broker.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Broker socket path
    #[arg(long, global = true, env = "ELEVATE_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Broker management
    Broker {
        #[command(subcommand)]
        command: BrokerCommands,
    },

    /// Run an action through the broker
    Exec(ExecArgs),

    /// Inspect authorization policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Inspect registered helpers
    Helpers {
        #[command(subcommand)]
        command: HelperCommands,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum BrokerCommands {
    /// Start the broker
    Start {
        /// Run in the foreground instead of detaching
        #[arg(long)]
        foreground: bool,

        /// Log to daily files in the log directory
        #[arg(long, hide = true)]
        log_to_file: bool,
    },

    /// Stop the broker
    Stop,

    /// Show broker status
    Status,

    /// Reload policy and helper manifests
    Reload,
}

#[derive(Args)]
pub struct ExecArgs {
    /// Action name, e.g. org.example.write
    pub action: String,

    /// Helper that must own the action
    #[arg(long)]
    pub helper: Option<String>,

    /// Action argument as key=value; values that parse as JSON keep their type
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    pub args: Vec<String>,

    /// Timeout in milliseconds (broker default when omitted)
    #[arg(long)]
    pub timeout_ms: Option<i64>,

    /// Only check authorization, do not run the helper
    #[arg(long)]
    pub authorize_only: bool,

    /// Message shown in the authentication prompt
    #[arg(long)]
    pub message: Option<String>,
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Evaluate the policy for an action without running it
    Check {
        action: String,

        /// Evaluate for this user instead of the caller
        #[arg(long)]
        uid: Option<u32>,
    },

    /// List policy store entries
    List,
}

#[derive(Subcommand)]
pub enum HelperCommands {
    /// List helpers and the actions they own
    List,
}
