mod cli;
mod commands;
mod completions;
mod error;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{BrokerCommands, Cli, Commands};
use commands::CliContext;
use elevate_core::logging::{LogOutput, init_tracing};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error::handle_error(err);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = CliContext {
        config_path: cli.config,
        socket_path: cli.socket,
        verbose: cli.verbose,
        format: cli.format,
    };

    // A foreground broker picks its own log output.
    let runs_broker = matches!(
        cli.command,
        Commands::Broker {
            command: BrokerCommands::Start {
                foreground: true,
                ..
            }
        }
    );
    if !runs_broker {
        let _ = init_tracing(LogOutput::Stderr, ctx.log_directive());
    }

    match cli.command {
        Commands::Completions { shell } => {
            completions::generate_completions(shell);
            Ok(())
        }
        Commands::Broker { command } => commands::broker::run(&ctx, command).await,
        Commands::Exec(args) => commands::exec::run(&ctx, args).await,
        Commands::Policy { command } => commands::policy::run(&ctx, command),
        Commands::Helpers { command } => commands::helpers::run(&ctx, command),
    }
}
