use super::CliContext;
use crate::cli::ExecArgs;
use crate::output::{describe_failure, print_json};
use anyhow::{Result, anyhow, bail};
use colored::Colorize;
use elevate_contracts::{Action, ActionReply, ExecutionMode, ProgressUpdate};
use elevate_core::RequestEvent;
use elevate_core::daemon::BrokerClient;
use serde_json::Value;

pub async fn run(ctx: &CliContext, args: ExecArgs) -> Result<()> {
    let action = build_action(args)?;
    let client = BrokerClient::connect(&ctx.socket_path()?).await?;
    let mut job = client.execute(action)?;

    let mut cancel_sent = false;
    let reply = loop {
        let event = tokio::select! {
            event = job.next_event() => event?,
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                job.cancel()?;
                cancel_sent = true;
                eprintln!("{}", "Cancelling...".yellow());
                continue;
            }
        };
        match event {
            Some(RequestEvent::State(state)) => {
                if ctx.verbose && !ctx.format.is_json() {
                    eprintln!("{} {state}", "->".dimmed());
                }
            }
            Some(RequestEvent::Progress(update)) => {
                if !ctx.format.is_json() {
                    print_progress(&update);
                }
            }
            Some(RequestEvent::Reply(reply)) => break reply,
            None => bail!("Broker closed the request without a reply"),
        }
    };

    report(ctx, &reply)?;
    if reply.failed() {
        bail!(describe_failure(&reply));
    }
    Ok(())
}

fn build_action(args: ExecArgs) -> Result<Action> {
    let mut action = Action::new(args.action);
    if let Some(helper) = args.helper {
        action = action.with_helper(helper);
    }
    for raw in &args.args {
        let (key, value) = parse_argument(raw)?;
        action = action.with_argument(key, value);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        action = action.with_timeout_ms(timeout_ms);
    }
    if args.authorize_only {
        action = action.with_mode(ExecutionMode::AuthorizeOnly);
    }
    if let Some(message) = args.message {
        action = action.with_message(message);
    }
    if !action.is_valid() {
        bail!("'{}' is not a valid action name", action.name);
    }
    Ok(action)
}

/// Split `key=value`. Values that parse as JSON keep their type, anything
/// else is a string.
fn parse_argument(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid argument '{raw}', expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid argument '{raw}', key is empty");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_progress(update: &ProgressUpdate) {
    match update {
        ProgressUpdate::Percent(percent) => eprintln!("{} {percent:>3}%", "progress".cyan()),
        ProgressUpdate::Data(data) => {
            let rendered = serde_json::to_string(data).unwrap_or_default();
            eprintln!("{} {rendered}", "progress".cyan());
        }
    }
}

fn report(ctx: &CliContext, reply: &ActionReply) -> Result<()> {
    if ctx.format.is_json() {
        return print_json(reply);
    }
    if reply.succeeded() {
        println!("{}", "Action completed".green());
        for (key, value) in &reply.data {
            match value {
                Value::String(text) => println!("  {key}: {text}"),
                other => println!("  {key}: {other}"),
            }
        }
    }
    Ok(())
}
