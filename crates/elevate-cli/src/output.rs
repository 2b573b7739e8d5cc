use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use comfy_table::Table;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use elevate_contracts::{ActionReply, AuthorizationStatus, ReplyStatus};
use serde::Serialize;

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header);
    table
}

pub fn status_label(status: AuthorizationStatus) -> String {
    let label = status.to_string();
    match status {
        AuthorizationStatus::Authorized => label.green().to_string(),
        AuthorizationStatus::AuthRequired => label.yellow().to_string(),
        _ => label.red().to_string(),
    }
}

/// One-line summary of a failed reply.
pub fn describe_failure(reply: &ActionReply) -> String {
    let status = match reply.status {
        ReplyStatus::Success => "succeeded",
        ReplyStatus::Failed => "failed",
        ReplyStatus::UserCancelled => "was cancelled",
        ReplyStatus::AuthorizationDenied => "was not authorized",
        ReplyStatus::HelperBusy => "was rejected: helper busy",
        ReplyStatus::InvalidAction => "is not a registered action",
    };
    match (&reply.error_description, reply.error()) {
        (Some(description), _) => format!("Action {status}: {description}"),
        (None, Some(code)) => format!("Action {status} ({code:?}, code {})", code.code()),
        (None, None) => format!("Action {status} (helper error {})", reply.error_code),
    }
}
