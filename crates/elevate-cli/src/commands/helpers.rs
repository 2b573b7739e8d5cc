use super::{CliContext, load_registry};
use crate::cli::HelperCommands;
use crate::output::{print_json, table};
use anyhow::Result;
use comfy_table::Cell;
use elevate_core::HelperManifest;

pub fn run(ctx: &CliContext, command: HelperCommands) -> Result<()> {
    match command {
        HelperCommands::List => list(ctx),
    }
}

fn list(ctx: &CliContext) -> Result<()> {
    let config = ctx.load_config()?;
    let registry = load_registry(&config)?;
    let mut helpers: Vec<&HelperManifest> = registry.helpers().map(|helper| helper.as_ref()).collect();
    helpers.sort_by(|a, b| a.id.cmp(&b.id));

    if ctx.format.is_json() {
        return print_json(&helpers);
    }

    if helpers.is_empty() {
        println!(
            "No helpers registered in {}.",
            config.resolve_helpers_dir()?.display()
        );
        return Ok(());
    }

    let default_idle = config.helper_idle_timeout().as_secs();
    let mut helper_table = table(vec![
        "Helper",
        "Executable",
        "Actions",
        "Max Concurrent",
        "Idle Timeout",
    ]);
    for helper in helpers {
        let actions: Vec<&str> = helper.actions.iter().map(|a| a.name.as_str()).collect();
        let idle = helper
            .idle_timeout()
            .map(|idle| format!("{}s", idle.as_secs()))
            .unwrap_or_else(|| format!("{default_idle}s (default)"));
        helper_table.add_row(vec![
            Cell::new(&helper.id),
            Cell::new(helper.executable.display()),
            Cell::new(actions.join("\n")),
            Cell::new(helper.max_concurrent),
            Cell::new(idle),
        ]);
    }
    println!("{helper_table}");
    Ok(())
}
