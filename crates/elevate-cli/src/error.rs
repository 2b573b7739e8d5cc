use colored::Colorize;

pub fn handle_error(err: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let msg = format!("{err:#}").to_lowercase();

    if msg.contains("failed to connect to broker") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Start the broker with:");
        eprintln!("  {} elevate broker start", "$".dimmed());
    }

    if msg.contains("not a registered action") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  List registered actions with:");
        eprintln!("  {} elevate helpers list", "$".dimmed());
    }

    if msg.contains("permission denied") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  The broker directory may belong to another user. Set ELEVATE_DIR or run as root.");
    }

    std::process::exit(1);
}
