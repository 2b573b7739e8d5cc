use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber. Stdout carries the broker protocol, so
/// nothing may be logged there. Safe to call more than once.
pub fn init_helper_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
