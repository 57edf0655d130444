use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Reads `RUST_LOG` for filtering and falls back to `info`. Output goes to
/// stderr so stdout carries nothing but events.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
