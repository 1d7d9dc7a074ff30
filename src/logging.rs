use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber: timestamped lines on standard error, filtered by
/// `RUST_LOG` (default `info`).
///
/// Standard error is looked up on every write, so output follows a later `dup2()` onto fd 2.
pub fn configure_logging() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
