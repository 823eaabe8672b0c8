use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the process-wide tracing subscriber: stderr output, filtered by
/// `RUST_LOG` (default `info`). Call once, early in `main`.
pub fn init() {
    let stderr_logs = fmt::Layer::new()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(stderr_logs)
        .init();
}
