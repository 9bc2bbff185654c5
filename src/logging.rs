use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. Output goes to stderr so
/// that stdout only carries the JSON written by the binaries.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
