use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "vidshelf=info,tower_http=info";

/// Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
/// [`DEFAULT_FILTER`]. Calling it twice is harmless; the second call is a
/// no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
