use tracing_subscriber::EnvFilter;

/// Installs a compact, env-filterable subscriber. `RUST_LOG` (default
/// `info`) controls verbosity the same way it does for any other binary
/// built on `tracing-subscriber`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();
}
