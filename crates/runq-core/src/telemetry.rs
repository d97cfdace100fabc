use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset: our crates at `info`, RocksDB
/// bindings and other dependencies at `warn`.
pub const DEFAULT_FILTER: &str = "warn,runq_core=info,runq_server=info";

/// Install the global tracing subscriber.
///
/// Debug builds log human-readable lines with targets; release builds log
/// JSON so worker fleets can ship logs to an aggregator as-is.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .init();
    }
}
