//! Tracing subscriber setup shared by the worker and `afctl`.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to stderr. `RUST_LOG` overrides
/// the default filter.
///
/// Subsequent calls are no-ops.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,analysisflow=debug"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
