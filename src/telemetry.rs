//! Diagnostic tracing for convoy.
//!
//! Diagnostics go to stderr so command output on stdout stays scriptable.
//! Per-task agent logs are product artifacts written by the launcher and are
//! unaffected by the filter here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CONVOY_LOG";

/// Initialize the tracing subscriber.
///
/// Reads `CONVOY_LOG`, then `RUST_LOG`. Defaults to `warn` if neither parses.
/// Set `CONVOY_LOG_FORMAT=json` for one JSON object per event.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var("CONVOY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .init();
    }
}
