//! Agent diagnostics via `tracing`.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: agent progress and diagnostics, filtered by
//!   `RUST_LOG` and `-v`, written to stderr.
//!
//! - **Process console output (`io/splitter`)**: lines printed by scripts and
//!   tools are forwarded verbatim to stdout, unaffected by the log filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter for a given number of `-v` flags.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "convey=debug,info",
        _ => "trace",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level follows `verbosity`.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=convey::stack=debug convey deploy --package app.zip
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
