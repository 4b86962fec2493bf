//! Structured logging for the dispatcher.
//!
//! Log levels:
//! - ERROR: a batch event or actor could not be processed
//! - WARN: recoverable trouble (publish retries, task failures, rejections)
//! - INFO: batch lifecycle (accepted, started, drained, result published)
//! - DEBUG: per-message traces (context requests, discards, routing)
//!
//! Debug mode can be enabled with `--debug` or `DISPATCHER_DEBUG=1`. An
//! explicit `RUST_LOG` always wins. Output goes to stderr so stdout stays free
//! for the JSON-lines transport.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let filter = build_filter(debug || debug_from_env(), std::env::var("RUST_LOG").ok());
    // A second init (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn debug_from_env() -> bool {
    std::env::var("DISPATCHER_DEBUG")
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_level(debug: bool) -> Level {
    if debug {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

fn build_filter(debug: bool, rust_log: Option<String>) -> EnvFilter {
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::builder()
            .with_default_directive(default_level(debug).into())
            .parse_lossy(""),
    }
}
