// src/logging.rs
//! Tracing subscriber setup for binaries embedding the engine.
//!
//! The engine only emits `tracing` events. Worker threads forward them to
//! the dispatcher captured when the [`ServiceContext`](crate::ServiceContext)
//! was built, so install a subscriber *before* building the context:
//!
//! ```rust,no_run
//! etude::logging::init_logging();
//! ```
//!
//! The level is read from `RUST_LOG` and defaults to `info`:
//!
//! ```bash
//! # Connection lifecycle and per-request traces
//! RUST_LOG=etude=trace cargo run --example hello
//!
//! # Only bad requests and failures
//! RUST_LOG=warn cargo run --example hello
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Plain formatted logs to stdout, `RUST_LOG` or `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already set.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`], with `level` as the fallback when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber is already set.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Multi-line output with thread ids and source lines, for development.
///
/// # Panics
///
/// Panics if a global subscriber is already set.
pub fn init_logging_pretty() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true),
        )
        .init();
}

/// One JSON object per event, for log aggregation.
///
/// # Panics
///
/// Panics if a global subscriber is already set.
pub fn init_logging_json() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
        .init();
}

/// Build a dispatcher without installing it globally; useful in tests and
/// for handing a dedicated sink to [`ServiceContextBuilder::dispatch`].
///
/// [`ServiceContextBuilder::dispatch`]: crate::ServiceContextBuilder::dispatch
pub fn dispatch_with_level(level: &str) -> tracing::Dispatch {
    let subscriber = tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true));
    tracing::Dispatch::new(subscriber)
}
