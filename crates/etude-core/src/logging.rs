//! Tracing subscriber setup.
//!
//! The level comes from `RUST_LOG` when set, otherwise from the argument
//! (or `info`):
//!
//! ```bash
//! RUST_LOG=etude_core=debug etude 8080 --root ./public
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Human-readable logs at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Human-readable logs at `level`. Thread names are included so reactor and
/// worker output can be told apart.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// One JSON object per event, for log shippers.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .init();
}
