//! Structured logging setup.
//!
//! `DEBUG_IVM=1` forces a debug-level default filter; otherwise the standard
//! `RUST_LOG` environment variable is respected. Installed once by the CLI
//! binary's `main()`; library consumers embedding the engine elsewhere are
//! expected to install their own subscriber and simply benefit from the
//! `tracing` spans emitted by plan compilation and run execution.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber. Safe to call multiple times from
/// tests; subsequent calls are no-ops if a subscriber is already installed.
pub fn init() {
    let default_directive = if std::env::var("DEBUG_IVM").as_deref() == Ok("1") {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
