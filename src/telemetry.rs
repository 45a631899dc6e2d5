//! Tracing initialization for engine binaries and tests.
//!
//! The engine itself only emits through `tracing`; this module wires the
//! subscriber stack (env-filter, fmt, span-trace capture) for processes that
//! embed the engine. Call [`init_tracing`] once at startup.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber.
///
/// Filter resolution: `LLMCTL_LOG` env var, then `RUST_LOG`, then the
/// provided default directive. Calling twice is a no-op (the second install
/// fails quietly), which keeps test binaries safe.
pub fn init_tracing(default_directive: &str) {
    let filter = std::env::var("LLMCTL_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_directive.to_string());
    let env_filter = EnvFilter::try_new(filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(ErrorLayer::default())
        .try_init();
}

/// Convenience wrapper with the engine's default verbosity.
pub fn init_default_tracing() {
    init_tracing("info,llmctl_engine=debug");
}
