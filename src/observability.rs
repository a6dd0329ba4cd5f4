// src/observability.rs
//! Tracing initialization

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Filtering comes from `RUST_LOG`, defaulting to `info` for this crate.
/// Safe to call once per process; later calls fail quietly so tests can
/// race on it.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "virtops_engine=info".into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
