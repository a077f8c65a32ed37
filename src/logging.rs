//! Structured logging setup
//!
//! Grounded on the teacher's pervasive `tracing`/`#[instrument]` usage; the
//! Jaeger/OTEL export pipeline the teacher wires up is a metrics/tracing
//! *backend* concern outside this crate's scope, so only the
//! `tracing-subscriber` layer is kept here.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber for `name`
///
/// Reads the filter from `RUST_LOG`, falling back to `info` if unset.
pub fn init(name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_current_span(true)
        .init();
    tracing::event!(tracing::Level::INFO, service = name, "logging initialized");
}
