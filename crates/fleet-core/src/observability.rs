//! Observability infrastructure for the control plane.
//!
//! Provides logging initialization and span constructors so that every
//! per-node operation carries the same structured fields.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::id::NodeId;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `fleet_control=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        if let Err(e) = result {
            // Another subscriber was installed first (common in tests).
            eprintln!("logging already initialized: {e}");
        }
    });
}

/// Creates a span for a per-node operation.
///
/// # Example
///
/// ```rust
/// use fleet_core::id::NodeId;
/// use fleet_core::observability::node_span;
///
/// let node = NodeId::generate();
/// let span = node_span("push_desired_config", &node);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn node_span(operation: &str, node_id: &NodeId) -> Span {
    tracing::info_span!("node", op = operation, node_id = %node_id)
}

/// Creates a span for an offline sweep.
#[must_use]
pub fn sweep_span(threshold_seconds: u64) -> Span {
    tracing::info_span!("offline_sweep", threshold_seconds = threshold_seconds)
}
