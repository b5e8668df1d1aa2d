//! Telemetry and Observability
//!
//! Structured logging setup for embedding applications.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,chat_realtime=debug,tokio_tungstenite=warn";

/// Initialize tracing subscriber
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_tracing`] when that can happen.
pub fn init_tracing() {
    if let Err(e) = try_init_tracing(false) {
        panic!("failed to install tracing subscriber: {}", e);
    }
    tracing::info!("Tracing initialized");
}

/// Install the subscriber, optionally emitting JSON lines.
pub fn try_init_tracing(json: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    }
}
