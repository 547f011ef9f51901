//! Logging setup for the service binary.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,quote_oracle=debug";

/// Install the global subscriber.
///
/// JSON lines when `RUST_ENV=production`, pretty output otherwise. The
/// filter comes from `RUST_LOG`, defaulting to `info,quote_oracle=debug`.
/// Fails if a global subscriber is already installed.
pub fn init_logging() -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let production = std::env::var("RUST_ENV").is_ok_and(|env| env == "production");

    let json = production.then(|| fmt::layer().json().with_current_span(true));
    let pretty = (!production).then(|| fmt::layer().pretty().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()
}
