//! Tracing subscriber initialisation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, TelemetryConfig};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Calling this a
/// second time returns an error instead of replacing the subscriber.
///
/// ```no_run
/// use ecommerce_common::config::TelemetryConfig;
///
/// ecommerce_common::telemetry::init_tracing(&TelemetryConfig::default())
///     .expect("tracing already initialised");
/// ```
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    }
}
