//! Tracing initialization shared by the API and worker binaries.

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, ObservabilityConfig};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG` via `EnvFilter` (defaulting to `info`) and selects
/// JSON or human-readable output from the observability config.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let format_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_target(true)
            .with_file(true)
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    Registry::default()
        .with(env_filter)
        .with(format_layer)
        .try_init()?;

    tracing::info!(service = %config.service_name, "tracing initialized");
    Ok(())
}
