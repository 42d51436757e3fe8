use std::sync::Arc;

use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{error, info};

use crate::telemetry::config::TelemetryConfig;
use crate::telemetry::endpoint::{resolve_endpoint, CollectorEndpoint};
use crate::telemetry::error::TelemetryError;
use crate::telemetry::lifecycle::{Pipeline, Telemetry};
use crate::telemetry::trace::init_subscriber;

/// Trait for telemetry providers (OTLP/HTTP by default, doubles in tests)
pub trait TelemetryProvider: Send + Sync {
    /// Build the tracer provider exporting to `endpoint`
    fn build_tracer_provider(
        &self,
        endpoint: &CollectorEndpoint,
        config: &TelemetryConfig,
    ) -> impl std::future::Future<Output = Result<SdkTracerProvider, TelemetryError>> + Send;
}

/// Resolve the configured collector and start the pipeline for it.
///
/// An empty or absent address gives `Ok(None)` without consulting the
/// provider. Logging the outcome is left to the caller, which may not have
/// a subscriber installed yet.
pub async fn start_from_config<P: TelemetryProvider>(
    telemetry: &Telemetry,
    provider: &P,
) -> Result<Option<Arc<Pipeline>>, TelemetryError> {
    match resolve_endpoint(telemetry.config().otlp_endpoint.as_deref())? {
        Some(endpoint) => telemetry.start(provider, endpoint).await.map(Some),
        None => Ok(None),
    }
}

/// Initialize logging and, when a collector is configured, the trace pipeline.
///
/// Endpoint and pipeline failures are logged and leave tracing disabled; only
/// a failure to install the log subscriber is returned.
pub async fn init_with_provider<P: TelemetryProvider>(
    provider: &P,
    config: TelemetryConfig,
) -> Result<Telemetry, TelemetryError> {
    let telemetry = Telemetry::new(config);
    let started = start_from_config(&telemetry, provider).await;

    let pipeline = started.as_ref().ok().cloned().flatten();
    init_subscriber(pipeline.as_ref().map(|p| p.provider()), telemetry.config())?;

    match started {
        Ok(Some(pipeline)) => {
            info!(endpoint = %pipeline.endpoint(), "OpenTelemetry tracing enabled")
        }
        Ok(None) => info!("OTLP_SERVER not set, trace export disabled"),
        Err(err) => error!(error = %err, "trace export disabled"),
    }

    Ok(telemetry)
}

/// Initialize telemetry with config (OTLP/HTTP exporter)
pub async fn init_with_config(config: TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    init_with_provider(&crate::telemetry::default::DefaultProvider, config).await
}

/// Initialize telemetry from environment
pub async fn init() -> Result<Telemetry, TelemetryError> {
    init_with_config(TelemetryConfig::from_env()).await
}
