use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::telemetry::api::TelemetryProvider;
use crate::telemetry::config::TelemetryConfig;
use crate::telemetry::endpoint::CollectorEndpoint;
use crate::telemetry::error::TelemetryError;
use crate::telemetry::resource::build_base_resource;

/// Default provider: OTLP/HTTP (protobuf) to the resolved collector URL,
/// behind a batch span processor.
pub struct DefaultProvider;

impl TelemetryProvider for DefaultProvider {
    async fn build_tracer_provider(
        &self,
        endpoint: &CollectorEndpoint,
        config: &TelemetryConfig,
    ) -> Result<SdkTracerProvider, TelemetryError> {
        let resource = build_base_resource(config);

        // The collector may still be unreachable here; the batch processor
        // retries export in the background, so only construction can fail.
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint.as_str())
            .build()?;

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build())
    }
}
