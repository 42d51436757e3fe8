use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Collector endpoint could not be turned into a usable URL
    #[error("Configuration error: {0}")]
    Config(String),
    /// Exporter or pipeline could not be built
    #[error("Exporter error: {0}")]
    Exporter(String),
    #[error("Initialization error: {0}")]
    Init(String),
}

impl From<opentelemetry_otlp::ExporterBuildError> for TelemetryError {
    fn from(err: opentelemetry_otlp::ExporterBuildError) -> Self {
        Self::Exporter(err.to_string())
    }
}
