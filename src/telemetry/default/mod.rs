//! Default telemetry provider.
//!
//! Exports spans over OTLP/HTTP to the collector resolved from `OTLP_SERVER`.
//! When no collector is configured this provider is never asked for a
//! pipeline and the proxy runs with a non-exporting tracer.
//!
//! # Example
//!
//! ```rust,ignore
//! use telemetry::default::DefaultProvider;
//! use telemetry::{TelemetryConfig, api::init_with_provider};
//!
//! let telemetry = init_with_provider(&DefaultProvider, TelemetryConfig::from_env()).await?;
//! ```

mod provider;

pub use provider::DefaultProvider;
