//! Telemetry lifecycle: logging plus an optional OpenTelemetry pipeline.
//!
//! Trace export is best-effort. A missing or malformed collector address, or
//! a pipeline that fails to build, is logged and the proxy keeps serving
//! with a tracer that exports nothing.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let telemetry = telemetry::init().await?;
//! telemetry::shutdown_on_signal(telemetry.clone());
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `OTLP_SERVER` | Collector, `host:port` or full URL | - |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Fallback for `OTLP_SERVER` | - |
//! | `OTEL_SERVICE_NAME` | Service name | `CARGO_PKG_NAME` |
//! | `OTEL_SERVICE_VERSION` | Service version | `CARGO_PKG_VERSION` |
//! | `OTEL_SHUTDOWN_TIMEOUT_MS` | Flush bound at shutdown | `5000` |
//! | `RUST_LOG` | Log level filter | `info` |
//! | `LOG_FORMAT` | `pretty` or `json` | `pretty` |
//!
//! # Module Structure
//!
//! - [`api`]: provider trait and initialization functions
//! - [`config`]: configuration types
//! - [`endpoint`]: collector address normalization
//! - [`lifecycle`]: start-once / stop-once pipeline owner, signal hook
//! - [`default`]: OTLP/HTTP provider
//! - [`trace`]: subscriber and log layers

#![allow(dead_code)] // Public API - not all items used internally

pub mod api;
pub mod config;
pub mod default;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod resource;
pub mod trace;

// Re-exports
pub use api::{init, init_with_config, init_with_provider, TelemetryProvider};
pub use config::{LogFormat, TelemetryConfig, TelemetryConfigBuilder};
pub use endpoint::{resolve_endpoint, CollectorEndpoint};
pub use error::TelemetryError;
pub use lifecycle::{shutdown_on_signal, SharedPropagator, Telemetry};
