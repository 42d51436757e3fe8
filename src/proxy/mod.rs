//! Traced reverse proxy in front of the backend API.
//!
//! Every request under the mount prefix is forwarded to `BACKEND_API_URL`
//! with its path and query intact. `Host` and `Connection` are dropped, W3C
//! trace context for the proxy span is injected, and the backend response is
//! streamed back unchanged. Transport faults become `502 Bad Gateway`.
//!
//! # Module Structure
//!
//! - [`config`]: proxy settings
//! - [`headers`]: hop and framing header rules, propagation carrier
//! - [`forwarder`]: outbound transport seam and its `reqwest` implementation
//! - [`handler`]: per-request span and forwarding logic
//! - [`route`]: actix-web scope

pub mod config;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod headers;
pub mod route;

pub use config::ProxyConfig;
pub use forwarder::ReqwestForwarder;
pub use handler::ProxyHandler;
