//! Outbound HTTP roundtrip behind the [`Forwarder`] seam.

use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::Method;

use crate::proxy::error::ForwardError;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, ForwardError>> + Send>>;

/// What the handler hands to the transport: method, full target URL,
/// filtered headers carrying trace context, and the body if any.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: String,
    pub target_url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Backend response with headers received and body still in flight
pub struct ForwardResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for ForwardResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: ProxiedRequest) -> Result<ForwardResponse, ForwardError>;
}

/// [`Forwarder`] backed by a pooled `reqwest` client.
///
/// Redirects are never followed: a backend 3xx goes back to the client as is.
#[derive(Debug, Clone)]
pub struct ReqwestForwarder {
    client: reqwest::Client,
}

impl ReqwestForwarder {
    pub fn new(force_ipv4: bool) -> Result<Self, ForwardError> {
        let mut builder = reqwest::Client::builder().redirect(Policy::none());
        if force_ipv4 {
            // An IPv4 local address makes the connector skip IPv6 candidates
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }

        let client = builder
            .build()
            .map_err(|e| ForwardError::Client(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for ReqwestForwarder {
    async fn forward(&self, request: ProxiedRequest) -> Result<ForwardResponse, ForwardError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ForwardError::Request(format!("{}: {e}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.target_url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(ForwardError::from_reqwest)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ForwardError::from_reqwest))
            .boxed();

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }
}
