//! actix-web glue around [`ProxyHandler`].

use actix_web::body::SizedStream;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Scope};
use http::HeaderMap;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::proxy::error::ForwardError;
use crate::proxy::handler::{InboundRequest, ProxyHandler};
use crate::proxy::headers::{content_length, RESPONSE_FRAMING_HEADERS};

/// Scope serving every method and sub-path under `mount`
pub fn scope(mount: &str) -> Scope {
    web::scope(mount).default_service(web::to(proxy_route))
}

// Header names and values are carried as raw bytes in both directions.
fn inbound_headers(req: &HttpRequest) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(req.headers().len());
    for (name, value) in req.headers().iter() {
        let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_str().as_bytes()),
            http::HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    headers
}

fn inbound_request(req: &HttpRequest, body: web::Bytes) -> InboundRequest {
    let query = req.query_string();

    InboundRequest {
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        query: (!query.is_empty()).then(|| query.to_string()),
        headers: inbound_headers(req),
        body: (!body.is_empty()).then_some(body),
    }
}

pub async fn proxy_route(
    req: HttpRequest,
    body: web::Bytes,
    handler: web::Data<ProxyHandler>,
) -> Result<HttpResponse, ForwardError> {
    let ambient = tracing::Span::current().context();
    let response = handler.handle(inbound_request(&req, body), &ambient).await?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in response.headers.iter() {
        if RESPONSE_FRAMING_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder.append_header((name, value));
        }
    }

    // A known backend length keeps the response sized instead of chunked
    Ok(match content_length(&response.headers) {
        Some(len) => builder.body(SizedStream::new(len, response.body)),
        None => builder.streaming(response.body),
    })
}
