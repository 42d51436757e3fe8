//! Per-request proxy logic: span, target URL, header filtering, trace
//! injection, forwarding.
//!
//! Every call opens exactly one span and ends it exactly once: on a transport
//! fault, when the response body finishes or fails, or when the response is
//! dropped before completion (client went away).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};

use bytes::Bytes;
use futures_util::Stream;
use http::HeaderMap;
use opentelemetry::context::FutureExt;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_http::HeaderInjector;
use opentelemetry_sdk::trace::SdkTracer;
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_FULL,
};
use tracing::{debug, warn};

use crate::proxy::error::ForwardError;
use crate::proxy::forwarder::{BodyStream, Forwarder, ProxiedRequest};
use crate::proxy::headers::{extraction_carrier, strip_hop_headers};
use crate::telemetry::SharedPropagator;

/// Inbound request as seen by the proxy, independent of the web framework
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    /// Path including the mount prefix, without query
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl InboundRequest {
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// Backend response ready to be written to the client
pub struct OutboundResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: TracedBody,
}

pub fn span_name(method: &str, path: &str) -> String {
    format!("proxy {method} {path}")
}

/// GET and HEAD never carry a body across the proxy
pub fn carries_body(method: &str) -> bool {
    !method.eq_ignore_ascii_case("GET") && !method.eq_ignore_ascii_case("HEAD")
}

#[derive(Clone)]
pub struct ProxyHandler {
    backend_url: Arc<str>,
    forwarder: Arc<dyn Forwarder>,
    tracer: SdkTracer,
    propagator: Option<SharedPropagator>,
}

impl ProxyHandler {
    pub fn new(
        backend_url: impl Into<Arc<str>>,
        forwarder: Arc<dyn Forwarder>,
        tracer: SdkTracer,
        propagator: Option<SharedPropagator>,
    ) -> Self {
        Self {
            backend_url: backend_url.into(),
            forwarder,
            tracer,
            propagator,
        }
    }

    pub fn target_url(&self, request: &InboundRequest) -> String {
        format!("{}{}", self.backend_url, request.path_and_query())
    }

    /// Parent for the proxy span: the ambient request span when the web layer
    /// provides one, else whatever trace context the client sent.
    fn parent_context(&self, headers: &HeaderMap, ambient: &Context) -> Context {
        if ambient.has_active_span() {
            return ambient.clone();
        }
        match &self.propagator {
            Some(propagator) => propagator.extract(&extraction_carrier(headers)),
            None => Context::new(),
        }
    }

    pub async fn handle(
        &self,
        request: InboundRequest,
        ambient: &Context,
    ) -> Result<OutboundResponse, ForwardError> {
        let target_url = self.target_url(&request);
        let parent = self.parent_context(&request.headers, ambient);

        let span = self
            .tracer
            .span_builder(span_name(&request.method, &request.path))
            .with_kind(SpanKind::Client)
            .with_attributes([
                KeyValue::new(HTTP_REQUEST_METHOD, request.method.clone()),
                KeyValue::new(URL_FULL, target_url.clone()),
            ])
            .start_with_context(&self.tracer, &parent);
        let mut scope = SpanScope::new(parent.with_span(span));

        let InboundRequest {
            method,
            mut headers,
            body,
            ..
        } = request;

        strip_hop_headers(&mut headers);
        if let Some(propagator) = &self.propagator {
            propagator.inject_context(scope.context(), &mut HeaderInjector(&mut headers));
        }

        let body = if carries_body(&method) { body } else { None };

        debug!(method = %method, target_url = %target_url, "forwarding request");

        let proxied = ProxiedRequest {
            method,
            target_url,
            headers,
            body,
        };
        let target_url = proxied.target_url.clone();

        match self
            .forwarder
            .forward(proxied)
            .with_context(scope.context().clone())
            .await
        {
            Ok(response) => {
                scope.context().span().set_attribute(KeyValue::new(
                    HTTP_RESPONSE_STATUS_CODE,
                    i64::from(response.status),
                ));
                Ok(OutboundResponse {
                    status: response.status,
                    headers: response.headers,
                    body: TracedBody::new(response.body, scope),
                })
            }
            Err(err) => {
                warn!(target_url = %target_url, error = %err, "backend request failed");
                scope.fail(&err);
                Err(err)
            }
        }
    }
}

/// Owns the proxy span until it has been ended exactly once
struct SpanScope {
    cx: Context,
    ended: bool,
}

impl SpanScope {
    fn new(cx: Context) -> Self {
        Self { cx, ended: false }
    }

    fn context(&self) -> &Context {
        &self.cx
    }

    fn fail(&mut self, err: &ForwardError) {
        if self.ended {
            return;
        }
        let span = self.cx.span();
        span.record_error(err);
        span.set_status(Status::error(err.to_string()));
        span.end();
        self.ended = true;
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.cx.span().end();
        self.ended = true;
    }
}

impl Drop for SpanScope {
    fn drop(&mut self) {
        if !self.ended {
            let span = self.cx.span();
            span.set_status(Status::error("request cancelled"));
            span.end();
        }
    }
}

/// Backend body stream that closes the proxy span when it completes,
/// fails, or is dropped half-read
pub struct TracedBody {
    inner: BodyStream,
    scope: SpanScope,
}

impl TracedBody {
    fn new(inner: BodyStream, scope: SpanScope) -> Self {
        Self { inner, scope }
    }
}

impl Stream for TracedBody {
    type Item = Result<Bytes, ForwardError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.scope.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                warn!(error = %err, "backend body stream failed");
                this.scope.fail(&err);
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use http::HeaderValue;
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry::trace::{SpanId, Status, TraceId, TracerProvider};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};

    use crate::proxy::forwarder::ForwardResponse;
    use crate::telemetry::lifecycle::build_propagator;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    enum Reply {
        Ok { status: u16, chunks: Vec<Result<Bytes, ForwardError>> },
        Fail(ForwardError),
    }

    struct RecordingForwarder {
        seen: Mutex<Vec<ProxiedRequest>>,
        reply: Mutex<Option<Reply>>,
    }

    impl RecordingForwarder {
        fn replying(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                reply: Mutex::new(Some(reply)),
            })
        }

        fn ok(body: &'static str) -> Arc<Self> {
            Self::replying(Reply::Ok {
                status: 200,
                chunks: vec![Ok(Bytes::from_static(body.as_bytes()))],
            })
        }

        fn last(&self) -> ProxiedRequest {
            self.seen.lock().unwrap().last().cloned().expect("no request forwarded")
        }
    }

    #[async_trait]
    impl Forwarder for RecordingForwarder {
        async fn forward(&self, request: ProxiedRequest) -> Result<ForwardResponse, ForwardError> {
            self.seen.lock().unwrap().push(request);
            match self.reply.lock().unwrap().take().expect("single use") {
                Reply::Ok { status, chunks } => Ok(ForwardResponse {
                    status,
                    headers: HeaderMap::from_iter([
                        (http::header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
                        (
                            http::HeaderName::from_static("x-backend"),
                            HeaderValue::from_static("mawinter"),
                        ),
                    ]),
                    body: stream::iter(chunks).boxed(),
                }),
                Reply::Fail(err) => Err(err),
            }
        }
    }

    struct Harness {
        exporter: InMemorySpanExporter,
        provider: SdkTracerProvider,
    }

    impl Harness {
        fn new() -> Self {
            let exporter = InMemorySpanExporter::default();
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(exporter.clone())
                .build();
            Self { exporter, provider }
        }

        fn handler(&self, forwarder: Arc<dyn Forwarder>, traced: bool) -> ProxyHandler {
            let propagator = traced.then(|| Arc::new(build_propagator()) as SharedPropagator);
            ProxyHandler::new(
                "http://localhost:8080",
                forwarder,
                self.provider.tracer("proxy-test"),
                propagator,
            )
        }

        fn spans(&self) -> Vec<SpanData> {
            self.exporter.get_finished_spans().unwrap()
        }
    }

    fn get(path: &str) -> InboundRequest {
        InboundRequest {
            method: "GET".into(),
            path: path.into(),
            query: None,
            headers: [
                ("host", "web.local:3000"),
                ("connection", "keep-alive"),
                ("accept", "application/json"),
                ("cookie", "session=abc"),
                ("x-custom", "1"),
            ]
            .into_iter()
            .map(|(name, value)| {
                (http::HeaderName::from_static(name), HeaderValue::from_static(value))
            })
            .collect(),
            body: None,
        }
    }

    async fn drain(body: TracedBody) -> Vec<Result<Bytes, ForwardError>> {
        body.collect().await
    }

    #[tokio::test]
    async fn forwards_to_backend_with_trace_context_and_without_hop_headers() {
        let harness = Harness::new();
        let forwarder = RecordingForwarder::ok("[]");
        let handler = harness.handler(forwarder.clone(), true);

        let response = handler
            .handle(get("/v3/categories"), &Context::new())
            .await
            .unwrap();
        drain(response.body).await;

        let sent = forwarder.last();
        assert_eq!(sent.target_url, "http://localhost:8080/v3/categories");
        assert_eq!(sent.method, "GET");
        assert!(!sent.headers.contains_key("host"));
        assert!(!sent.headers.contains_key("connection"));
        assert_eq!(sent.headers["cookie"], "session=abc");
        assert_eq!(sent.headers["x-custom"], "1");
        assert_eq!(sent.headers["accept"], "application/json");

        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        let traceparent = sent.headers.get("traceparent").expect("trace context injected");
        assert_eq!(
            traceparent.to_str().unwrap(),
            format!(
                "00-{}-{}-01",
                spans[0].span_context.trace_id(),
                spans[0].span_context.span_id()
            )
        );
    }

    #[tokio::test]
    async fn span_is_named_after_method_and_path_and_ends_ok() {
        let harness = Harness::new();
        let handler = harness.handler(RecordingForwarder::ok("{}"), true);

        let response = handler
            .handle(get("/api/v3/record"), &Context::new())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers["x-backend"], "mawinter");
        assert!(harness.spans().is_empty(), "span stays open while body streams");

        let chunks = drain(response.body).await;
        assert_eq!(chunks.len(), 1);

        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "proxy GET /api/v3/record");
        assert_eq!(spans[0].span_kind, SpanKind::Client);
        assert_eq!(spans[0].status, Status::Unset);
        assert!(spans[0]
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == HTTP_RESPONSE_STATUS_CODE && kv.value == opentelemetry::Value::I64(200)));
    }

    #[tokio::test]
    async fn inbound_trace_context_becomes_parent() {
        let harness = Harness::new();
        let forwarder = RecordingForwarder::ok("{}");
        let handler = harness.handler(forwarder.clone(), true);
        let mut request = get("/api/v3/categories");
        request
            .headers
            .append("traceparent", HeaderValue::from_static(TRACEPARENT));

        let response = handler.handle(request, &Context::new()).await.unwrap();
        drain(response.body).await;

        let span = &harness.spans()[0];
        assert_eq!(
            span.span_context.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert_eq!(span.parent_span_id, SpanId::from_hex("00f067aa0ba902b7").unwrap());

        let outgoing = forwarder.last();
        let traceparent: Vec<_> = outgoing.headers.get_all("traceparent").iter().collect();
        assert_eq!(traceparent.len(), 1);
        let traceparent = traceparent[0].to_str().unwrap();
        assert!(traceparent.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
        assert_ne!(traceparent, TRACEPARENT, "outgoing parent is the proxy span");
    }

    #[tokio::test]
    async fn ambient_request_span_takes_precedence() {
        let harness = Harness::new();
        let handler = harness.handler(RecordingForwarder::ok("{}"), true);
        let tracer = harness.provider.tracer("web");
        let ambient = Context::new().with_span(tracer.start("HTTP request"));
        let ambient_span = ambient.span().span_context().clone();

        let mut request = get("/api/v3/categories");
        request
            .headers
            .append("traceparent", HeaderValue::from_static(TRACEPARENT));
        let response = handler.handle(request, &ambient).await.unwrap();
        drain(response.body).await;

        let span = &harness.spans()[0];
        assert_eq!(span.span_context.trace_id(), ambient_span.trace_id());
        assert_eq!(span.parent_span_id, ambient_span.span_id());
    }

    #[tokio::test]
    async fn no_propagator_means_no_injected_headers() {
        let harness = Harness::new();
        let forwarder = RecordingForwarder::ok("{}");
        let handler = harness.handler(forwarder.clone(), false);

        let response = handler.handle(get("/api/v3/categories"), &Context::new()).await.unwrap();
        drain(response.body).await;

        let sent = forwarder.last();
        assert!(!sent.headers.contains_key("traceparent"));
        assert!(!sent.headers.contains_key("tracestate"));
        assert!(!sent.headers.contains_key("baggage"));
        let mut names: Vec<_> = sent.headers.keys().map(|name| name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["accept", "cookie", "x-custom"]);
        assert_eq!(harness.spans().len(), 1);
    }

    #[tokio::test]
    async fn forward_fault_ends_span_with_error_and_propagates() {
        let harness = Harness::new();
        let handler = harness.handler(
            RecordingForwarder::replying(Reply::Fail(ForwardError::Connect(
                "tcp connect error: Connection refused".into(),
            ))),
            true,
        );

        let err = handler
            .handle(get("/api/v3/categories"), &Context::new())
            .await
            .err()
            .expect("fault propagates");
        assert!(matches!(err, ForwardError::Connect(_)));

        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        assert!(matches!(&spans[0].status, Status::Error { description } if description.contains("Connection refused")));
        assert!(spans[0].events.iter().any(|event| event.name == "exception"));
    }

    #[tokio::test]
    async fn body_stream_error_ends_span_with_error() {
        let harness = Harness::new();
        let handler = harness.handler(
            RecordingForwarder::replying(Reply::Ok {
                status: 200,
                chunks: vec![
                    Ok(Bytes::from_static(b"[{")),
                    Err(ForwardError::Body("connection reset".into())),
                ],
            }),
            true,
        );

        let response = handler.handle(get("/api/v3/record"), &Context::new()).await.unwrap();
        let chunks = drain(response.body).await;

        assert!(chunks[1].is_err());
        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        assert!(matches!(spans[0].status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn dropped_response_ends_span_as_cancelled() {
        let harness = Harness::new();
        let handler = harness.handler(RecordingForwarder::ok("partial"), true);

        let response = handler.handle(get("/api/v3/record"), &Context::new()).await.unwrap();
        drop(response);

        let spans = harness.spans();
        assert_eq!(spans.len(), 1);
        assert!(matches!(&spans[0].status, Status::Error { description } if description == "request cancelled"));
    }

    #[tokio::test]
    async fn body_is_forwarded_for_post_only() {
        let harness = Harness::new();

        let forwarder = RecordingForwarder::ok("{}");
        let handler = harness.handler(forwarder.clone(), false);
        let mut post = get("/api/v3/record");
        post.method = "POST".into();
        post.body = Some(Bytes::from_static(br#"{"price":100}"#));
        handler.handle(post, &Context::new()).await.unwrap();
        assert_eq!(forwarder.last().body.as_deref(), Some(&br#"{"price":100}"#[..]));

        let forwarder = RecordingForwarder::ok("{}");
        let handler = harness.handler(forwarder.clone(), false);
        let mut head = get("/api/v3/record");
        head.method = "HEAD".into();
        head.body = Some(Bytes::from_static(b"ignored"));
        handler.handle(head, &Context::new()).await.unwrap();
        assert!(forwarder.last().body.is_none());
    }

    #[tokio::test]
    async fn query_string_reaches_backend() {
        let harness = Harness::new();
        let forwarder = RecordingForwarder::ok("{}");
        let handler = harness.handler(forwarder.clone(), false);
        let mut request = get("/api/v3/record");
        request.query = Some("yyyymm=202501&category_id=100".into());

        handler.handle(request, &Context::new()).await.unwrap();

        assert_eq!(
            forwarder.last().target_url,
            "http://localhost:8080/api/v3/record?yyyymm=202501&category_id=100"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_each_end_one_span() {
        let harness = Harness::new();
        let mut tasks = Vec::new();

        for i in 0..16 {
            let forwarder: Arc<dyn Forwarder> = if i % 2 == 0 {
                RecordingForwarder::ok("{}")
            } else {
                RecordingForwarder::replying(Reply::Fail(ForwardError::Timeout("slow".into())))
            };
            let handler = harness.handler(forwarder, true);
            tasks.push(tokio::spawn(async move {
                let request = get(&format!("/api/v3/record/{i}"));
                if let Ok(response) = handler.handle(request, &Context::new()).await {
                    drain(response.body).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let spans = harness.spans();
        assert_eq!(spans.len(), 16);
        let errors = spans
            .iter()
            .filter(|span| matches!(span.status, Status::Error { .. }))
            .count();
        assert_eq!(errors, 8);
    }

    #[tokio::test]
    async fn repeated_baggage_headers_are_all_propagated() {
        let harness = Harness::new();
        let forwarder = RecordingForwarder::ok("{}");
        let handler = harness.handler(forwarder.clone(), true);
        let mut request = get("/api/v3/categories");
        request.headers.append("baggage", HeaderValue::from_static("a=1"));
        request.headers.append("baggage", HeaderValue::from_static("b=2"));

        let response = handler.handle(request, &Context::new()).await.unwrap();
        drain(response.body).await;

        let outgoing = forwarder.last();
        let baggage: Vec<_> = outgoing.headers.get_all("baggage").iter().collect();
        assert_eq!(baggage.len(), 1);
        let mut entries: Vec<_> = baggage[0].to_str().unwrap().split(',').collect();
        entries.sort_unstable();
        assert_eq!(entries, vec!["a=1", "b=2"]);

        let carrier = extraction_carrier(&outgoing.headers);
        let cx = build_propagator().extract(&carrier);
        assert_eq!(cx.baggage().len(), 2);
    }

    #[tokio::test]
    async fn opaque_header_bytes_pass_through() {
        let harness = Harness::new();
        let forwarder = RecordingForwarder::ok("{}");
        let handler = harness.handler(forwarder.clone(), true);
        let mut request = get("/api/v3/categories");
        request
            .headers
            .append("x-name", HeaderValue::from_bytes(b"caf\xe9").unwrap());

        handler.handle(request, &Context::new()).await.unwrap();

        assert_eq!(forwarder.last().headers["x-name"].as_bytes(), b"caf\xe9");
    }

    #[test]
    fn only_get_and_head_drop_the_body() {
        assert!(!carries_body("GET"));
        assert!(!carries_body("head"));
        assert!(carries_body("POST"));
        assert!(carries_body("PUT"));
        assert!(carries_body("DELETE"));
    }
}
