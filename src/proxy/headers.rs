use std::collections::HashMap;

use http::HeaderMap;

/// Request headers that describe the inbound hop only and are never forwarded
pub const HOP_HEADERS: [&str; 2] = ["host", "connection"];

/// Response headers the server regenerates for its own framing. A backend
/// `content-length` is carried over as the size of the streamed body instead.
pub const RESPONSE_FRAMING_HEADERS: [&str; 4] =
    ["connection", "transfer-encoding", "keep-alive", "content-length"];

/// Drop every header named in [`HOP_HEADERS`], all values included
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Single-string view of `headers` for propagator extraction.
///
/// Repeated headers are joined with `,` so that split `baggage` or
/// `tracestate` lines reach the propagator whole. Values that are not
/// visible ASCII cannot carry trace context and are skipped.
pub fn extraction_carrier(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            (!values.is_empty()).then(|| (name.as_str().to_string(), values.join(",")))
        })
        .collect()
}

/// Backend `content-length`, when present and well-formed
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
