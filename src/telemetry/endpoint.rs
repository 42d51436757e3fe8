use std::fmt;

use url::Url;

use crate::telemetry::error::TelemetryError;

/// Path the OTLP/HTTP receiver accepts trace payloads on
pub const TRACES_PATH: &str = "/v1/traces";

/// Normalized absolute URL of the trace collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorEndpoint(Url);

impl CollectorEndpoint {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for CollectorEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Turn the user supplied collector address into an OTLP/HTTP traces URL.
///
/// Accepts either a full URL (`https://collector:4318`, `http://c/custom`)
/// or a bare `host[:port]`. Returns `Ok(None)` when nothing usable was given,
/// which means trace export stays off.
pub fn resolve_endpoint(raw: Option<&str>) -> Result<Option<CollectorEndpoint>, TelemetryError> {
    let trimmed = match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(None),
    };

    if trimmed.contains("://") {
        let mut url = Url::parse(trimmed)
            .map_err(|e| TelemetryError::Config(format!("invalid collector endpoint {trimmed:?}: {e}")))?;

        if url.host_str().map_or(true, str::is_empty) {
            return Err(TelemetryError::Config(format!(
                "collector endpoint {trimmed:?} has no host"
            )));
        }

        if url.path().is_empty() || url.path() == "/" {
            url.set_path(TRACES_PATH);
        }

        return Ok(Some(CollectorEndpoint(url)));
    }

    let host = trimmed.trim_end_matches('/');
    if host.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(&format!("http://{host}{TRACES_PATH}"))
        .map_err(|e| TelemetryError::Config(format!("invalid collector host {host:?}: {e}")))?;

    Ok(Some(CollectorEndpoint(url)))
}
