use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Failure of the backend roundtrip. Always fatal to the one request.
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("backend connection failed: {0}")]
    Connect(String),
    #[error("backend timed out: {0}")]
    Timeout(String),
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend body stream failed: {0}")]
    Body(String),
    #[error("http client setup failed: {0}")]
    Client(String),
}

impl ForwardError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let detail = error_chain(&err);
        if err.is_timeout() {
            Self::Timeout(detail)
        } else if err.is_connect() {
            Self::Connect(detail)
        } else if err.is_body() || err.is_decode() {
            Self::Body(detail)
        } else {
            Self::Request(detail)
        }
    }
}

// reqwest keeps the useful part (refused, dns) in the source chain.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

impl ResponseError for ForwardError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_GATEWAY
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).body("Bad Gateway")
    }
}

/// Invalid or missing proxy settings at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
