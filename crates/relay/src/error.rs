// Error envelope shared by every REST response and handshake rejection:
//
//   { "error": { "code", "message", "retryable", "request_id", "details" } }
//
// The request id comes from the task-local set by the request middleware and
// is mirrored into the `x-request-id` header.

use std::{fmt, future::Future};

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    NotFound,
    PayloadTooLarge,
    UpgradeFailed,
    InternalError,
    StorageUnavailable,
}

struct CodeInfo {
    name: &'static str,
    status: StatusCode,
    retryable: bool,
    message: &'static str,
}

impl ErrorCode {
    const fn info(self) -> CodeInfo {
        let (name, status, retryable, message) = match self {
            Self::ValidationFailed => {
                ("VALIDATION_FAILED", StatusCode::BAD_REQUEST, false, "request validation failed")
            }
            Self::AuthInvalidToken => (
                "AUTH_INVALID_TOKEN",
                StatusCode::UNAUTHORIZED,
                false,
                "invalid or missing access token",
            ),
            Self::NotFound => ("NOT_FOUND", StatusCode::NOT_FOUND, false, "resource not found"),
            Self::PayloadTooLarge => (
                "PAYLOAD_TOO_LARGE",
                StatusCode::PAYLOAD_TOO_LARGE,
                false,
                "payload exceeds maximum allowed size",
            ),
            Self::UpgradeFailed => (
                "UPGRADE_FAILED",
                StatusCode::BAD_REQUEST,
                false,
                "websocket upgrade negotiation failed",
            ),
            Self::InternalError => {
                ("INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR, true, "internal server error")
            }
            Self::StorageUnavailable => (
                "STORAGE_UNAVAILABLE",
                StatusCode::SERVICE_UNAVAILABLE,
                true,
                "notification store is unavailable",
            ),
        };
        CodeInfo { name, status, retryable, message }
    }

    pub const fn as_str(self) -> &'static str {
        self.info().name
    }

    pub const fn status(self) -> StatusCode {
        self.info().status
    }

    pub const fn retryable(self) -> bool {
        self.info().retryable
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that renders as the relay's JSON envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: EnvelopeBody<'a>,
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    code: &'static str,
    message: &'a str,
    retryable: bool,
    request_id: Option<&'a str>,
    details: &'a Value,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.info().message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let empty = Value::Object(Default::default());
        let envelope = Envelope {
            error: EnvelopeBody {
                code: self.code.as_str(),
                message: &self.message,
                retryable: self.code.retryable(),
                request_id: request_id.as_deref(),
                details: self.details.as_ref().unwrap_or(&empty),
            },
        };

        let mut response = (self.code.status(), Json(envelope)).into_response();
        if let Some(request_id) = request_id.as_deref() {
            attach_request_id_header(&mut response, request_id);
        }
        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Use the caller's `x-request-id` when present, otherwise mint a UUID.
pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    match headers.get(REQUEST_ID_HEADER).and_then(|value| value.to_str().ok()).map(str::trim) {
        Some(value) if !value.is_empty() => value.to_owned(),
        _ => Uuid::new_v4().to_string(),
    }
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
