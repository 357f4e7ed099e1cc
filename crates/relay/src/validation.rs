// JSON body extraction with structured error envelopes.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{ErrorCode, RelayError};

/// Maximum REST request body in bytes (64 KiB).
pub const MAX_REST_BODY_BYTES: usize = 64 * 1024;

/// A JSON body extractor that answers with a `VALIDATION_FAILED` envelope
/// instead of axum's plain-text rejection.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                let (code, message, details) = classify_json_rejection(&rejection);
                Err(RelayError::new(code, message).with_details(details).into_response())
            }
        }
    }
}

fn classify_json_rejection(rejection: &JsonRejection) -> (ErrorCode, String, Value) {
    match rejection {
        JsonRejection::JsonDataError(e) => (
            ErrorCode::ValidationFailed,
            format!("invalid JSON payload: {e}"),
            json!({ "kind": "data_error" }),
        ),
        JsonRejection::JsonSyntaxError(e) => (
            ErrorCode::ValidationFailed,
            format!("malformed JSON: {e}"),
            json!({ "kind": "syntax_error" }),
        ),
        JsonRejection::MissingJsonContentType(_) => (
            ErrorCode::ValidationFailed,
            "expected Content-Type: application/json".to_string(),
            json!({ "kind": "missing_content_type" }),
        ),
        JsonRejection::BytesRejection(e) if e.status() == axum::http::StatusCode::PAYLOAD_TOO_LARGE => (
            ErrorCode::PayloadTooLarge,
            format!("request body exceeds {MAX_REST_BODY_BYTES} bytes"),
            json!({ "kind": "body_too_large", "limit": MAX_REST_BODY_BYTES }),
        ),
        other => (
            ErrorCode::ValidationFailed,
            format!("request body error: {other}"),
            json!({ "kind": "body_error" }),
        ),
    }
}
