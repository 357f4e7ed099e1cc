use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use beacon_common::types::UserId;
use tracing::debug;

use crate::{
    auth::identity::{IdentityError, IdentityVerifier},
    error::{ErrorCode, RelayError},
};

/// The caller identity attached to a request by [`require_bearer_auth`].
///
/// Handlers take it directly as an extractor; a route that is not behind the
/// bearer layer answers 401 instead of running the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .copied()
            .ok_or_else(|| RelayError::from_code(ErrorCode::AuthInvalidToken))
    }
}

pub async fn require_bearer_auth(
    State(verifier): State<Arc<dyn IdentityVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let verified = bearer_token_from_headers(request.headers())
        .ok_or(IdentityError::Missing)
        .and_then(|token| verifier.verify(token));

    match verified {
        Ok(user_id) => {
            request.extensions_mut().insert(AuthenticatedUser { user_id });
            next.run(request).await
        }
        Err(error) => {
            debug!(%error, path = request.uri().path(), "rejected bearer credential");
            RelayError::new(ErrorCode::AuthInvalidToken, error.to_string()).into_response()
        }
    }
}

/// The token from an `Authorization: Bearer <token>` header, if any.
pub fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim_start();
    let (scheme, token) = value.split_once(char::is_whitespace)?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
