// Notification endpoints for the relay API.
//
// Routes (bearer auth required):
//   POST /v1/notifications                 create for the caller, then dispatch
//   GET  /v1/notifications                 list, newest first (limit/offset)
//   POST /v1/notifications/mark-read       mark caller-owned rows as read
//   GET  /v1/notifications/unread-count    unread count for the caller

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beacon_common::types::{Notification, NotificationDraft};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    api::ApiState,
    auth::middleware::AuthenticatedUser,
    error::{ErrorCode, RelayError},
    notifications::{NotificationError, Page},
    validation::ValidatedJson,
};

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    #[serde(rename = "type", default)]
    kind: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct CreateNotificationResponse {
    id: i64,
    message: &'static str,
}

/// Query values are parsed leniently: anything unparseable falls back to
/// the page defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListNotificationsQuery {
    limit: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListNotificationsResponse {
    items: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    notification_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct MarkReadResponse {
    updated: u64,
}

#[derive(Debug, Serialize)]
struct UnreadCountResponse {
    unread_count: i64,
}

impl From<NotificationError> for RelayError {
    fn from(value: NotificationError) -> Self {
        match value {
            NotificationError::Invalid(error) => {
                RelayError::new(ErrorCode::ValidationFailed, error.to_string())
            }
            NotificationError::EmptySelection => {
                RelayError::new(ErrorCode::ValidationFailed, "no notification ids provided")
            }
            NotificationError::Storage(error) => {
                error!(error = ?error, "notification store failure");
                RelayError::from_code(ErrorCode::StorageUnavailable)
            }
        }
    }
}

pub(super) async fn create_notification(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    ValidatedJson(request): ValidatedJson<CreateNotificationRequest>,
) -> Result<Response, RelayError> {
    let notification = state
        .service
        .create(NotificationDraft::new(user.user_id, request.kind, request.message))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateNotificationResponse { id: notification.id, message: "notification created" }),
    )
        .into_response())
}

pub(super) async fn list_notifications(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<Response, RelayError> {
    let page = Page::new(parse_number(query.limit.as_deref()), parse_number(query.offset.as_deref()));
    let items = state.service.list(user.user_id, page).await?;

    Ok(Json(ListNotificationsResponse { items }).into_response())
}

pub(super) async fn mark_read(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    ValidatedJson(request): ValidatedJson<MarkReadRequest>,
) -> Result<Response, RelayError> {
    let updated = state.service.mark_read(user.user_id, &request.notification_ids).await?;

    Ok(Json(MarkReadResponse { updated }).into_response())
}

pub(super) async fn unread_count(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
) -> Result<Response, RelayError> {
    let unread_count = state.service.count_unread(user.user_id).await?;

    Ok(Json(UnreadCountResponse { unread_count }).into_response())
}

fn parse_number(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
}
