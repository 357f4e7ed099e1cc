pub mod notifications;

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use beacon_common::types::UserId;
use serde::Serialize;

use crate::{
    auth::{identity::IdentityVerifier, middleware::require_bearer_auth},
    notifications::NotificationService,
    realtime::Dispatcher,
};

#[derive(Clone)]
pub struct ApiState {
    service: NotificationService,
    dispatcher: Dispatcher,
}

#[derive(Debug, Serialize)]
struct ConnectedUsersResponse {
    count: usize,
    users: Vec<UserId>,
}

pub fn router(
    service: NotificationService,
    dispatcher: Dispatcher,
    verifier: Arc<dyn IdentityVerifier>,
) -> Router {
    let state = ApiState { service, dispatcher };

    Router::new()
        .route(
            "/v1/notifications",
            get(notifications::list_notifications).post(notifications::create_notification),
        )
        .route("/v1/notifications/mark-read", post(notifications::mark_read))
        .route("/v1/notifications/unread-count", get(notifications::unread_count))
        .route("/v1/realtime/users", get(connected_users))
        .with_state(state)
        .route_layer(middleware::from_fn_with_state(verifier, require_bearer_auth))
}

async fn connected_users(State(state): State<ApiState>) -> Json<ConnectedUsersResponse> {
    let users = state.dispatcher.connected_users();
    Json(ConnectedUsersResponse { count: users.len(), users })
}
