mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod metrics;
mod notifications;
mod realtime;
mod validation;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::{identity::IdentityVerifier, jwt::JwtAccessTokenService},
    config::{LogFormat, RelayConfig},
    error::{ErrorCode, RelayError},
    metrics::RelayMetrics,
    notifications::{NotificationService, NotificationStore},
    realtime::{ConnectionRegistry, Dispatcher, RealtimeState},
    validation::MAX_REST_BODY_BYTES,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);
    config.session.validate().context("invalid realtime session settings")?;

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set BEACON_RELAY_JWT_SECRET in production");
    }

    let store = build_store(&config).await?;
    info!(backend = store.backend_name(), "notification store ready");

    let metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let registry = Arc::new(ConnectionRegistry::default());
    let dispatcher = Dispatcher::new(Arc::clone(&registry));
    let service = NotificationService::new(store, dispatcher.clone());
    let verifier: Arc<dyn IdentityVerifier> = jwt_service;

    let app = build_router(
        realtime::router(RealtimeState::new(
            Arc::clone(&registry),
            Arc::clone(&verifier),
            config.session,
        )),
        api::router(service, dispatcher, verifier),
        metrics,
        cors::cors_layer_from_env(config.cors_origins.as_deref()),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let closed = shutdown_registry.close_all();
            info!(closed, "closed live realtime sessions");
        })
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn build_store(config: &RelayConfig) -> anyhow::Result<NotificationStore> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("BEACON_RELAY_DATABASE_URL is not set; notifications are kept in memory");
        return Ok(NotificationStore::memory());
    };

    let pool = db::pool::create_pg_pool(database_url, config.pool.clone())
        .await
        .context("failed to connect to the notification database")?;
    db::pool::check_pool_health(&pool).await?;
    db::migrations::run_migrations(&pool).await?;
    Ok(NotificationStore::Postgres(pool))
}

fn build_router(
    realtime_router: Router,
    api_router: Router,
    metrics: Arc<RelayMetrics>,
    cors: CorsLayer,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint).with_state(metrics))
            .merge(realtime_router)
            .merge(api_router),
    )
    .layer(cors)
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_endpoint(State(metrics): State<Arc<RelayMetrics>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = error::request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = error::with_request_id_scope(request_id.clone(), next.run(request)).await;
    error::attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
