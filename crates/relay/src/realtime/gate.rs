use std::sync::Arc;

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use beacon_common::types::UserId;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{
        identity::{IdentityError, IdentityVerifier},
        middleware::bearer_token_from_headers,
    },
    error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError},
    realtime::{
        registry::ConnectionRegistry,
        session::{run_read_loop, run_write_loop, CloseReason, Session, SessionConfig},
    },
};

pub const NOTIFICATIONS_WS_PATH: &str = "/v1/ws/notifications";

#[derive(Clone)]
pub struct RealtimeState {
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn IdentityVerifier>,
    config: SessionConfig,
}

impl RealtimeState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
        config: SessionConfig,
    ) -> Self {
        Self { registry, verifier, config }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

pub fn router(state: RealtimeState) -> Router {
    Router::new().route(NOTIFICATIONS_WS_PATH, get(ws_handshake)).with_state(state)
}

/// Credential first, upgrade second: a request without a valid identity is
/// refused before any session or task exists.
async fn ws_handshake(
    State(state): State<RealtimeState>,
    query: Result<Query<HandshakeQuery>, QueryRejection>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // An unparseable query carries no usable credential.
    let query = query.map(|Query(query)| query).unwrap_or_else(|rejection| {
        debug!(%rejection, "ignoring malformed handshake query");
        HandshakeQuery::default()
    });
    let credential = query
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token_from_headers(&headers));

    let user_id = match authenticate(state.verifier.as_ref(), credential) {
        Ok(user_id) => user_id,
        Err(error) => {
            info!(%error, "realtime handshake rejected");
            return RelayError::new(ErrorCode::AuthInvalidToken, error.to_string()).into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(user_id, %rejection, "realtime upgrade negotiation failed");
            return RelayError::new(ErrorCode::UpgradeFailed, rejection.body_text())
                .into_response();
        }
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let limit = state.config.max_inbound_message_bytes;
    upgrade
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(move |error| {
            warn!(user_id, %error, "realtime connection upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, serve_session(state, user_id, socket)).await;
        })
}

fn authenticate(
    verifier: &dyn IdentityVerifier,
    credential: Option<&str>,
) -> Result<UserId, IdentityError> {
    let credential = credential.ok_or(IdentityError::Missing)?;
    let user_id = verifier.verify(credential)?;
    if user_id <= 0 {
        return Err(IdentityError::MissingIdentity);
    }
    Ok(user_id)
}

async fn serve_session(state: RealtimeState, user_id: UserId, socket: WebSocket) {
    let RealtimeState { registry, config, .. } = state;
    let (session, outbound) = Session::new(user_id, config.outbound_queue_capacity);

    // The replacement does not write until the superseded socket is gone.
    if let Some(previous) = registry.admit(Arc::clone(&session)) {
        if timeout(config.write_deadline, previous.released()).await.is_err() {
            warn!(
                session_id = %session.id(),
                previous_session_id = %previous.id(),
                user_id,
                "superseded session was not released in time"
            );
        }
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(run_write_loop(Arc::clone(&session), outbound, sink, config));

    run_read_loop(Arc::clone(&session), stream, config).await;

    if let Err(join_error) = writer.await {
        error!(session_id = %session.id(), user_id, ?join_error, "realtime write loop panicked");
    }

    let reason = session.close_reason().unwrap_or(CloseReason::PeerClosed);
    session.teardown(&registry, reason);
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use beacon_common::types::{Notification, NotificationDraft, UserId};
    use chrono::Utc;
    use futures_util::StreamExt;
    use serde_json::Value;
    use tokio::{
        net::TcpListener,
        task::JoinHandle,
        time::{sleep, timeout, Instant},
    };
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{protocol::frame::coding::CloseCode, Error as WsError, Message as WsFrame},
        MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;

    use super::{authenticate, router, RealtimeState, NOTIFICATIONS_WS_PATH};
    use crate::{
        auth::{
            identity::{IdentityError, IdentityVerifier},
            jwt::JwtAccessTokenService,
        },
        realtime::{
            dispatcher::{Delivery, Dispatcher},
            registry::ConnectionRegistry,
            session::{CloseReason, SessionConfig},
        },
    };

    const TEST_SECRET: &str = "beacon_test_secret_that_is_definitely_long_enough";

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct TestRelay {
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Dispatcher,
        jwt_service: Arc<JwtAccessTokenService>,
        server_task: JoinHandle<()>,
    }

    impl TestRelay {
        async fn start(config: SessionConfig) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
            let addr = listener.local_addr().expect("listener should expose local address");
            let registry = Arc::new(ConnectionRegistry::default());
            let jwt_service = Arc::new(
                JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"),
            );
            let app = router(RealtimeState::new(
                Arc::clone(&registry),
                jwt_service.clone(),
                config,
            ));
            let server_task = tokio::spawn(async move {
                axum::serve(listener, app)
                    .await
                    .expect("relay websocket server should run for the test");
            });

            Self {
                addr,
                dispatcher: Dispatcher::new(Arc::clone(&registry)),
                registry,
                jwt_service,
                server_task,
            }
        }

        fn url_for(&self, user_id: UserId) -> String {
            let token =
                self.jwt_service.issue_access_token(user_id).expect("token should be issued");
            format!("ws://{}{NOTIFICATIONS_WS_PATH}?token={token}", self.addr)
        }

        async fn connect(&self, user_id: UserId) -> ClientSocket {
            let previous = self.registry.lookup(user_id);
            let (socket, _) =
                connect_async(self.url_for(user_id)).await.expect("websocket should connect");
            wait_until("session should be admitted", || {
                self.registry.lookup(user_id).is_some_and(|current| {
                    previous.as_ref().map_or(true, |previous| !Arc::ptr_eq(previous, &current))
                })
            })
            .await;
            socket
        }
    }

    impl Drop for TestRelay {
        fn drop(&mut self) {
            self.server_task.abort();
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            write_deadline: Duration::from_millis(500),
            read_deadline: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
            ..SessionConfig::default()
        }
    }

    fn notification(id: i64, user_id: UserId, message: &str) -> Notification {
        NotificationDraft::new(user_id, "task_assigned", message).into_notification(id, Utc::now())
    }

    async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting: {description}");
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_notification(socket: &mut ClientSocket) -> Notification {
        loop {
            let frame = timeout(Duration::from_secs(3), socket.next())
                .await
                .expect("frame should arrive before timeout")
                .expect("socket should stay open")
                .expect("frame should be readable");
            match frame {
                WsFrame::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .expect("frame should be a notification");
                }
                WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
                other => panic!("expected notification frame, got {other:?}"),
            }
        }
    }

    async fn expect_close_code(socket: &mut ClientSocket) -> Option<CloseCode> {
        loop {
            match timeout(Duration::from_secs(3), socket.next())
                .await
                .expect("close should arrive before timeout")
            {
                Some(Ok(WsFrame::Close(frame))) => return frame.map(|frame| frame.code),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    struct StaticVerifier(Result<UserId, IdentityError>);

    impl IdentityVerifier for StaticVerifier {
        fn verify(&self, _credential: &str) -> Result<UserId, IdentityError> {
            self.0.clone()
        }
    }

    #[test]
    fn authenticate_rejects_missing_and_non_positive_identities() {
        let ok = StaticVerifier(Ok(42));
        assert_eq!(authenticate(&ok, None), Err(IdentityError::Missing));
        assert_eq!(authenticate(&ok, Some("t")), Ok(42));
        assert_eq!(
            authenticate(&StaticVerifier(Ok(0)), Some("t")),
            Err(IdentityError::MissingIdentity)
        );
        assert_eq!(
            authenticate(&StaticVerifier(Err(IdentityError::Expired)), Some("t")),
            Err(IdentityError::Expired)
        );
    }

    #[tokio::test]
    async fn handshake_without_credential_is_unauthorized() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let url = format!("ws://{}{NOTIFICATIONS_WS_PATH}", relay.addr);

        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            Err(error) => panic!("expected 401 handshake rejection, got {error}"),
            Ok(_) => panic!("handshake should have been rejected"),
        }
        assert!(relay.registry.is_empty());
    }

    #[tokio::test]
    async fn handshake_with_invalid_credential_is_unauthorized() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let url = format!("ws://{}{NOTIFICATIONS_WS_PATH}?token=not-a-jwt", relay.addr);

        match connect_async(url).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            Err(error) => panic!("expected 401 handshake rejection, got {error}"),
            Ok(_) => panic!("handshake should have been rejected"),
        }
        assert!(relay.registry.is_empty());
    }

    #[tokio::test]
    async fn valid_credential_without_upgrade_is_bad_request() {
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let token = jwt_service.issue_access_token(42).expect("token should be issued");
        let registry = Arc::new(ConnectionRegistry::default());
        let app = router(RealtimeState::new(
            Arc::clone(&registry),
            jwt_service,
            SessionConfig::default(),
        ));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("{NOTIFICATIONS_WS_PATH}?token={token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: Value = serde_json::from_slice(&body).expect("error body should be json");
        assert_eq!(parsed["error"]["code"], "UPGRADE_FAILED");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn missing_credential_is_checked_before_upgrade() {
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let app = router(RealtimeState::new(
            Arc::new(ConnectionRegistry::default()),
            jwt_service,
            SessionConfig::default(),
        ));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(NOTIFICATIONS_WS_PATH)
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_query_counts_as_missing_credential() {
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let token = jwt_service.issue_access_token(42).expect("token should be issued");
        let app = router(RealtimeState::new(
            Arc::new(ConnectionRegistry::default()),
            jwt_service,
            SessionConfig::default(),
        ));
        let duplicated = format!("{NOTIFICATIONS_WS_PATH}?token={token}&token={token}");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(duplicated.as_str())
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(duplicated.as_str())
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bearer_header_is_accepted_when_query_token_is_absent() {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let relay = TestRelay::start(SessionConfig::default()).await;
        let token = relay.jwt_service.issue_access_token(7).expect("token should be issued");
        let mut request = format!("ws://{}{NOTIFICATIONS_WS_PATH}", relay.addr)
            .into_client_request()
            .expect("client request should build");
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {token}").parse().expect("header value should parse"),
        );

        let (_socket, _) = connect_async(request).await.expect("websocket should connect");
        wait_until("session should be admitted", || relay.registry.lookup(7).is_some()).await;
    }

    #[tokio::test]
    async fn connected_user_receives_exactly_one_matching_frame() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let mut socket = relay.connect(42).await;

        let sent = notification(1, 42, "You were assigned to \"Ship v1\"");
        assert_eq!(relay.dispatcher.send(42, sent.clone()), Delivery::Queued);

        assert_eq!(next_notification(&mut socket).await, sent);
        assert!(
            timeout(Duration::from_millis(200), socket.next()).await.is_err(),
            "no further frames should arrive"
        );
    }

    #[tokio::test]
    async fn notifications_arrive_in_dispatch_order() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let mut socket = relay.connect(42).await;

        for (id, message) in [(1, "A"), (2, "B"), (3, "C")] {
            relay.dispatcher.send(42, notification(id, 42, message));
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(next_notification(&mut socket).await.message);
        }
        assert_eq!(received, ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn second_handshake_replaces_first_session() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let mut first_socket = relay.connect(42).await;
        let first_session = relay.registry.lookup(42).expect("first session registered");

        let mut second_socket = relay.connect(42).await;

        assert!(first_session.is_closed());
        assert_eq!(expect_close_code(&mut first_socket).await, Some(CloseCode::Normal));
        assert_eq!(relay.registry.connected_users(), vec![42]);

        let sent = notification(2, 42, "only the newest session");
        assert_eq!(relay.dispatcher.send(42, sent.clone()), Delivery::Queued);
        assert_eq!(next_notification(&mut second_socket).await, sent);
        assert_eq!(relay.registry.len(), 1);
    }

    #[tokio::test]
    async fn closing_queues_sends_going_away_before_deregistering() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let mut socket = relay.connect(42).await;

        assert_eq!(relay.registry.close_all(), 1);
        wait_until("session should deregister", || relay.registry.is_empty()).await;

        match timeout(Duration::from_millis(500), socket.next()).await {
            Ok(Some(Ok(WsFrame::Close(Some(frame))))) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("going-away close should already be sent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_close_is_answered_before_deregistering() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let mut socket = relay.connect(42).await;

        socket.close(None).await.expect("client close should send");
        wait_until("session should deregister", || relay.registry.is_empty()).await;

        assert!(
            matches!(
                timeout(Duration::from_millis(500), socket.next()).await,
                Ok(Some(Ok(WsFrame::Close(_))))
            ),
            "close reply should already be sent when the session is deregistered"
        );
    }

    #[tokio::test]
    async fn oversized_inbound_frame_ends_the_session() {
        use futures_util::SinkExt;

        let relay = TestRelay::start(SessionConfig::default()).await;
        let mut socket = relay.connect(42).await;

        let _ = socket.send(WsFrame::Text("x".repeat(2_048).into())).await;

        wait_until("session should deregister", || relay.registry.is_empty()).await;
    }

    #[tokio::test]
    async fn small_inbound_frames_are_ignored() {
        use futures_util::SinkExt;

        let relay = TestRelay::start(SessionConfig::default()).await;
        let mut socket = relay.connect(42).await;

        socket.send(WsFrame::Text("hello".into())).await.expect("frame should send");
        sleep(Duration::from_millis(100)).await;

        assert!(relay.registry.lookup(42).is_some());
        let sent = notification(3, 42, "still alive");
        relay.dispatcher.send(42, sent.clone());
        assert_eq!(next_notification(&mut socket).await, sent);
    }

    #[tokio::test]
    async fn acknowledging_peer_survives_past_read_deadline() {
        let relay = TestRelay::start(fast_config()).await;
        let mut socket = relay.connect(42).await;

        let reader = tokio::spawn(async move {
            let mut pings = 0_usize;
            let deadline = Instant::now() + Duration::from_millis(900);
            while Instant::now() < deadline {
                match timeout(Duration::from_millis(50), socket.next()).await {
                    Ok(Some(Ok(WsFrame::Ping(_)))) => pings += 1,
                    Ok(Some(Ok(_))) | Err(_) => {}
                    Ok(Some(Err(_)) | None) => break,
                }
            }
            (pings, socket)
        });

        let (pings, _socket) = reader.await.expect("reader task should not panic");
        assert!(pings >= 3, "expected several heartbeat pings, saw {pings}");
        assert!(relay.registry.lookup(42).is_some());
    }

    #[tokio::test]
    async fn silent_peer_is_deregistered_within_one_heartbeat_of_read_deadline() {
        let config = fast_config();
        let relay = TestRelay::start(config).await;
        let _socket = relay.connect(42).await;
        let admitted_at = Instant::now();

        wait_until("silent session should deregister", || relay.registry.lookup(42).is_none())
            .await;

        let elapsed = admitted_at.elapsed();
        let bound = config.read_deadline + config.heartbeat_interval + Duration::from_millis(150);
        let earliest = config.read_deadline - Duration::from_millis(50);
        assert!(elapsed >= earliest, "closed early: {elapsed:?}");
        assert!(elapsed < bound, "took {elapsed:?}, expected under {bound:?}");
    }

    #[tokio::test]
    async fn superseded_session_stuck_mid_write_is_released_promptly() {
        let config =
            SessionConfig { write_deadline: Duration::from_secs(3), ..SessionConfig::default() };
        let relay = TestRelay::start(config).await;
        let _stalled_socket = relay.connect(42).await;
        let first_session = relay.registry.lookup(42).expect("first session registered");

        let payload = "x".repeat(256 * 1024);
        for id in 0..64 {
            relay.dispatcher.send(42, notification(id, 42, &payload));
            sleep(Duration::from_millis(2)).await;
        }
        sleep(Duration::from_millis(50)).await;

        let mut second_socket = relay.connect(42).await;
        let replaced_at = Instant::now();
        timeout(Duration::from_millis(500), first_session.released())
            .await
            .expect("superseded session should release well before its write deadline");

        assert!(replaced_at.elapsed() < Duration::from_millis(500));
        assert_eq!(first_session.close_reason(), Some(CloseReason::Superseded));

        let sent = notification(1_000, 42, "after replacement");
        assert_eq!(relay.dispatcher.send(42, sent.clone()), Delivery::Queued);
        assert_eq!(next_notification(&mut second_socket).await, sent);
    }

    #[tokio::test]
    async fn dispatch_to_peer_that_never_reads_does_not_block() {
        let relay = TestRelay::start(SessionConfig::default()).await;
        let _socket = relay.connect(42).await;

        let started_at = Instant::now();
        let payload = "x".repeat(4_096);
        let mut dropped = 0;
        for id in 0..5_000 {
            if relay.dispatcher.send(42, notification(id, 42, &payload)) == Delivery::Dropped {
                dropped += 1;
            }
        }

        assert!(started_at.elapsed() < Duration::from_secs(2));
        assert!(dropped > 0, "a peer that never reads should eventually cause drops");
        assert_eq!(relay.dispatcher.send(99, notification(1, 99, "nobody")), Delivery::Offline);
    }
}
