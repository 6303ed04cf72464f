//! # Adapter End-to-End Tests
//!
//! Runs the `reqwest` transport and the `tokio-tungstenite` connector against
//! a local axum server speaking the service's REST and push protocols, first
//! one adapter at a time, then under a full engine.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::{Path, Query, State};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    use sync_engine::{
        ChannelConnector, ChannelState, ChannelStream, Credential, EngineConfig, HttpMethod, HttpRequest,
        HttpTransport, MemoryCredentialStore, RequestGateway, ReqwestTransport, SessionManager,
        SyncEngine, SyncError, WsConnector,
    };

    const TOKEN: &str = "secret";
    const WAIT: Duration = Duration::from_secs(5);

    // =============================================================================
    // TEST SERVER
    // =============================================================================

    #[derive(Clone)]
    struct ServerState {
        events: broadcast::Sender<String>,
        client_calls: Arc<AtomicUsize>,
        message_fetches: Arc<AtomicUsize>,
    }

    impl ServerState {
        fn new() -> Self {
            Self {
                events: broadcast::channel(16).0,
                client_calls: Arc::new(AtomicUsize::new(0)),
                message_fetches: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some(format!("Bearer {}", TOKEN).as_str())
    }

    fn guarded(headers: &HeaderMap, status: StatusCode, body: Value) -> Response {
        if !authorized(headers) {
            return (StatusCode::UNAUTHORIZED, Json(json!({"message": "bad token"}))).into_response();
        }
        (status, Json(body)).into_response()
    }

    async fn me(headers: HeaderMap) -> Response {
        guarded(&headers, StatusCode::OK, json!({"id": 7, "name": "Ada"}))
    }

    /// First call fails with 503.
    async fn clients(State(state): State<ServerState>, headers: HeaderMap) -> Response {
        if state.client_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        guarded(&headers, StatusCode::OK, json!({"data": [{"id": "c1"}]}))
    }

    async fn empty_list(headers: HeaderMap) -> Response {
        guarded(&headers, StatusCode::OK, json!([]))
    }

    async fn list_messages(
        State(state): State<ServerState>,
        Path(conversation): Path<String>,
        headers: HeaderMap,
    ) -> Response {
        state.message_fetches.fetch_add(1, Ordering::SeqCst);
        guarded(
            &headers,
            StatusCode::OK,
            json!([{"id": "m1", "conversation_id": conversation, "text": "earlier"}]),
        )
    }

    async fn create_message(
        Path(conversation): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        guarded(
            &headers,
            StatusCode::CREATED,
            json!({"data": {"id": "m2", "conversation_id": conversation, "text": body["text"]}}),
        )
    }

    async fn push(
        State(state): State<ServerState>,
        Query(params): Query<HashMap<String, String>>,
        upgrade: WebSocketUpgrade,
    ) -> Response {
        if params.get("token").map(String::as_str) != Some(TOKEN) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let events = state.events.subscribe();
        upgrade.on_upgrade(move |socket| forward(socket, events))
    }

    async fn forward(mut socket: WebSocket, mut events: broadcast::Receiver<String>) {
        while let Ok(text) = events.recv().await {
            if socket.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    }

    async fn spawn_server(state: ServerState) -> SocketAddr {
        let app = Router::new()
            .route("/api/me", get(me))
            .route("/api/clients", get(clients))
            .route("/api/scheduled-messages", get(empty_list))
            .route("/api/nudges", get(empty_list))
            .route(
                "/api/conversations/:conversation/messages",
                get(list_messages).post(create_message),
            )
            .route("/ws", get(push))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // =============================================================================
    // HTTP TRANSPORT
    // =============================================================================

    #[tokio::test]
    async fn test_reqwest_transport_sends_bearer() {
        let addr = spawn_server(ServerState::new()).await;
        let transport =
            ReqwestTransport::new(&format!("http://{}/api", addr), Duration::from_secs(2)).unwrap();

        let mut request = HttpRequest {
            method: HttpMethod::Get,
            path: "me".into(),
            body: None,
            bearer: Some(Credential::new(TOKEN)),
        };
        let response = transport.send(&request).await.unwrap();
        assert_eq!(response.status, 200);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["name"], "Ada");

        request.bearer = None;
        assert_eq!(transport.send(&request).await.unwrap().status, 401);
    }

    #[tokio::test]
    async fn test_gateway_retries_service_unavailable_over_http() {
        let state = ServerState::new();
        let addr = spawn_server(state.clone()).await;
        let transport = Arc::new(
            ReqwestTransport::new(&format!("http://{}/api/", addr), Duration::from_secs(2))
                .unwrap(),
        );
        let session = Arc::new(SessionManager::new(Arc::new(
            MemoryCredentialStore::with_credential(Credential::new(TOKEN)),
        )));
        session.restore().unwrap();
        let gateway = RequestGateway::new(
            transport,
            session,
            EngineConfig::for_testing().retry.to_policy(),
        );

        let body = gateway.get("clients").await.unwrap();

        assert_eq!(body["data"][0]["id"], "c1");
        assert_eq!(state.client_calls.load(Ordering::SeqCst), 2);
    }

    // =============================================================================
    // PUSH CONNECTOR
    // =============================================================================

    #[tokio::test]
    async fn test_ws_connector_receives_pushed_frames() {
        let state = ServerState::new();
        let addr = spawn_server(state.clone()).await;
        let connector = WsConnector::new(&format!("ws://{}/ws", addr), "token").unwrap();

        let mut stream = connector.connect(&Credential::new(TOKEN)).await.unwrap();
        let frame = r#"{"type":"message.created","payload":{"id":"m9"}}"#;
        state.events.send(frame.to_string()).unwrap();

        let received = timeout(WAIT, stream.next_frame()).await.unwrap();
        assert_eq!(received, Some(Ok(frame.to_string())));
        stream.close().await;
    }

    #[tokio::test]
    async fn test_ws_connector_rejected_token() {
        let addr = spawn_server(ServerState::new()).await;
        let connector = WsConnector::new(&format!("ws://{}/ws", addr), "token").unwrap();

        let result = connector.connect(&Credential::new("wrong")).await;
        assert!(matches!(result, Err(SyncError::ChannelError(_))));
    }

    // =============================================================================
    // FULL ENGINE
    // =============================================================================

    #[tokio::test]
    async fn test_engine_against_live_server() {
        let state = ServerState::new();
        let addr = spawn_server(state.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let credential_path = dir.path().join("credential.json");

        let mut config = EngineConfig::for_testing();
        config.api_base_url = format!("http://{}/api", addr);
        config.ws_url = format!("ws://{}/ws", addr);
        config.credential_path = Some(credential_path.clone());

        let engine = SyncEngine::from_config(config).unwrap();
        engine.set_active_conversation(Some("c1".into()));
        engine.start();
        engine.login(Credential::new(TOKEN)).unwrap();
        assert!(credential_path.exists());

        let store = engine.store().clone();
        eventually(|| {
            matches!(&*store.user.get(), Some(user) if user.id() == "7")
                && store.messages.get().len() == 1
                && store.clients.get().len() == 1
        })
        .await;
        eventually(|| engine.channel().state() == ChannelState::Open).await;

        let receipt = engine.send_message("Hello").await.unwrap();
        assert_eq!(receipt.record.unwrap().id(), "m2");
        let ids: Vec<String> = store.messages.get().iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        let fetches = state.message_fetches.load(Ordering::SeqCst);
        state
            .events
            .send(r#"{"type":"message.created","payload":{"id":"m2"}}"#.to_string())
            .unwrap();
        eventually(|| state.message_fetches.load(Ordering::SeqCst) > fetches).await;

        assert!(engine.logout());
        assert!(!credential_path.exists());
        assert!(store.messages.get().is_empty());
        engine.shutdown().await;
    }
}
