//! # Cross-Component Scenarios
//!
//! Drives a full [`SyncEngine`](sync_engine::SyncEngine) over the in-memory
//! port mocks:
//!
//! 1. **Offline send**: provisional message appears, retries exhaust, rollback
//! 2. **Concurrent refreshes**: identical results notify subscribers once
//! 3. **Logout mid-flight**: late responses never reach the cleared store
//! 4. **Reconnect**: push bindings survive a dropped connection
//! 5. **Server 401**: one rejected request logs the client out everywhere
//! 6. **Durable session**: restore from a credential file, expiry honored

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use sync_engine::{
        ChannelState, Credential, CredentialStore, EngineConfig, FileCredentialStore, HttpMethod,
        MemoryCredentialStore, MockConnector, MockReply, MockTransport, SyncEngine, SyncError,
    };

    const WAIT: Duration = Duration::from_secs(5);

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    struct Harness {
        engine: Arc<SyncEngine>,
        transport: Arc<MockTransport>,
        connector: Arc<MockConnector>,
    }

    /// Transport answering every collection route with one record.
    fn seeded_transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport
            .always(HttpMethod::Get, "me", MockReply::ok(json!({"id": "u1"})))
            .always(HttpMethod::Get, "clients", MockReply::ok(json!([{"id": "c1"}])))
            .always(HttpMethod::Get, "scheduled-messages", MockReply::ok(json!([])))
            .always(HttpMethod::Get, "nudges", MockReply::ok(json!([])))
            .always(
                HttpMethod::Get,
                "conversations/c1/messages",
                MockReply::ok(json!([{"id": "m1", "text": "earlier"}])),
            );
        transport
    }

    fn harness_with(
        transport: Arc<MockTransport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Harness {
        let connector = Arc::new(MockConnector::new());
        let engine = SyncEngine::new(
            EngineConfig::for_testing(),
            transport.clone(),
            connector.clone(),
            credentials,
        )
        .unwrap();
        Harness {
            engine,
            transport,
            connector,
        }
    }

    fn harness() -> Harness {
        harness_with(seeded_transport(), Arc::new(MemoryCredentialStore::new()))
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // =============================================================================
    // OPTIMISTIC SENDS
    // =============================================================================

    #[tokio::test]
    async fn test_offline_send_shows_provisional_then_rolls_back() {
        let h = harness();
        let gate = Arc::new(Notify::new());
        h.transport
            .enqueue(
                HttpMethod::Post,
                "conversations/c1/messages",
                MockReply::gated(&gate, MockReply::Fail("offline".into())),
            )
            .always(
                HttpMethod::Post,
                "conversations/c1/messages",
                MockReply::Fail("offline".into()),
            );

        let store = h.engine.store().clone();
        h.engine.set_active_conversation(Some("c1".into()));
        h.engine.start();
        h.engine.login(Credential::new("tok")).unwrap();
        eventually(|| store.messages.get().len() == 1).await;
        let messages = &store.messages;

        let engine = h.engine.clone();
        let send = tokio::spawn(async move { engine.send_message("Hello").await });

        eventually(|| {
            messages
                .get()
                .iter()
                .any(|m| m.is_provisional() && m.field("text") == Some(&json!("Hello")))
        })
        .await;
        assert_eq!(
            h.engine.send_message("again").await,
            Err(SyncError::MutationInFlight("composer:c1".into()))
        );

        gate.notify_one();
        let result = send.await.unwrap();

        assert!(matches!(result, Err(SyncError::TransportError(_))));
        assert_eq!(h.transport.count(HttpMethod::Post, "conversations/c1/messages"), 3);
        let transcript = messages.get();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].id(), "m1");
        assert!(h.engine.mutations().pending("composer:c1").is_none());
    }

    #[tokio::test]
    async fn test_confirmed_send_replaces_provisional() {
        let h = harness();
        h.transport.enqueue(
            HttpMethod::Post,
            "conversations/c1/messages",
            MockReply::Json(201, json!({"id": "m2", "text": "Hello"})),
        );

        let store = h.engine.store().clone();
        h.engine.set_active_conversation(Some("c1".into()));
        h.engine.start();
        h.engine.login(Credential::new("tok")).unwrap();
        eventually(|| store.messages.get().len() == 1).await;

        let receipt = h.engine.send_message("Hello").await.unwrap();
        assert!(receipt.temp_id.as_str().starts_with("tmp-"));

        let ids: Vec<String> = store
            .messages
            .get()
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        let posted = h.transport.requests_to(HttpMethod::Post, "conversations/c1/messages");
        assert_eq!(posted[0].request.body, Some(json!({"text": "Hello"})));
    }

    // =============================================================================
    // STORE NOTIFICATIONS
    // =============================================================================

    #[tokio::test]
    async fn test_concurrent_identical_refreshes_notify_once() {
        let h = harness();
        h.engine.start();
        h.engine.login(Credential::new("tok")).unwrap();
        let store = h.engine.store().clone();
        eventually(|| !store.clients.get().is_empty()).await;

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let _sub = store.clients.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let roster = json!([{"id": "c1"}, {"id": "c2"}]);
        h.transport
            .enqueue(HttpMethod::Get, "clients", MockReply::ok(roster.clone()))
            .enqueue(HttpMethod::Get, "clients", MockReply::ok(roster));

        let (a, b) = tokio::join!(h.engine.refresh_clients(), h.engine.refresh_clients());
        let changed = [a.unwrap(), b.unwrap()];

        assert_eq!(changed.iter().filter(|c| **c).count(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(store.clients.get().len(), 2);
    }

    // =============================================================================
    // SESSION LIFECYCLE
    // =============================================================================

    #[tokio::test]
    async fn test_logout_discards_late_response() {
        let transport = seeded_transport();
        let gate = Arc::new(Notify::new());
        transport.enqueue(
            HttpMethod::Get,
            "clients",
            MockReply::gated(&gate, MockReply::ok(json!([{"id": "stale"}]))),
        );
        let h = harness_with(transport, Arc::new(MemoryCredentialStore::new()));

        h.engine.start();
        h.engine.login(Credential::new("tok")).unwrap();
        eventually(|| h.transport.count(HttpMethod::Get, "clients") == 1).await;

        assert!(h.engine.logout());
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.engine.store().clients.get().is_empty());
        assert!(h.engine.store().user.get().is_none());

        h.engine.login(Credential::new("tok2")).unwrap();
        let store = h.engine.store().clone();
        eventually(|| store.clients.get().first().map(|c| c.id() == "c1") == Some(true)).await;
    }

    #[tokio::test]
    async fn test_unauthorized_response_logs_out_everywhere() {
        let transport = seeded_transport();
        transport.always(HttpMethod::Get, "nudges", MockReply::status(401));
        let credentials = Arc::new(MemoryCredentialStore::new());
        let h = harness_with(transport, credentials.clone());

        let mut status = h.engine.session().subscribe();
        h.engine.start();
        h.engine.login(Credential::new("revoked")).unwrap();

        timeout(WAIT, status.wait_for(|s| !s.is_authenticated()))
            .await
            .expect("session never invalidated")
            .unwrap();

        assert!(credentials.stored().is_none());
        assert_eq!(h.engine.channel().state(), ChannelState::Closed);
        assert!(h.engine.store().clients.get().is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_credential_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        FileCredentialStore::new(&path)
            .save(&Credential::new("kept"))
            .unwrap();

        let h = harness_with(seeded_transport(), Arc::new(FileCredentialStore::new(&path)));
        assert!(h.engine.start());
        eventually(|| h.engine.channel().state() == ChannelState::Open).await;
        assert_eq!(h.connector.latest().unwrap().token(), "kept");

        h.engine.logout();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_expired_credential_is_not_restored() {
        let expired = Credential::with_expiry("old", chrono::Utc::now() - chrono::Duration::minutes(1));
        let credentials = Arc::new(MemoryCredentialStore::with_credential(expired));
        let h = harness_with(seeded_transport(), credentials.clone());

        assert!(!h.engine.start());
        assert!(credentials.stored().is_none());
        assert_eq!(h.connector.attempts(), 0);
    }

    // =============================================================================
    // PUSH CHANNEL
    // =============================================================================

    #[tokio::test]
    async fn test_bindings_survive_reconnect() {
        let h = harness();
        h.engine.start();
        h.engine.login(Credential::new("tok")).unwrap();
        eventually(|| h.engine.channel().state() == ChannelState::Open).await;

        h.connector.latest().unwrap().fail("connection reset");
        timeout(WAIT, h.connector.wait_for_attempts(2)).await.unwrap();
        eventually(|| {
            h.connector.connection_count() == 2 && h.engine.channel().state() == ChannelState::Open
        })
        .await;

        let before = h.transport.count(HttpMethod::Get, "nudges");
        h.connector
            .latest()
            .unwrap()
            .push_event("nudge.updated", json!({"id": "n1"}));

        eventually(|| h.transport.count(HttpMethod::Get, "nudges") > before).await;
    }
}
