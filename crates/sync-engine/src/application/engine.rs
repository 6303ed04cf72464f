//! # Sync Engine
//!
//! Wires the session, gateway, channel, store and mutation coordinator into
//! one object with the intents a client issues: log in or out, pick a
//! conversation, refresh collections and send messages.
//!
//! A background session watcher reacts to every new authenticated epoch by
//! installing the event bindings, opening the channel and running an initial
//! refresh. Invalidation needs no watcher: the channel and the store are
//! session observers and are torn down before `invalidate()` returns.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{RealtimeChannel, SubscriberHandle};
use super::gateway::RequestGateway;
use super::mutation::{MutationCoordinator, MutationRequest};
use super::session::SessionManager;
use super::store::{ListKind, SyncStore};
use crate::adapters::{FileCredentialStore, MemoryCredentialStore, ReqwestTransport, WsConnector};
use crate::config::{BindingAction, EngineConfig};
use crate::domain::{
    decode_records, ChannelEvent, Credential, MutationReceipt, Record, SessionEpoch,
    SessionStatus, SyncError,
};
use crate::ports::{ChannelConnector, CredentialStore, HttpMethod, HttpTransport, SessionObserver};

/// Client synchronization engine.
pub struct SyncEngine {
    config: EngineConfig,
    session: Arc<SessionManager>,
    gateway: Arc<RequestGateway>,
    channel: Arc<RealtimeChannel>,
    store: Arc<SyncStore>,
    mutations: MutationCoordinator,
    active_conversation: RwLock<Option<String>>,
    bindings: Mutex<Vec<SubscriberHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Engine over explicit adapters.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn ChannelConnector>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Arc<Self>, SyncError> {
        config.validate()?;

        let session = Arc::new(SessionManager::new(credentials));
        let gateway = Arc::new(RequestGateway::new(
            transport,
            Arc::clone(&session),
            config.retry.to_policy(),
        ));
        let channel = Arc::new(RealtimeChannel::new(
            connector,
            Arc::clone(&session),
            config.channel.clone(),
        ));
        let store = Arc::new(SyncStore::new());

        // Channel first: no dispatch may reach a store being cleared.
        let channel_observer: Arc<dyn SessionObserver> = channel.clone();
        let store_observer: Arc<dyn SessionObserver> = store.clone();
        session.add_observer(&channel_observer);
        session.add_observer(&store_observer);

        let mutations = MutationCoordinator::new(Arc::clone(&gateway), Arc::clone(&session));

        Ok(Arc::new(Self {
            config,
            session,
            gateway,
            channel,
            store,
            mutations,
            active_conversation: RwLock::new(None),
            bindings: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Engine with the production adapters: `reqwest`, `tokio-tungstenite`
    /// and a file-backed credential slot (in-memory without `credential_path`).
    pub fn from_config(config: EngineConfig) -> Result<Arc<Self>, SyncError> {
        config.validate()?;

        let transport = Arc::new(ReqwestTransport::new(
            &config.api_base_url,
            config.request_timeout(),
        )?);
        let connector = Arc::new(WsConnector::new(&config.ws_url, config.channel.token_param.clone())?);
        let credentials: Arc<dyn CredentialStore> = match &config.credential_path {
            Some(path) => Arc::new(FileCredentialStore::new(path)),
            None => Arc::new(MemoryCredentialStore::new()),
        };

        Self::new(config, transport, connector, credentials)
    }

    /// Spawn the session watcher and poller, then restore a persisted session.
    ///
    /// Returns whether a session was restored. Must be called within a tokio
    /// runtime, before `login`.
    pub fn start(self: &Arc<Self>) -> bool {
        let status_rx = self.session.subscribe();
        let watcher = tokio::spawn(watch_session(Arc::downgrade(self), status_rx));
        self.tasks.lock().push(watcher);

        if let Some(interval) = self.config.poll_interval() {
            let poller = tokio::spawn(poll(Arc::downgrade(self), interval));
            self.tasks.lock().push(poller);
        }

        self.session.restore().is_some()
    }

    /// Adopt `credential`; the watcher then opens the channel and refreshes.
    pub fn login(&self, credential: Credential) -> Result<SessionEpoch, SyncError> {
        self.session.set_credential(credential)
    }

    /// End the session. Returns `false` if there was none.
    pub fn logout(&self) -> bool {
        self.session.invalidate()
    }

    /// Stop background work and close the channel. The persisted credential
    /// is kept for the next `start`.
    pub async fn shutdown(&self) {
        self.bindings.lock().clear();
        self.channel.close().await;
        // No handler runs past close, so nothing spawns after the drain.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Sync engine stopped");
    }

    /// Switch the active conversation. The transcript is emptied on change
    /// and writes still in flight for the previous conversation are dropped;
    /// call [`refresh_messages`](Self::refresh_messages) to load the new one.
    pub fn set_active_conversation(&self, conversation_id: Option<String>) -> bool {
        {
            let mut active = self.active_conversation.write();
            if *active == conversation_id {
                return false;
            }
            *active = conversation_id;
        }
        self.store.messages.rescope();
        true
    }

    /// Switch to `conversation_id` and load its transcript.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<bool, SyncError> {
        self.set_active_conversation(Some(conversation_id.to_string()));
        self.refresh_messages().await
    }

    /// Conversation whose transcript the messages collection holds.
    pub fn active_conversation(&self) -> Option<String> {
        self.active_conversation.read().clone()
    }

    /// Re-fetch the session user.
    pub async fn refresh_user(&self) -> Result<bool, SyncError> {
        let fetched = self
            .gateway
            .send(&self.config.routes.user, HttpMethod::Get, None)
            .await?;
        let user = Record::from_response(fetched.value)?;
        Ok(self.store.user.set_at(fetched.epoch, user))
    }

    /// Re-fetch the client roster.
    pub async fn refresh_clients(&self) -> Result<bool, SyncError> {
        self.refresh_list(ListKind::Clients, &self.config.routes.clients, None)
            .await
    }

    /// Re-fetch scheduled messages.
    pub async fn refresh_scheduled(&self) -> Result<bool, SyncError> {
        self.refresh_list(
            ListKind::Scheduled,
            &self.config.routes.scheduled,
            Some(SCHEDULE_SLOT_PREFIX),
        )
        .await
    }

    /// Re-fetch nudges.
    pub async fn refresh_nudges(&self) -> Result<bool, SyncError> {
        self.refresh_list(ListKind::Nudges, &self.config.routes.nudges, None)
            .await
    }

    /// Re-fetch the active conversation's transcript. `Ok(false)` without one.
    ///
    /// Messages still being sent stay visible after the fetched list. The
    /// result is dropped if the conversation switched meanwhile.
    pub async fn refresh_messages(&self) -> Result<bool, SyncError> {
        // Scope before conversation: a switch in between drops the write.
        let scope = self.store.messages.scope();
        let Some(conversation_id) = self.active_conversation() else {
            return Ok(false);
        };

        let route = self.config.routes.messages_for(&conversation_id);
        let fetched = self.gateway.send(&route, HttpMethod::Get, None).await?;
        let records = decode_records(fetched.value)?;

        let slot = composer_slot(&conversation_id);
        Ok(self.store.messages.update_scoped(fetched.epoch, scope, |_| {
            with_pending(records, self.mutations.provisional_records(|s| s == slot))
        }))
    }

    /// Re-fetch everything concurrently. Every collection is attempted; the
    /// first failure is returned.
    pub async fn refresh_all(&self) -> Result<(), SyncError> {
        let (user, clients, messages, scheduled, nudges) = tokio::join!(
            self.refresh_user(),
            self.refresh_clients(),
            self.refresh_messages(),
            self.refresh_scheduled(),
            self.refresh_nudges(),
        );

        let mut first_error = None;
        for (name, result) in [
            ("user", user),
            ("clients", clients),
            ("messages", messages),
            ("scheduled", scheduled),
            ("nudges", nudges),
        ] {
            if let Err(e) = result {
                warn!(collection = name, error = %e, "Refresh failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Send `text` to the active conversation optimistically.
    pub async fn send_message(&self, text: &str) -> Result<MutationReceipt, SyncError> {
        let scope = self.store.messages.scope();
        let conversation_id = self
            .active_conversation()
            .ok_or(SyncError::NoActiveConversation)?;

        let payload = json!({
            "conversation_id": conversation_id,
            "text": text,
            "created_at": Utc::now(),
        });
        let request = MutationRequest::post(
            self.config.routes.messages_for(&conversation_id),
            json!({ "text": text }),
        );

        self.mutations
            .submit_scoped(
                &composer_slot(&conversation_id),
                &self.store.messages,
                scope,
                payload,
                request,
            )
            .await
    }

    /// Schedule `text` for `send_at` optimistically.
    pub async fn schedule_message(
        &self,
        conversation_id: &str,
        text: &str,
        send_at: DateTime<Utc>,
    ) -> Result<MutationReceipt, SyncError> {
        let body = json!({
            "conversation_id": conversation_id,
            "text": text,
            "send_at": send_at,
        });

        self.mutations
            .submit(
                &format!("{}{}", SCHEDULE_SLOT_PREFIX, conversation_id),
                &self.store.scheduled,
                body.clone(),
                MutationRequest::post(self.config.routes.scheduled.clone(), body),
            )
            .await
    }

    /// Entity cache.
    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Session manager.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Push channel.
    pub fn channel(&self) -> &Arc<RealtimeChannel> {
        &self.channel
    }

    /// Request gateway.
    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    /// Mutation coordinator.
    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    /// Configuration in force.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace a list wholesale. Pending mutations whose slot starts with
    /// `pending_prefix` keep their provisional records in it.
    async fn refresh_list(
        &self,
        kind: ListKind,
        route: &str,
        pending_prefix: Option<&str>,
    ) -> Result<bool, SyncError> {
        let fetched = self.gateway.send(route, HttpMethod::Get, None).await?;
        let records = decode_records(fetched.value)?;
        Ok(self.store.list(kind).update_at(fetched.epoch, |_| match pending_prefix {
            Some(prefix) => with_pending(
                records,
                self.mutations.provisional_records(|slot| slot.starts_with(prefix)),
            ),
            None => records,
        }))
    }

    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn on_session_started(self: &Arc<Self>, epoch: SessionEpoch) {
        info!(epoch = %epoch, "Session active; wiring realtime bindings");
        self.install_bindings();
        self.channel.open();

        let engine = Arc::clone(self);
        self.spawn_tracked(async move {
            if let Err(e) = engine.refresh_all().await {
                debug!(error = %e, "Initial refresh incomplete");
            }
        });
    }

    fn install_bindings(self: &Arc<Self>) {
        let handles: Vec<SubscriberHandle> = self
            .config
            .bindings
            .iter()
            .map(|binding| {
                let engine = Arc::downgrade(self);
                let action = binding.action;
                self.channel.subscribe(&binding.event_type, move |event| {
                    if let Some(engine) = engine.upgrade() {
                        engine.on_event(action, event);
                    }
                })
            })
            .collect();

        // Dropping the previous handles unregisters them.
        *self.bindings.lock() = handles;
    }

    fn on_event(self: &Arc<Self>, action: BindingAction, event: &ChannelEvent) {
        debug!(event_type = %event.event_type, ?action, "Push event");

        if action == BindingAction::Invalidate {
            warn!(event_type = %event.event_type, "Session revoked by server");
            self.session.invalidate();
            return;
        }

        let engine = Arc::clone(self);
        self.spawn_tracked(async move {
            let result = match action {
                BindingAction::RefreshUser => engine.refresh_user().await,
                BindingAction::RefreshClients => engine.refresh_clients().await,
                BindingAction::RefreshMessages => engine.refresh_messages().await,
                BindingAction::RefreshScheduled => engine.refresh_scheduled().await,
                BindingAction::RefreshNudges => engine.refresh_nudges().await,
                BindingAction::Invalidate => Ok(false),
            };
            if let Err(e) = result {
                debug!(?action, error = %e, "Push-triggered refresh failed");
            }
        });
    }
}

const SCHEDULE_SLOT_PREFIX: &str = "schedule:";

fn composer_slot(conversation_id: &str) -> String {
    format!("composer:{}", conversation_id)
}

/// `fetched` followed by the provisional records it does not already hold.
fn with_pending(mut fetched: Vec<Record>, provisional: Vec<Record>) -> Vec<Record> {
    for record in provisional {
        if !fetched.iter().any(|r| r.id() == record.id()) {
            fetched.push(record);
        }
    }
    fetched
}

async fn watch_session(engine: Weak<SyncEngine>, mut status_rx: watch::Receiver<SessionStatus>) {
    let mut started: Option<SessionEpoch> = None;

    loop {
        let status = *status_rx.borrow_and_update();
        if let SessionStatus::Authenticated(epoch) = status {
            if started != Some(epoch) {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                started = Some(epoch);
                engine.on_session_started(epoch);
            }
        }

        if status_rx.changed().await.is_err() {
            break;
        }
    }
}

async fn poll(engine: Weak<SyncEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; session start already refreshes.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else {
            break;
        };
        if !engine.session.is_authenticated() {
            continue;
        }
        if let Err(e) = engine.refresh_all().await {
            debug!(error = %e, "Periodic refresh incomplete");
        }
    }
}
