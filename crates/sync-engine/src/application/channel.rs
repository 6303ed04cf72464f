//! # Realtime Event Channel
//!
//! One push connection per authenticated session, owned by a single
//! supervisor task:
//!
//! ```text
//!  open() ─▶ Connecting ──ok──▶ Open ──frames──▶ dispatch
//!               ▲   │err          │ lost / peer close / signal
//!               │   ▼             ▼
//!               └── Disconnected (backoff) ◀──┘
//!  teardown() from any state ─▶ Closed
//! ```
//!
//! Because reconnects happen inside that one task, a lost connection can only
//! ever produce one reconnect attempt at a time; extra "connection lost"
//! signals while a reconnect is pending are ignored.
//!
//! Subscribers live in a registry that is read at dispatch time, so every
//! event reaches the handlers registered *now*, never a set captured when the
//! connection opened.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::session::SessionManager;
use crate::config::ChannelConfig;
use crate::domain::{ChannelEvent, ChannelState, SessionEpoch, WILDCARD_EVENT};
use crate::ports::{ChannelConnector, ChannelStream, EventHandler, SessionObserver};

/// Channel counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Successful connects
    pub connects: AtomicU64,
    /// Reconnects scheduled after a loss or failed connect
    pub reconnects: AtomicU64,
    /// Text frames received
    pub frames_received: AtomicU64,
    /// Malformed frames dropped
    pub frames_dropped: AtomicU64,
    /// Events handed to at least one subscriber
    pub events_dispatched: AtomicU64,
}

struct Registration {
    id: u64,
    handler: EventHandler,
}

struct ConnectionTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum PumpExit {
    Lost(String),
    Shutdown,
}

/// Session-scoped push channel.
pub struct RealtimeChannel {
    connector: Arc<dyn ChannelConnector>,
    session: Arc<SessionManager>,
    config: ChannelConfig,
    registry: RwLock<HashMap<String, Vec<Registration>>>,
    next_subscriber: AtomicU64,
    // Bumped by open() and teardown(); a task only acts while its value is current.
    generation: AtomicU64,
    // Held around each liveness check plus handler call, and by teardown.
    // Re-entrant: a handler may tear the channel down.
    dispatch_lock: ReentrantMutex<()>,
    state_tx: watch::Sender<ChannelState>,
    connection: Mutex<Option<ConnectionTask>>,
    // Cleared while Open; the first loss signal sets it and later ones are ignored.
    reconnect_pending: AtomicBool,
    lost_tx: watch::Sender<u64>,
    stats: ChannelStats,
}

impl RealtimeChannel {
    /// Closed channel.
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        session: Arc<SessionManager>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            connector,
            session,
            config,
            registry: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            dispatch_lock: ReentrantMutex::new(()),
            state_tx: watch::channel(ChannelState::Closed).0,
            connection: Mutex::new(None),
            reconnect_pending: AtomicBool::new(true),
            lost_tx: watch::channel(0).0,
            stats: ChannelStats::default(),
        }
    }

    /// Start the connection supervisor.
    ///
    /// No-op (returns `false`) while a supervisor is running or when there is
    /// no valid credential. Must be called within a tokio runtime.
    pub fn open(self: &Arc<Self>) -> bool {
        let mut connection = self.connection.lock();
        if connection.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            debug!("Channel already open");
            return false;
        }
        if self.session.get_credential().is_none() {
            debug!("Not opening channel without a credential");
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch = self.session.epoch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channel = Arc::clone(self);
        let handle = tokio::spawn(async move {
            channel.supervise(generation, epoch, shutdown_rx).await;
        });

        *connection = Some(ConnectionTask {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Close the connection and discard every registration.
    ///
    /// Once this returns no handler is invoked again, even for frames already
    /// in flight. A handler running on another thread is waited for; a
    /// handler may call this itself.
    pub fn teardown(&self) {
        self.stop();
    }

    /// [`teardown`](Self::teardown), then wait for the supervisor to finish.
    pub async fn close(&self) {
        if let Some(handle) = self.stop() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Channel supervisor ended abnormally");
            }
        }
    }

    /// Hint that the network dropped (e.g. from an OS connectivity monitor).
    ///
    /// Returns `true` if this signal scheduled the reconnect; `false` when the
    /// channel is not open or a reconnect is already pending.
    pub fn signal_connection_lost(&self) -> bool {
        if self
            .reconnect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already pending; ignoring loss signal");
            return false;
        }
        self.lost_tx.send_modify(|signals| *signals += 1);
        true
    }

    /// Register `handler` for `event_type` (`"*"` for every type).
    pub fn subscribe<F>(self: &Arc<Self>, event_type: &str, handler: F) -> SubscriberHandle
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.registry
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });

        SubscriberHandle {
            id,
            event_type: event_type.to_string(),
            channel: Arc::downgrade(self),
        }
    }

    /// Registered handlers for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.registry.read().get(event_type).map_or(0, Vec::len)
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Connection state updates.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Channel counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    fn stop(&self) -> Option<JoinHandle<()>> {
        let _dispatch = self.dispatch_lock.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reconnect_pending.store(true, Ordering::SeqCst);
        self.registry.write().clear();

        let task = self.connection.lock().take();
        self.state_tx.send_replace(ChannelState::Closed);

        let task = task?;
        // The supervisor also exits when the sender is dropped.
        let _ = task.shutdown_tx.send(true);
        info!("Channel torn down");
        Some(task.handle)
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish(&self, generation: u64, state: ChannelState) {
        // The check runs under the watch lock, so a concurrent teardown's
        // Closed can never be overwritten.
        self.state_tx.send_if_modified(|current| {
            if !self.is_live(generation) || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        epoch: SessionEpoch,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let backoff = self.config.reconnect_backoff();
        let mut failures = 0u32;

        loop {
            if !self.is_live(generation) || !self.session.is_current(epoch) {
                break;
            }
            let Some(credential) = self.session.get_credential() else {
                debug!("Credential gone; stopping channel");
                break;
            };

            self.publish(generation, ChannelState::Connecting);
            let attempt = tokio::select! {
                result = self.connector.connect(&credential) => result,
                _ = shutdown_rx.changed() => break,
            };

            match attempt {
                Ok(mut stream) => {
                    if !self.is_live(generation) {
                        stream.close().await;
                        break;
                    }
                    failures = 0;
                    self.stats.connects.fetch_add(1, Ordering::Relaxed);

                    let mut lost_rx = self.lost_tx.subscribe();
                    self.reconnect_pending.store(false, Ordering::SeqCst);
                    self.publish(generation, ChannelState::Open);
                    info!(epoch = %epoch, "Channel open");

                    let exit = self
                        .pump(generation, &mut stream, &mut shutdown_rx, &mut lost_rx)
                        .await;
                    self.reconnect_pending.store(true, Ordering::SeqCst);
                    stream.close().await;

                    match exit {
                        PumpExit::Shutdown => break,
                        PumpExit::Lost(reason) => {
                            warn!(reason = %reason, "Channel connection lost");
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, error = %e, "Channel connect failed");
                }
            }

            if !self.is_live(generation) {
                break;
            }
            self.publish(generation, ChannelState::Disconnected);

            if let Some(max) = self.config.max_reconnect_attempts {
                if failures >= max {
                    error!(attempts = failures, "Giving up on channel reconnects");
                    break;
                }
            }

            let delay = backoff.delay_for(failures.max(1));
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            debug!(delay_ms = delay.as_millis() as u64, "Channel reconnect scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn pump(
        &self,
        generation: u64,
        stream: &mut Box<dyn ChannelStream>,
        shutdown_rx: &mut watch::Receiver<bool>,
        lost_rx: &mut watch::Receiver<u64>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                frame = stream.next_frame() => match frame {
                    Some(Ok(text)) => self.handle_frame(generation, &text),
                    Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                    None => return PumpExit::Lost("closed by peer".to_string()),
                },
                _ = lost_rx.changed() => return PumpExit::Lost("connection lost signal".to_string()),
                _ = shutdown_rx.changed() => return PumpExit::Shutdown,
            }
        }
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        match ChannelEvent::parse(text) {
            Ok(event) => self.dispatch(generation, &event),
            Err(e) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = text.len(), "Dropping malformed frame");
            }
        }
    }

    fn dispatch(&self, generation: u64, event: &ChannelEvent) {
        let handlers: Vec<EventHandler> = {
            let registry = self.registry.read();
            let mut keys = vec![event.event_type.as_str()];
            if event.event_type != WILDCARD_EVENT {
                keys.push(WILDCARD_EVENT);
            }
            keys.into_iter()
                .filter_map(|key| registry.get(key))
                .flatten()
                .map(|registration| Arc::clone(&registration.handler))
                .collect()
        };

        if handlers.is_empty() {
            debug!(event_type = %event.event_type, "No subscribers for event");
            return;
        }

        for handler in handlers {
            let _dispatch = self.dispatch_lock.lock();
            if !self.is_live(generation) {
                debug!(event_type = %event.event_type, "Channel torn down mid-dispatch");
                return;
            }
            handler(event);
        }
        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn unregister(&self, event_type: &str, id: u64) {
        let mut registry = self.registry.write();
        if let Some(registrations) = registry.get_mut(event_type) {
            registrations.retain(|r| r.id != id);
            if registrations.is_empty() {
                registry.remove(event_type);
            }
        }
    }
}

impl SessionObserver for RealtimeChannel {
    fn on_invalidated(&self, _epoch: SessionEpoch) {
        self.teardown();
    }
}

/// Registration handle. Dropping it unregisters the handler.
#[must_use = "dropping the handle unregisters the handler"]
pub struct SubscriberHandle {
    id: u64,
    event_type: String,
    channel: Weak<RealtimeChannel>,
}

impl SubscriberHandle {
    /// Event type the handler is registered for.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Swap the handler in place; the next dispatched event uses the new one.
    ///
    /// Returns `false` if the registration was discarded by a teardown.
    pub fn replace<F>(&self, handler: F) -> bool
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let Some(channel) = self.channel.upgrade() else {
            return false;
        };
        let mut registry = channel.registry.write();
        match registry
            .get_mut(&self.event_type)
            .and_then(|regs| regs.iter_mut().find(|r| r.id == self.id))
        {
            Some(registration) => {
                registration.handler = Arc::new(handler);
                true
            }
            None => false,
        }
    }

    /// Still registered (not dropped by a teardown).
    pub fn is_registered(&self) -> bool {
        self.channel.upgrade().is_some_and(|channel| {
            channel
                .registry
                .read()
                .get(&self.event_type)
                .is_some_and(|regs| regs.iter().any(|r| r.id == self.id))
        })
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unregister(&self.event_type, self.id);
        }
    }
}
