//! # Session Manager
//!
//! Sole owner of the credential. Every session change bumps the
//! [`SessionEpoch`]; dependents are torn down through one path,
//! [`SessionManager::invalidate`].

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{Credential, SessionEpoch, SessionStatus, SyncError};
use crate::ports::{CredentialStore, SessionObserver};

struct SessionState {
    credential: Option<Credential>,
    epoch: SessionEpoch,
}

/// Owns the credential and broadcasts session transitions.
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    state: RwLock<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    observers: Mutex<Vec<Weak<dyn SessionObserver>>>,
}

impl SessionManager {
    /// Unauthenticated manager backed by `store`.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let epoch = SessionEpoch::default();
        let (status_tx, _) = watch::channel(SessionStatus::Unauthenticated(epoch));
        Self {
            store,
            state: RwLock::new(SessionState {
                credential: None,
                epoch,
            }),
            status_tx,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a synchronous dependent. Held weakly; dropped observers are pruned.
    pub fn add_observer(&self, observer: &Arc<dyn SessionObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    /// Adopt a still-valid credential from the durable slot.
    ///
    /// Expired or unreadable slots are cleared. Returns the new epoch when a
    /// session was restored.
    pub fn restore(&self) -> Option<SessionEpoch> {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable credential slot");
                self.clear_slot();
                return None;
            }
        };

        match stored {
            Some(credential) if credential.is_valid() => {
                let epoch = self.adopt(credential);
                info!(epoch = %epoch, "Session restored");
                Some(epoch)
            }
            Some(_) => {
                info!("Stored credential expired");
                self.clear_slot();
                None
            }
            None => None,
        }
    }

    /// Persist `credential` and make it current.
    ///
    /// Replacing a different credential ends the previous session first.
    /// Setting the credential already held is a no-op.
    pub fn set_credential(&self, credential: Credential) -> Result<SessionEpoch, SyncError> {
        {
            let state = self.state.read();
            if state.credential.as_ref() == Some(&credential) {
                return Ok(state.epoch);
            }
        }

        self.store.save(&credential)?;

        if self.is_authenticated() {
            debug!("Replacing credential; ending previous session");
            self.end_session(false);
        }

        let epoch = self.adopt(credential);
        info!(epoch = %epoch, "Session started");
        Ok(epoch)
    }

    /// Current credential, `None` when absent or expired.
    pub fn get_credential(&self) -> Option<Credential> {
        self.state
            .read()
            .credential
            .as_ref()
            .filter(|c| c.is_valid())
            .cloned()
    }

    /// Clear the credential and its durable slot, then tear down dependents.
    ///
    /// Observers have run by the time this returns. Returns `false` when there
    /// was no session to end.
    pub fn invalidate(&self) -> bool {
        self.end_session(true)
    }

    /// Current epoch.
    pub fn epoch(&self) -> SessionEpoch {
        self.state.read().epoch
    }

    /// Whether work issued under `epoch` may still write.
    pub fn is_current(&self, epoch: SessionEpoch) -> bool {
        self.state.read().epoch == epoch
    }

    /// Whether a credential is held (expired or not).
    pub fn is_authenticated(&self) -> bool {
        self.state.read().credential.is_some()
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Status updates for async dependents.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    fn adopt(&self, credential: Credential) -> SessionEpoch {
        let epoch = {
            let mut state = self.state.write();
            state.epoch = state.epoch.next();
            state.credential = Some(credential);
            state.epoch
        };

        for observer in self.live_observers() {
            observer.on_authenticated(epoch);
        }
        self.status_tx.send_replace(SessionStatus::Authenticated(epoch));
        epoch
    }

    fn end_session(&self, clear_slot: bool) -> bool {
        let epoch = {
            let mut state = self.state.write();
            if state.credential.take().is_none() {
                return false;
            }
            state.epoch = state.epoch.next();
            state.epoch
        };

        if clear_slot {
            self.clear_slot();
        }

        for observer in self.live_observers() {
            observer.on_invalidated(epoch);
        }
        self.status_tx.send_replace(SessionStatus::Unauthenticated(epoch));

        info!(epoch = %epoch, "Session invalidated");
        true
    }

    fn clear_slot(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear credential slot");
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut observers = self.observers.lock();
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }
}
