//! # Synchronized Data Store
//!
//! Authoritative local cache of each entity collection. Values are handed out
//! as shared immutable `Arc<T>`; the setters are the only mutation path and
//! skip structurally equal writes entirely (no notification, no new `Arc`).
//!
//! Every collection remembers the session epoch it belongs to. Writes tagged
//! with an older epoch (`set_at`, `update_at`) are dropped, which keeps late
//! responses from repopulating a store cleared at logout.
//!
//! A collection also carries a scope counter, bumped by
//! [`Collection::rescope`] when the collection is repointed at different
//! data (the messages collection on a conversation switch). Scoped writes
//! issued before the bump are dropped the same way.

use parking_lot::{ReentrantMutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::domain::{Record, SessionEpoch};
use crate::ports::SessionObserver;

type Callback<T> = Arc<dyn Fn(&Arc<T>) + Send + Sync>;
type Subscribers<T> = RwLock<BTreeMap<u64, Callback<T>>>;

struct Slot<T> {
    value: Arc<T>,
    version: u64,
    epoch: SessionEpoch,
    scope: u64,
}

#[derive(Clone, Copy, Default)]
struct WriteGuard {
    epoch: Option<SessionEpoch>,
    scope: Option<u64>,
}

impl WriteGuard {
    fn at(epoch: SessionEpoch) -> Self {
        Self {
            epoch: Some(epoch),
            scope: None,
        }
    }
}

/// One change-deduplicated collection.
pub struct Collection<T> {
    name: &'static str,
    slot: RwLock<Slot<T>>,
    subscribers: Arc<Subscribers<T>>,
    next_subscriber: AtomicU64,
    // Serializes write+notify so subscribers see changes in write order.
    // Re-entrant: a subscriber may write to the collection it observes.
    write_order: ReentrantMutex<()>,
}

impl<T> Collection<T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    /// Empty collection.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: RwLock::new(Slot {
                value: Arc::new(T::default()),
                version: 0,
                epoch: SessionEpoch::default(),
                scope: 0,
            }),
            subscribers: Arc::new(RwLock::new(BTreeMap::new())),
            next_subscriber: AtomicU64::new(0),
            write_order: ReentrantMutex::new(()),
        }
    }

    /// Collection name (for logs).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.slot.read().value)
    }

    /// Number of observable changes so far.
    pub fn version(&self) -> u64 {
        self.slot.read().version
    }

    /// Session epoch the contents belong to.
    pub fn epoch(&self) -> SessionEpoch {
        self.slot.read().epoch
    }

    /// Current scope. Changes only through [`rescope`](Self::rescope).
    pub fn scope(&self) -> u64 {
        self.slot.read().scope
    }

    /// Replace the value. Returns whether anything changed.
    pub fn set(&self, value: T) -> bool {
        self.write(WriteGuard::default(), |_| Some(value))
    }

    /// Replace the value if the collection still belongs to `epoch`.
    pub fn set_at(&self, epoch: SessionEpoch, value: T) -> bool {
        self.write(WriteGuard::at(epoch), |_| Some(value))
    }

    /// Read-modify-write against the value current at call time.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        self.write(WriteGuard::default(), |current| Some(f(current)))
    }

    /// [`update`](Self::update) guarded by `epoch`.
    pub fn update_at<F>(&self, epoch: SessionEpoch, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        self.write(WriteGuard::at(epoch), |current| Some(f(current)))
    }

    /// [`update_at`](Self::update_at) that is also dropped once the
    /// collection has been rescoped past `scope`.
    pub fn update_scoped<F>(&self, epoch: SessionEpoch, scope: u64, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let guard = WriteGuard {
            epoch: Some(epoch),
            scope: Some(scope),
        };
        self.write(guard, |current| Some(f(current)))
    }

    /// Empty the collection and start a new scope. Writes still tagged with
    /// the previous scope are dropped from here on. Subscribers are notified
    /// only when contents changed. Returns the new scope.
    pub fn rescope(&self) -> u64 {
        let _order = self.write_order.lock();
        let (scope, changed) = {
            let mut slot = self.slot.write();
            slot.scope += 1;
            let changed = *slot.value != T::default();
            if changed {
                slot.value = Arc::new(T::default());
                slot.version += 1;
            }
            (slot.scope, changed.then(|| Arc::clone(&slot.value)))
        };
        debug!(collection = self.name, scope, "Collection rescoped");
        if let Some(value) = changed {
            self.notify(&value);
        }
        scope
    }

    /// Reset to the initial value under `epoch` and notify unconditionally.
    pub fn clear(&self, epoch: SessionEpoch) {
        let _order = self.write_order.lock();
        let value = {
            let mut slot = self.slot.write();
            slot.value = Arc::new(T::default());
            slot.version += 1;
            slot.epoch = epoch;
            Arc::clone(&slot.value)
        };
        debug!(collection = self.name, epoch = %epoch, "Collection cleared");
        self.notify(&value);
    }

    /// Move to `epoch` without touching contents that are already empty.
    pub fn adopt_epoch(&self, epoch: SessionEpoch) {
        let stale = {
            let _order = self.write_order.lock();
            let mut slot = self.slot.write();
            slot.epoch = epoch;
            *slot.value != T::default()
        };
        if stale {
            self.clear(epoch);
        }
    }

    /// Register a change callback. Dropping the handle unregisters it.
    pub fn subscribe<F>(&self, callback: F) -> StoreSubscription
    where
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, Arc::new(callback));

        let weak: Weak<Subscribers<T>> = Arc::downgrade(&self.subscribers);
        StoreSubscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(subscribers) = weak.upgrade() {
                    subscribers.write().remove(&id);
                }
            })),
        }
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn write<F>(&self, guard: WriteGuard, next: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let _order = self.write_order.lock();
        let value = {
            let mut slot = self.slot.write();

            if let Some(epoch) = guard.epoch {
                if slot.epoch != epoch {
                    debug!(
                        collection = self.name,
                        write_epoch = %epoch,
                        current_epoch = %slot.epoch,
                        "Dropping stale write"
                    );
                    return false;
                }
            }
            if let Some(scope) = guard.scope {
                if slot.scope != scope {
                    debug!(
                        collection = self.name,
                        write_scope = scope,
                        current_scope = slot.scope,
                        "Dropping out-of-scope write"
                    );
                    return false;
                }
            }

            let Some(candidate) = next(&*slot.value) else {
                return false;
            };
            if candidate == *slot.value {
                return false;
            }

            slot.value = Arc::new(candidate);
            slot.version += 1;
            Arc::clone(&slot.value)
        };

        self.notify(&value);
        true
    }

    fn notify(&self, value: &Arc<T>) {
        let callbacks: Vec<Callback<T>> = self.subscribers.read().values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }
}

/// Unregisters a store callback on drop.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct StoreSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Record-list collections addressable by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Client roster
    Clients,
    /// Active conversation transcript
    Messages,
    /// Scheduled messages
    Scheduled,
    /// Nudge/campaign briefings
    Nudges,
}

/// The engine's entity cache.
pub struct SyncStore {
    /// Session user
    pub user: Collection<Option<Record>>,
    /// Client roster
    pub clients: Collection<Vec<Record>>,
    /// Active conversation transcript
    pub messages: Collection<Vec<Record>>,
    /// Scheduled messages
    pub scheduled: Collection<Vec<Record>>,
    /// Nudge/campaign briefings
    pub nudges: Collection<Vec<Record>>,
}

impl Default for SyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            user: Collection::new("user"),
            clients: Collection::new("clients"),
            messages: Collection::new("messages"),
            scheduled: Collection::new("scheduled"),
            nudges: Collection::new("nudges"),
        }
    }

    /// List collection by kind.
    pub fn list(&self, kind: ListKind) -> &Collection<Vec<Record>> {
        match kind {
            ListKind::Clients => &self.clients,
            ListKind::Messages => &self.messages,
            ListKind::Scheduled => &self.scheduled,
            ListKind::Nudges => &self.nudges,
        }
    }

    /// Reset every collection for `epoch`, notifying all subscribers.
    pub fn clear_all(&self, epoch: SessionEpoch) {
        self.user.clear(epoch);
        self.clients.clear(epoch);
        self.messages.clear(epoch);
        self.scheduled.clear(epoch);
        self.nudges.clear(epoch);
    }

    fn adopt_epoch(&self, epoch: SessionEpoch) {
        self.user.adopt_epoch(epoch);
        self.clients.adopt_epoch(epoch);
        self.messages.adopt_epoch(epoch);
        self.scheduled.adopt_epoch(epoch);
        self.nudges.adopt_epoch(epoch);
    }
}

impl SessionObserver for SyncStore {
    fn on_authenticated(&self, epoch: SessionEpoch) {
        self.adopt_epoch(epoch);
    }

    fn on_invalidated(&self, epoch: SessionEpoch) {
        self.clear_all(epoch);
    }
}
