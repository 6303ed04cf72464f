//! # Inbound Ports
//!
//! Callbacks the engine invokes on its dependents.

use crate::domain::{ChannelEvent, SessionEpoch};
use std::sync::Arc;

/// Synchronous dependent of the session.
///
/// Observers run on the thread that changed the session, before
/// `set_credential` or `invalidate` return. They must not block.
pub trait SessionObserver: Send + Sync {
    /// A credential was adopted under `epoch`.
    fn on_authenticated(&self, _epoch: SessionEpoch) {}

    /// The session ended; `epoch` is the new, unauthenticated epoch.
    fn on_invalidated(&self, epoch: SessionEpoch);
}

/// Realtime event handler. Invoked on the channel task; must not block.
pub type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;
