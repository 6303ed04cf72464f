//! # Sync Engine
//!
//! Client-side synchronization core for a messaging app: keeps a local cache
//! of server collections consistent with the backend through authenticated
//! HTTP refreshes and a realtime push channel.
//!
//! **Architecture:** Hexagonal (Ports/Adapters)
//!
//! ## Guarantees
//!
//! | Concern | Behavior |
//! |---------|----------|
//! | Session epochs | Work started under an ended session never writes to the store |
//! | Retries | Transient failures retry with backoff; 401 ends the session once |
//! | Change notification | Subscribers see only distinct values, in write order |
//! | Optimistic sends | Provisional records are confirmed or rolled back, one per slot |
//! | Push channel | One connection per session, reconnect with backoff, teardown on logout |
//!
//! ## Module Structure
//!
//! ```text
//! sync-engine/
//! ├── domain/          # Records, events, credentials, retry policy, errors
//! ├── ports/           # Observer callbacks (inbound) + transport traits (outbound)
//! ├── adapters/        # reqwest, tokio-tungstenite, credential files
//! ├── application/     # Session, gateway, channel, store, mutations, SyncEngine
//! └── config.rs        # EngineConfig
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports
pub use adapters::{FileCredentialStore, MemoryCredentialStore, ReqwestTransport, WsConnector};
pub use application::{
    Collection, ListKind, MutationCoordinator, MutationRequest, RealtimeChannel, RequestGateway,
    SessionManager, StoreSubscription, SubscriberHandle, SyncEngine, SyncStore,
};
pub use config::{BindingAction, ChannelConfig, ConfigError, EngineConfig, EventBinding, RetryConfig, Routes};
pub use domain::{
    decode_records, Backoff, ChannelEvent, ChannelState, Credential, MutationReceipt,
    MutationStatus, PendingMutation, Record, RetryPolicy, SessionEpoch, SessionStatus, SyncError,
    SyncResult, TempId, TEMP_ID_PREFIX, WILDCARD_EVENT,
};
pub use ports::{
    ChannelConnector, ChannelStream, CredentialStore, EventHandler, HttpMethod, HttpRequest,
    HttpResponse, HttpTransport, SessionObserver,
    MockConnectionHandle, MockConnector, MockReply, MockTransport,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
