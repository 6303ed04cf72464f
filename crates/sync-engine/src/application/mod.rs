//! # Application Module
//!
//! Services coordinating the domain with the outbound ports.

pub mod channel;
pub mod engine;
pub mod gateway;
pub mod mutation;
pub mod session;
pub mod store;

pub use channel::{ChannelStats, RealtimeChannel, SubscriberHandle};
pub use engine::SyncEngine;
pub use gateway::{Fetched, GatewayStats, RequestGateway};
pub use mutation::{MutationCoordinator, MutationRequest};
pub use session::SessionManager;
pub use store::{Collection, ListKind, StoreSubscription, SyncStore};
