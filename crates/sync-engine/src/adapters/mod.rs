//! # Adapters
//!
//! Concrete implementations of the outbound ports.

pub mod credential_store;
pub mod http;
pub mod websocket;

pub use credential_store::{FileCredentialStore, MemoryCredentialStore};
pub use http::ReqwestTransport;
pub use websocket::WsConnector;
