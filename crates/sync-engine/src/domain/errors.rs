//! # Domain Errors
//!
//! One classified taxonomy for everything the engine surfaces to callers.
//! Raw transport/socket errors are absorbed by the gateway and the channel and
//! re-emitted as one of these variants.

use thiserror::Error;

/// Classified sync failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The server rejected the credential (401). Terminal for the call; the
    /// session has already been invalidated when this is returned.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// 4xx other than 401. The caller's fault, never retried.
    #[error("Client error {status}: {message}")]
    ClientError {
        /// HTTP status code
        status: u16,
        /// Server-provided message, if any
        message: String,
    },

    /// 5xx after retries were exhausted.
    #[error("Server error {status}: {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Server-provided message, if any
        message: String,
    },

    /// Network-level failure after retries were exhausted.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Realtime channel fault. Logged and recovered from, never a hard failure.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// A 2xx response whose body could not be decoded.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Another mutation already holds this slot.
    #[error("Mutation already in flight for slot {0}")]
    MutationInFlight(String),

    /// A conversation-scoped operation was attempted with no active conversation.
    #[error("No active conversation")]
    NoActiveConversation,

    /// The session changed while the request was in flight; its result was discarded.
    #[error("Request cancelled: session changed while in flight")]
    Cancelled,

    /// Durable credential storage failed.
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Classify a non-2xx HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => SyncError::Unauthenticated(message),
            400..=499 => SyncError::ClientError { status, message },
            500..=599 => SyncError::ServerError { status, message },
            _ => SyncError::InvalidResponse(format!("unexpected status {}: {}", status, message)),
        }
    }

    /// Transient failures worth another attempt (5xx and transport errors).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ServerError { .. } | SyncError::TransportError(_)
        )
    }

    /// Failures that end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Unauthenticated(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Unauthenticated(_) => Some(401),
            SyncError::ClientError { status, .. } | SyncError::ServerError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Result alias used across the engine.
pub type SyncResult<T> = Result<T, SyncError>;
