//! Realtime channel envelopes and connection state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::errors::SyncError;

/// Subscription key that receives every event type.
pub const WILDCARD_EVENT: &str = "*";

/// A parsed inbound push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Discriminator, e.g. `message.created`.
    pub event_type: String,
    /// Opaque payload (`null` when the envelope had none).
    pub payload: Value,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

impl ChannelEvent {
    /// Build an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Parse a text frame.
    ///
    /// The envelope is a JSON object with `type` (or `event`) naming the event
    /// and `payload` (or `data`) carrying the body.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::ChannelError(format!("malformed frame: {}", e)))?;

        let Value::Object(mut envelope) = value else {
            return Err(SyncError::ChannelError(
                "malformed frame: envelope is not an object".to_string(),
            ));
        };

        let event_type = match envelope.remove("type").or_else(|| envelope.remove("event")) {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            Some(_) => {
                return Err(SyncError::ChannelError(
                    "malformed frame: event type is not a string".to_string(),
                ))
            }
            None => {
                return Err(SyncError::ChannelError(
                    "malformed frame: missing event type".to_string(),
                ))
            }
        };

        let payload = envelope
            .remove("payload")
            .or_else(|| envelope.remove("data"))
            .unwrap_or(Value::Null);

        Ok(Self::new(event_type, payload))
    }
}

/// Lifecycle of the push connection.
///
/// ```text
/// Closed ──open()──▶ Connecting ──▶ Open
///                       ▲            │ network loss
///                       └─backoff── Disconnected
/// any ──teardown()──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Lost while authenticated; a reconnect is scheduled.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and dispatching.
    Open,
    /// Torn down (or never opened). Only `open()` leaves this state.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}
