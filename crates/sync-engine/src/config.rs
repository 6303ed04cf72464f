//! # Engine Configuration
//!
//! Endpoints, retry/reconnect tuning, resource routes and realtime event
//! bindings. Every section has serde defaults, so a partial config file (or
//! none at all) is valid.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{Backoff, RetryPolicy, SyncError};

/// Conversation placeholder in the messages route.
pub const CONVERSATION_PLACEHOLDER: &str = "{conversation}";

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the REST service
    pub api_base_url: String,
    /// WebSocket endpoint of the push channel
    pub ws_url: String,
    /// Durable credential slot (`None` keeps the credential in memory only)
    pub credential_path: Option<PathBuf>,
    /// Per-attempt request timeout
    pub request_timeout_ms: u64,
    /// Periodic re-fetch interval (0 disables the poller)
    pub poll_interval_secs: u64,
    /// Gateway retry policy
    pub retry: RetryConfig,
    /// Push channel tuning
    pub channel: ChannelConfig,
    /// Resource paths
    pub routes: Routes,
    /// Event type to refresh action bindings
    pub bindings: Vec<EventBinding>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api/".to_string(),
            ws_url: "ws://127.0.0.1:8080/ws".to_string(),
            credential_path: None,
            request_timeout_ms: 10_000,
            poll_interval_secs: 60,
            retry: RetryConfig::default(),
            channel: ChannelConfig::default(),
            routes: Routes::default(),
            bindings: EventBinding::defaults(),
        }
    }
}

impl EngineConfig {
    /// Create a config for testing (short delays, no poller).
    pub fn for_testing() -> Self {
        Self {
            api_base_url: "http://localhost/api/".to_string(),
            ws_url: "ws://localhost/ws".to_string(),
            credential_path: None,
            request_timeout_ms: 1_000,
            poll_interval_secs: 0,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
                exponential: true,
            },
            channel: ChannelConfig {
                reconnect_base_ms: 10,
                reconnect_max_ms: 100,
                max_reconnect_attempts: None,
                token_param: "token".to_string(),
            },
            routes: Routes::default(),
            bindings: EventBinding::defaults(),
        }
    }

    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SYNC_API_URL`: REST base URL
    /// - `SYNC_WS_URL`: push channel URL
    /// - `SYNC_CREDENTIAL_PATH`: durable credential file
    /// - `SYNC_POLL_INTERVAL_SECS`: poller interval (0 disables)
    /// - `SYNC_REQUEST_TIMEOUT_MS`: per-attempt timeout
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = env::var("SYNC_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = env::var("SYNC_WS_URL") {
            config.ws_url = url;
        }
        if let Ok(path) = env::var("SYNC_CREDENTIAL_PATH") {
            config.credential_path = Some(PathBuf::from(path));
        }
        if let Ok(secs) = env::var("SYNC_POLL_INTERVAL_SECS") {
            config.poll_interval_secs = parse_number("SYNC_POLL_INTERVAL_SECS", &secs)?;
        }
        if let Ok(ms) = env::var("SYNC_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse_number("SYNC_REQUEST_TIMEOUT_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(format!(
                "api_base_url must be http(s): {}",
                self.api_base_url
            )));
        }

        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(format!(
                "ws_url must be ws(s): {}",
                self.ws_url
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "request_timeout_ms cannot be 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry("max_attempts cannot be 0".into()));
        }

        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::InvalidRetry(
                "delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }

        if self.channel.reconnect_base_ms == 0
            || self.channel.reconnect_max_ms < self.channel.reconnect_base_ms
        {
            return Err(ConfigError::InvalidRetry(
                "reconnect delays must satisfy 0 < reconnect_base_ms <= reconnect_max_ms".into(),
            ));
        }

        if self.channel.token_param.is_empty() {
            return Err(ConfigError::Invalid("channel.token_param cannot be empty".into()));
        }

        if !self.routes.messages.contains(CONVERSATION_PLACEHOLDER) {
            return Err(ConfigError::InvalidRoute(format!(
                "messages route must contain {}",
                CONVERSATION_PLACEHOLDER
            )));
        }

        if let Some(binding) = self.bindings.iter().find(|b| b.event_type.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "binding for {:?} has an empty event type",
                binding.action
            )));
        }

        Ok(())
    }

    /// Per-attempt request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Poller interval, `None` when disabled
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}

/// Gateway retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// First retry delay
    pub base_delay_ms: u64,
    /// Delay cap
    pub max_delay_ms: u64,
    /// Exponential (doubling) instead of linear growth
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            exponential: true,
        }
    }
}

impl RetryConfig {
    /// Convert to the runtime policy
    pub fn to_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        let backoff = if self.exponential {
            Backoff::Exponential { base, max }
        } else {
            Backoff::Linear { step: base, max }
        };
        RetryPolicy::new(self.max_attempts, backoff)
    }
}

/// Push channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// First reconnect delay
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap
    pub reconnect_max_ms: u64,
    /// Consecutive failed connects before giving up (`None` retries while authenticated)
    pub max_reconnect_attempts: Option<u32>,
    /// Query parameter carrying the credential
    pub token_param: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: None,
            token_param: "token".to_string(),
        }
    }
}

impl ChannelConfig {
    /// Reconnect backoff schedule
    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::Exponential {
            base: Duration::from_millis(self.reconnect_base_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

/// Resource paths, relative to `api_base_url`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Routes {
    /// Session user
    pub user: String,
    /// Client roster
    pub clients: String,
    /// Conversation transcript; must contain `{conversation}`
    pub messages: String,
    /// Scheduled messages
    pub scheduled: String,
    /// Nudge/campaign briefings
    pub nudges: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            user: "me".to_string(),
            clients: "clients".to_string(),
            messages: format!("conversations/{}/messages", CONVERSATION_PLACEHOLDER),
            scheduled: "scheduled-messages".to_string(),
            nudges: "nudges".to_string(),
        }
    }
}

impl Routes {
    /// Messages route for one conversation
    pub fn messages_for(&self, conversation_id: &str) -> String {
        self.messages.replace(CONVERSATION_PLACEHOLDER, conversation_id)
    }
}

/// What an inbound event triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingAction {
    /// Re-fetch the session user
    RefreshUser,
    /// Re-fetch the client roster
    RefreshClients,
    /// Re-fetch the active conversation
    RefreshMessages,
    /// Re-fetch scheduled messages
    RefreshScheduled,
    /// Re-fetch nudges
    RefreshNudges,
    /// End the session
    Invalidate,
}

/// One event type to action binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBinding {
    /// Event discriminator (or `*`)
    pub event_type: String,
    /// Triggered action
    pub action: BindingAction,
}

impl EventBinding {
    /// Build a binding
    pub fn new(event_type: &str, action: BindingAction) -> Self {
        Self {
            event_type: event_type.to_string(),
            action,
        }
    }

    /// Default bindings
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("message.created", BindingAction::RefreshMessages),
            Self::new("message.updated", BindingAction::RefreshMessages),
            Self::new("scheduled.updated", BindingAction::RefreshScheduled),
            Self::new("nudge.updated", BindingAction::RefreshNudges),
            Self::new("client.updated", BindingAction::RefreshClients),
            Self::new("user.updated", BindingAction::RefreshUser),
            Self::new("session.revoked", BindingAction::Invalidate),
        ]
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Malformed endpoint URL
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid retry/reconnect schedule
    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
    /// Invalid resource route
    #[error("invalid route: {0}")]
    InvalidRoute(String),
    /// Unparseable environment variable
    #[error("invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}
