//! # Request Gateway
//!
//! Request/response calls with the session credential attached, bounded
//! retries for transient failures and uniform error classification.
//!
//! ```text
//! execute ──▶ attempt ──▶ 2xx ──────────────▶ Ok(decoded body)
//!               │  ▲
//!               │  └── 5xx / transport, attempts left: sleep(backoff)
//!               ├──▶ 401 ──▶ invalidate() ──▶ Err(Unauthenticated)
//!               └──▶ other 4xx ─────────────▶ Err(ClientError)
//! ```
//!
//! Each call captures the session epoch at issue time. If the session changed
//! by the time a response (or a backoff sleep) completes, the result is
//! discarded and the call fails with `Cancelled`.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::session::SessionManager;
use crate::domain::{RetryPolicy, SessionEpoch, SyncError};
use crate::ports::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

/// Gateway counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Calls issued
    pub total_requests: AtomicU64,
    /// Attempts, retries included
    pub total_attempts: AtomicU64,
    /// Attempts beyond the first
    pub total_retries: AtomicU64,
    /// Calls that ended in an error (cancellations included)
    pub total_failures: AtomicU64,
}

/// A decoded response tagged with the epoch it was issued under.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    /// Session epoch at issue time
    pub epoch: SessionEpoch,
    /// Decoded body
    pub value: T,
}

/// Retrying, session-aware request executor.
pub struct RequestGateway {
    transport: Arc<dyn HttpTransport>,
    session: Arc<SessionManager>,
    policy: RetryPolicy,
    stats: GatewayStats,
}

impl RequestGateway {
    /// Gateway over `transport`, authenticated by `session`.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        session: Arc<SessionManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            session,
            policy,
            stats: GatewayStats::default(),
        }
    }

    /// Run one call and return the decoded JSON body (`null` when empty).
    pub async fn execute(
        &self,
        route: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> Result<Value, SyncError> {
        self.send(route, method, body).await.map(|fetched| fetched.value)
    }

    /// Like [`execute`](Self::execute), decoding into `T`.
    pub async fn execute_as<T: DeserializeOwned>(
        &self,
        route: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> Result<T, SyncError> {
        let value = self.execute(route, method, body).await?;
        serde_json::from_value(value)
            .map_err(|e| SyncError::InvalidResponse(format!("{} {}: {}", method, route, e)))
    }

    /// GET `route`.
    pub async fn get(&self, route: &str) -> Result<Value, SyncError> {
        self.execute(route, HttpMethod::Get, None).await
    }

    /// POST `body` to `route`.
    pub async fn post(&self, route: &str, body: Value) -> Result<Value, SyncError> {
        self.execute(route, HttpMethod::Post, Some(body)).await
    }

    /// PUT `body` to `route`.
    pub async fn put(&self, route: &str, body: Value) -> Result<Value, SyncError> {
        self.execute(route, HttpMethod::Put, Some(body)).await
    }

    /// DELETE `route`.
    pub async fn delete(&self, route: &str) -> Result<Value, SyncError> {
        self.execute(route, HttpMethod::Delete, None).await
    }

    /// Run one call, keeping the issuing epoch for epoch-guarded writes.
    pub async fn send(
        &self,
        route: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> Result<Fetched<Value>, SyncError> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = self.run(route, method, body).await.and_then(|raw| {
            decode_body(&raw.value).map(|value| Fetched {
                epoch: raw.epoch,
                value,
            })
        });
        self.finish(route, method, result)
    }

    /// Run a state-changing call whose acceptance is the status alone.
    ///
    /// Any 2xx is success. A body that is not JSON is logged and read as
    /// `null`, so the caller still learns the server applied the change.
    pub async fn commit(
        &self,
        route: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> Result<Fetched<Value>, SyncError> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = self.run(route, method, body).await.map(|raw| {
            let value = decode_body(&raw.value).unwrap_or_else(|e| {
                warn!(route, %method, error = %e, "Accepted response has an undecodable body");
                Value::Null
            });
            Fetched {
                epoch: raw.epoch,
                value,
            }
        });
        self.finish(route, method, result)
    }

    /// Gateway counters.
    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn finish<T>(
        &self,
        route: &str,
        method: HttpMethod,
        result: Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        if let Err(e) = &result {
            self.stats.total_failures.fetch_add(1, Ordering::Relaxed);
            debug!(route, %method, error = %e, "Request failed");
        }
        result
    }

    async fn run(
        &self,
        route: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> Result<Fetched<Vec<u8>>, SyncError> {
        let epoch = self.session.epoch();
        let mut status_rx = self.session.subscribe();
        let mut attempt = 1u32;

        loop {
            let request = HttpRequest {
                method,
                path: route.to_string(),
                body: body.clone(),
                bearer: self.session.get_credential(),
            };

            self.stats.total_attempts.fetch_add(1, Ordering::Relaxed);
            let outcome = match self.transport.send(&request).await {
                Ok(response) => classify(response),
                Err(e) => Err(e),
            };

            // A response for an ended session must not touch the new one,
            // a stale 401 included.
            if !self.session.is_current(epoch) {
                debug!(route, epoch = %epoch, "Discarding response from previous session");
                return Err(SyncError::Cancelled);
            }

            let error = match outcome {
                Ok(value) => return Ok(Fetched { epoch, value }),
                Err(e) => e,
            };

            if error.is_terminal() {
                warn!(route, %method, "Credential rejected; invalidating session");
                self.session.invalidate();
                return Err(error);
            }

            if !self.policy.should_retry(attempt, &error) {
                return Err(error);
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                route,
                %method,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure; retrying"
            );

            // Wake early on any session change so teardown is not held up.
            status_rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = status_rx.changed() => {}
            }

            if !self.session.is_current(epoch) {
                debug!(route, epoch = %epoch, "Session ended during backoff");
                return Err(SyncError::Cancelled);
            }

            attempt += 1;
            self.stats.total_retries.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn classify(response: HttpResponse) -> Result<Vec<u8>, SyncError> {
    match response.status {
        200..=299 => Ok(response.body),
        status => Err(SyncError::from_status(status, error_message(&response.body))),
    }
}

fn decode_body(body: &[u8]) -> Result<Value, SyncError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| SyncError::InvalidResponse(e.to_string()))
}

/// Best-effort message from an error body.
fn error_message(body: &[u8]) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(Value::String(message)) = map.get(key) {
                return message.clone();
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(200) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
