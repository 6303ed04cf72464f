//! # Outbound Ports
//!
//! Traits for the engine's external dependencies: the HTTP service, the push
//! socket and the durable credential slot.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

use crate::domain::{Credential, SyncError};

/// HTTP verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// One request against the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Verb.
    pub method: HttpMethod,
    /// Resource path relative to the base URL.
    pub path: String,
    /// JSON body.
    pub body: Option<Value>,
    /// Credential sent as `Authorization: Bearer`.
    pub bearer: Option<Credential>,
}

/// Raw response; classification happens in the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Undecoded body.
    pub body: Vec<u8>,
}

/// Request/response transport - outbound port.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform one attempt. Network failures are `SyncError::TransportError`;
    /// any status code, error statuses included, is `Ok`.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError>;
}

/// Durable single-slot credential storage - outbound port.
pub trait CredentialStore: Send + Sync {
    /// Read the slot.
    fn load(&self) -> Result<Option<Credential>, SyncError>;

    /// Overwrite the slot.
    fn save(&self, credential: &Credential) -> Result<(), SyncError>;

    /// Empty the slot. Clearing an empty slot succeeds.
    fn clear(&self) -> Result<(), SyncError>;
}

/// Push socket factory - outbound port.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open one connection authenticated with `credential`.
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn ChannelStream>, SyncError>;
}

/// One live push connection.
#[async_trait]
pub trait ChannelStream: Send {
    /// Next text frame. `None` once the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<String, SyncError>>;

    /// Close from our side.
    async fn close(&mut self);
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

/// Scripted reply of [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Status plus JSON body.
    Json(u16, Value),
    /// Status plus raw body text.
    Raw(u16, String),
    /// Network failure.
    Fail(String),
    /// Wait, then play the inner reply.
    Delayed(Duration, Box<MockReply>),
    /// Wait for the notify, then play the inner reply.
    Gated(Arc<Notify>, Box<MockReply>),
}

impl MockReply {
    /// 200 with a JSON body.
    pub fn ok(body: Value) -> Self {
        MockReply::Json(200, body)
    }

    /// Status with an empty body.
    pub fn status(status: u16) -> Self {
        MockReply::Raw(status, String::new())
    }

    /// Hold the reply until `gate` is notified.
    pub fn gated(gate: &Arc<Notify>, reply: MockReply) -> Self {
        MockReply::Gated(Arc::clone(gate), Box::new(reply))
    }
}

/// A request seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// The request as sent.
    pub request: HttpRequest,
    /// Send time on the tokio clock (virtual under paused time).
    pub at: tokio::time::Instant,
}

/// In-memory transport with per-route scripted replies.
///
/// One-shot replies are consumed in order; once exhausted, the route's sticky
/// reply (if any) answers. Unknown routes get 404.
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<HashMap<(HttpMethod, String), VecDeque<MockReply>>>,
    sticky: Mutex<HashMap<(HttpMethod, String), MockReply>>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply.
    pub fn enqueue(&self, method: HttpMethod, path: &str, reply: MockReply) -> &Self {
        self.scripted
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used whenever no one-shot reply is queued.
    pub fn always(&self, method: HttpMethod, path: &str, reply: MockReply) -> &Self {
        self.sticky.lock().insert((method, path.to_string()), reply);
        self
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    /// Requests seen for one route.
    pub fn requests_to(&self, method: HttpMethod, path: &str) -> Vec<RecordedRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.request.method == method && r.request.path == path)
            .cloned()
            .collect()
    }

    /// Number of requests seen for one route.
    pub fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.requests_to(method, path).len()
    }

    fn next_reply(&self, method: HttpMethod, path: &str) -> MockReply {
        let key = (method, path.to_string());
        if let Some(reply) = self.scripted.lock().get_mut(&key).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.sticky
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| MockReply::Raw(404, format!("no mock route for {} {}", method, path)))
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
        self.log.lock().push(RecordedRequest {
            request: request.clone(),
            at: tokio::time::Instant::now(),
        });

        let mut reply = self.next_reply(request.method, &request.path);
        loop {
            match reply {
                MockReply::Delayed(delay, next) => {
                    tokio::time::sleep(delay).await;
                    reply = *next;
                }
                MockReply::Gated(gate, next) => {
                    gate.notified().await;
                    reply = *next;
                }
                MockReply::Json(status, body) => {
                    return Ok(HttpResponse {
                        status,
                        body: serde_json::to_vec(&body).unwrap_or_default(),
                    })
                }
                MockReply::Raw(status, body) => {
                    return Ok(HttpResponse {
                        status,
                        body: body.into_bytes(),
                    })
                }
                MockReply::Fail(message) => return Err(SyncError::TransportError(message)),
            }
        }
    }
}

enum MockFrame {
    Text(String),
    Error(String),
    End,
}

/// Test-side handle to one mock connection.
#[derive(Clone)]
pub struct MockConnectionHandle {
    frames: mpsc::UnboundedSender<MockFrame>,
    closed: Arc<AtomicBool>,
    token: String,
}

impl MockConnectionHandle {
    /// Deliver a raw text frame. False once the stream is gone.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.frames.send(MockFrame::Text(text.into())).is_ok()
    }

    /// Deliver a `{"type", "payload"}` envelope.
    pub fn push_event(&self, event_type: &str, payload: Value) -> bool {
        let frame = serde_json::json!({ "type": event_type, "payload": payload });
        self.push_text(frame.to_string())
    }

    /// Surface a socket error.
    pub fn fail(&self, message: &str) -> bool {
        self.frames.send(MockFrame::Error(message.to_string())).is_ok()
    }

    /// Server-side close.
    pub fn end(&self) -> bool {
        self.frames.send(MockFrame::End).is_ok()
    }

    /// Closed from the client side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token the connection was opened with.
    pub fn token(&self) -> &str {
        &self.token
    }
}

struct MockStream {
    frames: mpsc::UnboundedReceiver<MockFrame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ChannelStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<String, SyncError>> {
        match self.frames.recv().await {
            Some(MockFrame::Text(text)) => Some(Ok(text)),
            Some(MockFrame::Error(message)) => Some(Err(SyncError::ChannelError(message))),
            Some(MockFrame::End) | None => None,
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.frames.close();
    }
}

/// In-memory connector; every accepted connection is exposed as a handle.
pub struct MockConnector {
    connections: Mutex<Vec<MockConnectionHandle>>,
    refuse_next: Mutex<usize>,
    attempts: watch::Sender<usize>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            refuse_next: Mutex::new(0),
            attempts: watch::channel(0).0,
        }
    }
}

impl MockConnector {
    /// Connector accepting every attempt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` attempts.
    pub fn refuse_next(&self, count: usize) {
        *self.refuse_next.lock() = count;
    }

    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        *self.attempts.borrow()
    }

    /// Wait until at least `count` attempts were made.
    pub async fn wait_for_attempts(&self, count: usize) {
        let mut rx = self.attempts.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    /// Accepted connections so far.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Handle to the most recent accepted connection.
    pub fn latest(&self) -> Option<MockConnectionHandle> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn ChannelStream>, SyncError> {
        let refused = {
            let mut refuse = self.refuse_next.lock();
            if *refuse > 0 {
                *refuse -= 1;
                true
            } else {
                false
            }
        };

        let result: Result<Box<dyn ChannelStream>, SyncError> = if refused {
            Err(SyncError::ChannelError("mock connection refused".to_string()))
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            self.connections.lock().push(MockConnectionHandle {
                frames: tx,
                closed: Arc::clone(&closed),
                token: credential.token().to_string(),
            });
            Ok(Box::new(MockStream { frames: rx, closed }))
        };

        self.attempts.send_modify(|seen| *seen += 1);
        result
    }
}
