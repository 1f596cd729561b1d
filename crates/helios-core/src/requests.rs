//! Requests issued by the server to a starling.
//!
//! Each in-flight request has a deadline. Whichever happens first, a
//! matching response, the deadline, or a bulk cancellation, settles it; the
//! other outcomes then find nothing to do.

use crate::error::RequestError;
use crate::locks::lock;
use crate::message::{Body, Message};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a server-initiated request.
pub type RequestResult = std::result::Result<Value, RequestError>;

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Deadline override; the server default applies when `None`.
    pub timeout: Option<Duration>,
    /// Retry with backoff when queued and the answer never arrives.
    pub retry: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: true,
        }
    }
}

/// A request not yet on the wire.
///
/// Each send builds a fresh [`Message`], so a retried request gets a new
/// `requestId` and cannot be mistaken for a duplicate by the peer.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    key: u64,
    method: String,
    payload: Value,
    options: RequestOptions,
    created_at: Instant,
}

impl OutgoingRequest {
    pub fn new(method: impl Into<String>, payload: Value, options: RequestOptions) -> Self {
        static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            method: method.into(),
            payload,
            options,
            created_at: Instant::now(),
        }
    }

    /// Local identity, stable across retries.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn to_message(&self) -> Message {
        Message::request(self.method.clone(), self.payload.clone())
    }
}

struct Pending {
    method: String,
    started: Instant,
    tx: oneshot::Sender<RequestResult>,
    timer: Option<JoinHandle<()>>,
}

/// In-flight requests of one starling, keyed by `requestId`.
pub struct PendingRequests {
    pending: Mutex<HashMap<String, Pending>>,
    default_timeout: Duration,
}

impl PendingRequests {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn create(
        &self,
        method: impl Into<String>,
        payload: Value,
        options: RequestOptions,
    ) -> OutgoingRequest {
        OutgoingRequest::new(method, payload, options)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        lock(&self.pending).contains_key(request_id)
    }

    /// Start tracking `request_id` and arm its deadline.
    pub(crate) fn register(
        self: &Arc<Self>,
        request_id: &str,
        request: &OutgoingRequest,
    ) -> oneshot::Receiver<RequestResult> {
        let (tx, rx) = oneshot::channel();
        let timeout = request.options().timeout.unwrap_or(self.default_timeout);

        lock(&self.pending).insert(
            request_id.to_string(),
            Pending {
                method: request.method().to_string(),
                started: Instant::now(),
                tx,
                timer: None,
            },
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let id = request_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(requests) = weak.upgrade() {
                requests.expire(&id);
            }
        });

        match lock(&self.pending).get_mut(request_id) {
            Some(entry) => entry.timer = Some(timer),
            // Already settled
            None => timer.abort(),
        }
        rx
    }

    /// Settle a request with the response that answers it.
    ///
    /// Returns false when no request with that id is pending.
    pub fn resolve(&self, response: &Message) -> bool {
        let Some(Body::Response {
            request_id,
            success,
            data,
            error,
        }) = response.body()
        else {
            return false;
        };

        let Some(entry) = lock(&self.pending).remove(request_id) else {
            debug!("Response for unknown request {}", request_id);
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }

        let result = if *success {
            Ok(data.clone())
        } else {
            let (code, message, details) = match error {
                Some(e) => (e.code.clone(), e.message.clone(), e.details.clone()),
                None => ("UNKNOWN_ERROR".to_string(), "Request failed".to_string(), None),
            };
            Err(RequestError::Remote {
                code,
                message,
                details,
            })
        };
        debug!(
            "Request {} ({}) settled after {:?}",
            request_id,
            entry.method,
            entry.started.elapsed()
        );
        let _ = entry.tx.send(result);
        true
    }

    /// Fail a request whose deadline passed.
    pub fn expire(&self, request_id: &str) -> bool {
        let Some(entry) = lock(&self.pending).remove(request_id) else {
            return false;
        };
        let elapsed = entry.started.elapsed();
        warn!(
            "Request {} to method {} timed out after {:?}",
            request_id, entry.method, elapsed
        );
        let _ = entry.tx.send(Err(RequestError::Timeout {
            method: entry.method,
            elapsed,
        }));
        true
    }

    pub fn cancel(&self, request_id: &str, reason: &str) -> bool {
        let Some(entry) = lock(&self.pending).remove(request_id) else {
            return false;
        };
        Self::reject(entry, reason);
        true
    }

    /// Reject every pending request; returns how many there were.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            Self::reject(entry, reason);
        }
        count
    }

    fn reject(entry: Pending, reason: &str) {
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        let _ = entry.tx.send(Err(RequestError::Cancelled {
            reason: reason.to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorBody;
    use serde_json::json;

    fn setup() -> (Arc<PendingRequests>, OutgoingRequest, Message) {
        let requests = Arc::new(PendingRequests::new(Duration::from_secs(30)));
        let request = requests.create("user:get", json!({"id": 1}), RequestOptions::default());
        let message = request.to_message();
        (requests, request, message)
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_resolves() {
        let (requests, request, message) = setup();
        let rx = requests.register(message.id(), &request);

        assert!(requests.resolve(&Message::success(message.id(), json!({"name": "Ada"}))));
        assert_eq!(rx.await.unwrap(), Ok(json!({"name": "Ada"})));
        assert!(requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_response_is_remote_error() {
        let (requests, request, message) = setup();
        let rx = requests.register(message.id(), &request);

        requests.resolve(&Message::failure(
            message.id(),
            ErrorBody::new("USER_NOT_FOUND", "no such user"),
        ));
        match rx.await.unwrap() {
            Err(RequestError::Remote { code, .. }) => assert_eq!(code, "USER_NOT_FOUND"),
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let (requests, _, message) = setup();
        let request = OutgoingRequest::new(
            "slow",
            Value::Null,
            RequestOptions {
                timeout: Some(Duration::from_secs(2)),
                retry: true,
            },
        );
        let rx = requests.register(message.id(), &request);

        tokio::time::sleep(Duration::from_secs(3)).await;
        match rx.await.unwrap() {
            Err(RequestError::Timeout { method, .. }) => assert_eq!(method, "slow"),
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(!requests.contains(message.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_after_timeout_is_noop() {
        let (requests, request, message) = setup();
        let rx = requests.register(message.id(), &request);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(rx.await.unwrap().is_err());
        assert!(!requests.resolve(&Message::success(message.id(), Value::Null)));
    }

    #[tokio::test]
    async fn test_unknown_response_is_noop() {
        let (requests, _, _) = setup();
        assert!(!requests.resolve(&Message::success("nobody", Value::Null)));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let requests = Arc::new(PendingRequests::new(Duration::from_secs(30)));
        let mut receivers = Vec::new();
        for method in ["a", "b"] {
            let request = requests.create(method, Value::Null, RequestOptions::default());
            let message = request.to_message();
            receivers.push(requests.register(message.id(), &request));
        }

        assert_eq!(requests.cancel_all("Connection closed"), 2);
        for rx in receivers {
            assert_eq!(
                rx.await.unwrap(),
                Err(RequestError::Cancelled {
                    reason: "Connection closed".into()
                })
            );
        }
    }

    #[test]
    fn test_each_send_gets_fresh_id() {
        let request = OutgoingRequest::new("m", Value::Null, RequestOptions::default());
        assert_ne!(request.to_message().id(), request.to_message().id());
    }
}
