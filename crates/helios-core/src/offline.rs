//! Offline buffering.
//!
//! Two queues with different policies:
//!
//! - [`FrameBuffer`] holds fully encoded frames produced while a starling
//!   has no live transport. Bounded, drop-oldest, flushed in FIFO order on
//!   reconnection before anything else is sent.
//! - [`RequestQueue`] holds requests created while disconnected. It drains
//!   FIFO with head-of-line blocking: a failed head is retried after an
//!   escalating delay and nothing behind it moves until it settles.

use crate::error::RequestError;
use crate::locks::lock;
use crate::message::Frame;
use crate::requests::{OutgoingRequest, RequestResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A frame waiting for a transport.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub frame: Frame,
    /// Id of the tracked message this frame carries, if any.
    pub tracked: Option<String>,
    pub buffered_at: Instant,
}

/// Outcome of a flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub sent: usize,
    /// Tracked message ids that went out, in order.
    pub tracked: Vec<String>,
    /// Frames still buffered because a send failed.
    pub remaining: usize,
}

/// Bounded FIFO of raw frames.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<BufferedFrame>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Append a frame, evicting and returning the oldest one when full.
    pub fn push(&mut self, frame: Frame, tracked: Option<String>) -> Option<BufferedFrame> {
        let evicted = if self.is_full() {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(BufferedFrame {
            frame,
            tracked,
            buffered_at: Instant::now(),
        });
        evicted
    }

    /// Send buffered frames in order until one fails.
    ///
    /// The failed frame stays at the front, followed by the rest in their
    /// original order.
    pub fn flush(&mut self, mut send: impl FnMut(&Frame) -> bool) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(item) = self.frames.pop_front() {
            if !send(&item.frame) {
                self.frames.push_front(item);
                break;
            }
            report.sent += 1;
            if let Some(id) = item.tracked {
                report.tracked.push(id);
            }
        }
        report.remaining = self.frames.len();
        report
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }
}

/// Runs queued requests on behalf of the queue.
#[async_trait]
pub(crate) trait RequestExecutor: Send + Sync {
    fn is_live(&self) -> bool;

    /// Send the request and wait for its outcome.
    async fn execute(&self, request: &OutgoingRequest) -> RequestResult;
}

struct QueuedRequest {
    request: OutgoingRequest,
    tx: oneshot::Sender<RequestResult>,
    attempts: usize,
}

/// FIFO of requests waiting for a live connection.
pub struct RequestQueue {
    queue: Mutex<VecDeque<QueuedRequest>>,
    draining: AtomicBool,
    delays: Vec<Duration>,
}

impl RequestQueue {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            delays,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Queue a request; the receiver yields its eventual outcome.
    pub fn push(&self, request: OutgoingRequest) -> oneshot::Receiver<RequestResult> {
        let (tx, rx) = oneshot::channel();
        debug!("Queueing request {} until reconnection", request.method());
        lock(&self.queue).push_back(QueuedRequest {
            request,
            tx,
            attempts: 0,
        });
        rx
    }

    /// Reject every queued request.
    pub fn clear(&self, reason: &str) -> usize {
        let drained: Vec<_> = lock(&self.queue).drain(..).collect();
        let count = drained.len();
        for item in drained {
            let _ = item.tx.send(Err(RequestError::Cancelled {
                reason: reason.to_string(),
            }));
        }
        count
    }

    /// Process the queue while the executor is live.
    ///
    /// Only one drain runs at a time; a second call returns immediately.
    pub(crate) async fn drain<E: RequestExecutor>(&self, executor: &E) {
        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            self.drain_inner(executor).await;
            self.draining.store(false, Ordering::SeqCst);

            // A request queued while we were finishing would otherwise wait
            // for the next reconnection.
            if self.is_empty() || !executor.is_live() {
                return;
            }
        }
    }

    async fn drain_inner<E: RequestExecutor>(&self, executor: &E) {
        while executor.is_live() {
            let head = lock(&self.queue)
                .front()
                .map(|item| (item.request.clone(), item.attempts));
            let Some((request, attempts)) = head else {
                break;
            };

            let result = executor.execute(&request).await;

            let retry_delay = match &result {
                Err(e) if e.is_retryable() && request.options().retry => {
                    self.delays.get(attempts).copied()
                }
                _ => None,
            };

            if let Some(delay) = retry_delay {
                {
                    let mut queue = lock(&self.queue);
                    match queue.front_mut() {
                        Some(item) if item.request.key() == request.key() => item.attempts += 1,
                        // Cleared underneath us
                        _ => break,
                    }
                }
                debug!(
                    "Queued request {} failed, retrying in {:?} (attempt {})",
                    request.method(),
                    delay,
                    attempts + 1
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let item = {
                let mut queue = lock(&self.queue);
                match queue.front() {
                    Some(item) if item.request.key() == request.key() => queue.pop_front(),
                    _ => None,
                }
            };
            if let Some(item) = item {
                if let Err(e) = &result {
                    warn!("Queued request {} failed: {}", request.method(), e);
                }
                let _ = item.tx.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::RequestOptions;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn frame(s: &str) -> Frame {
        Frame::Text(s.to_string())
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let mut buffer = FrameBuffer::new(2);
        assert!(buffer.push(frame("a"), None).is_none());
        assert!(buffer.push(frame("b"), None).is_none());

        let evicted = buffer.push(frame("c"), Some("m3".into())).unwrap();
        assert_eq!(evicted.frame, frame("a"));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_flush_is_fifo() {
        let mut buffer = FrameBuffer::new(10);
        buffer.push(frame("1"), Some("m1".into()));
        buffer.push(frame("2"), None);
        buffer.push(frame("3"), Some("m3".into()));

        let mut sent = Vec::new();
        let report = buffer.flush(|f| {
            sent.push(f.clone());
            true
        });

        assert_eq!(sent, vec![frame("1"), frame("2"), frame("3")]);
        assert_eq!(report.sent, 3);
        assert_eq!(report.tracked, vec!["m1".to_string(), "m3".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_failure_keeps_order() {
        let mut buffer = FrameBuffer::new(10);
        for s in ["1", "2", "3", "4"] {
            buffer.push(frame(s), None);
        }

        let mut calls = 0;
        let report = buffer.flush(|_| {
            calls += 1;
            calls < 2
        });
        assert_eq!(report.sent, 1);
        assert_eq!(report.remaining, 3);

        let mut rest = Vec::new();
        buffer.flush(|f| {
            rest.push(f.clone());
            true
        });
        assert_eq!(rest, vec![frame("2"), frame("3"), frame("4")]);
    }

    /// Executor answering from a script of results, recording call order.
    struct ScriptedExecutor {
        live: AtomicBool,
        calls: Mutex<Vec<String>>,
        script: Mutex<VecDeque<RequestResult>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<RequestResult>) -> Self {
            Self {
                live: AtomicBool::new(true),
                calls: Mutex::new(Vec::new()),
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl RequestExecutor for ScriptedExecutor {
        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }

        async fn execute(&self, request: &OutgoingRequest) -> RequestResult {
            self.calls.lock().unwrap().push(request.method().to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Value::Null))
        }
    }

    fn timeout_err() -> RequestResult {
        Err(RequestError::Timeout {
            method: "m".into(),
            elapsed: Duration::from_secs(1),
        })
    }

    fn delays() -> Vec<Duration> {
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_preserves_fifo() {
        let queue = RequestQueue::new(delays());
        let mut receivers = Vec::new();
        for i in 1..=3 {
            receivers.push(queue.push(OutgoingRequest::new(
                format!("req{}", i),
                json!(i),
                RequestOptions::default(),
            )));
        }

        let executor = ScriptedExecutor::new(vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]);
        queue.drain(&executor).await;

        assert_eq!(
            *executor.calls.lock().unwrap(),
            vec!["req1", "req2", "req3"]
        );
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), Ok(json!(i + 1)));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_head_retries_before_next() {
        let queue = RequestQueue::new(delays());
        let first = queue.push(OutgoingRequest::new("a", Value::Null, RequestOptions::default()));
        let second = queue.push(OutgoingRequest::new("b", Value::Null, RequestOptions::default()));

        let executor = ScriptedExecutor::new(vec![timeout_err(), Ok(json!("a")), Ok(json!("b"))]);
        let started = Instant::now();
        queue.drain(&executor).await;

        assert_eq!(*executor.calls.lock().unwrap(), vec!["a", "a", "b"]);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(first.await.unwrap(), Ok(json!("a")));
        assert_eq!(second.await.unwrap(), Ok(json!("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausts() {
        let queue = RequestQueue::new(delays());
        let rx = queue.push(OutgoingRequest::new("a", Value::Null, RequestOptions::default()));

        let executor = ScriptedExecutor::new(vec![
            timeout_err(),
            timeout_err(),
            timeout_err(),
            timeout_err(),
        ]);
        let started = Instant::now();
        queue.drain(&executor).await;

        // One initial attempt plus one per scheduled delay
        assert_eq!(executor.calls.lock().unwrap().len(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert!(matches!(rx.await.unwrap(), Err(RequestError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_disabled_rejects_immediately() {
        let queue = RequestQueue::new(delays());
        let options = RequestOptions {
            retry: false,
            ..Default::default()
        };
        let rx = queue.push(OutgoingRequest::new("a", Value::Null, options));

        let executor = ScriptedExecutor::new(vec![timeout_err()]);
        queue.drain(&executor).await;

        assert_eq!(executor.calls.lock().unwrap().len(), 1);
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_is_not_retried() {
        let queue = RequestQueue::new(delays());
        let rx = queue.push(OutgoingRequest::new("a", Value::Null, RequestOptions::default()));

        let executor = ScriptedExecutor::new(vec![Err(RequestError::Remote {
            code: "DENIED".into(),
            message: "no".into(),
            details: None,
        })]);
        queue.drain(&executor).await;

        assert_eq!(executor.calls.lock().unwrap().len(), 1);
        assert!(matches!(
            rx.await.unwrap(),
            Err(RequestError::Remote { .. })
        ));
    }

    #[tokio::test]
    async fn test_drain_waits_for_live() {
        let queue = RequestQueue::new(delays());
        let _rx = queue.push(OutgoingRequest::new("a", Value::Null, RequestOptions::default()));

        let executor = ScriptedExecutor::new(vec![]);
        executor.live.store(false, Ordering::SeqCst);
        queue.drain(&executor).await;

        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_rejects_all() {
        let queue = RequestQueue::new(delays());
        let a = queue.push(OutgoingRequest::new("a", Value::Null, RequestOptions::default()));
        let b = queue.push(OutgoingRequest::new("b", Value::Null, RequestOptions::default()));

        assert_eq!(queue.clear("Queue cleared"), 2);
        for rx in [a, b] {
            assert_eq!(
                rx.await.unwrap(),
                Err(RequestError::Cancelled {
                    reason: "Queue cleared".into()
                })
            );
        }
    }

    #[tokio::test]
    async fn test_single_drainer() {
        let queue = Arc::new(RequestQueue::new(delays()));
        let counter = Arc::new(AtomicUsize::new(0));
        queue.draining.store(true, Ordering::SeqCst);
        let _rx = queue.push(OutgoingRequest::new("a", Value::Null, RequestOptions::default()));

        let executor = ScriptedExecutor::new(vec![]);
        queue.drain(&executor).await;
        counter.fetch_add(executor.calls.lock().unwrap().len(), Ordering::SeqCst);

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
