//! Outbound delivery tracking.
//!
//! Every protocol message the server emits stays in flight until the peer
//! acknowledges its id. Unacknowledged messages are resent after each ack
//! deadline, up to a fixed number of attempts; after that the message is
//! dropped from tracking and the failure is reported.

use crate::locks::lock;
use crate::message::{Frame, Message};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

/// Where resends go.
pub(crate) trait DeliverySink: Send + Sync {
    /// Send a tracked frame, or park it for later. Returns true when the
    /// frame went out on a live transport.
    fn send_tracked(&self, id: &str, frame: Frame) -> bool;

    /// A new attempt of `id` is on the wire.
    fn emitted(&self, id: &str, attempt: u32);
}

/// How a tracking loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Acked,
    /// The frame was parked in the offline buffer; tracking resumes after
    /// the next flush.
    Parked,
    /// Every attempt went unacknowledged.
    Failed { attempts: u32 },
    /// Tracking was dropped, e.g. because the starling closed.
    Abandoned,
}

enum Retry {
    Send(Frame),
    Exhausted(u32),
    Gone,
}

struct InFlight {
    message: Arc<Message>,
    frame: Frame,
    attempts: u32,
    ack_tx: Option<oneshot::Sender<()>>,
}

/// In-flight map of one starling.
pub struct DeliveryTracker {
    in_flight: Mutex<HashMap<String, InFlight>>,
    max_attempts: u32,
    ack_timeout: Duration,
}

impl DeliveryTracker {
    pub fn new(max_attempts: u32, ack_timeout: Duration) -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            ack_timeout,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.in_flight).is_empty()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        lock(&self.in_flight).contains_key(id)
    }

    pub fn message(&self, id: &str) -> Option<Arc<Message>> {
        lock(&self.in_flight).get(id).map(|f| f.message.clone())
    }

    /// Start tracking a message. Nothing has been sent yet.
    pub(crate) fn register(&self, message: Arc<Message>, frame: Frame) {
        let id = message.id().to_string();
        lock(&self.in_flight).insert(
            id,
            InFlight {
                message,
                frame,
                attempts: 0,
                ack_tx: None,
            },
        );
    }

    /// Count an attempt that just went out and arm a fresh ack channel.
    pub(crate) fn arm(&self, id: &str) -> Option<(u32, oneshot::Receiver<()>)> {
        let mut in_flight = lock(&self.in_flight);
        let entry = in_flight.get_mut(id)?;
        let (tx, rx) = oneshot::channel();
        entry.attempts += 1;
        entry.ack_tx = Some(tx);
        Some((entry.attempts, rx))
    }

    /// Settle a message acknowledged by the peer.
    ///
    /// Unknown ids (late or repeated acks) return false and change nothing.
    pub fn acknowledge(&self, id: &str) -> bool {
        let Some(entry) = lock(&self.in_flight).remove(id) else {
            debug!("Ack for unknown message {}", id);
            return false;
        };
        if let Some(tx) = entry.ack_tx {
            let _ = tx.send(());
        }
        true
    }

    /// Stop tracking a message without acknowledging it.
    pub(crate) fn remove(&self, id: &str) -> Option<u32> {
        lock(&self.in_flight).remove(id).map(|f| f.attempts)
    }

    /// Drop every tracked message; running loops end as abandoned.
    pub(crate) fn clear(&self) -> usize {
        let mut in_flight = lock(&self.in_flight);
        let count = in_flight.len();
        in_flight.clear();
        count
    }

    fn retry(&self, id: &str) -> Retry {
        match lock(&self.in_flight).get(id) {
            None => Retry::Gone,
            Some(f) if f.attempts >= self.max_attempts => Retry::Exhausted(f.attempts),
            Some(f) => Retry::Send(f.frame.clone()),
        }
    }

    fn count_attempt(&self, id: &str) -> Option<u32> {
        let mut in_flight = lock(&self.in_flight);
        let entry = in_flight.get_mut(id)?;
        entry.attempts += 1;
        Some(entry.attempts)
    }

    /// Wait for the ack of `id`, resending on every deadline.
    ///
    /// `ack_rx` comes from [`DeliveryTracker::arm`] right after the first
    /// attempt went out.
    pub(crate) async fn track<S: DeliverySink + ?Sized>(
        &self,
        sink: &S,
        id: &str,
        mut ack_rx: oneshot::Receiver<()>,
    ) -> Delivery {
        loop {
            match timeout(self.ack_timeout, &mut ack_rx).await {
                Ok(Ok(())) => return Delivery::Acked,
                Ok(Err(_)) => return Delivery::Abandoned,
                Err(_) => {}
            }

            match self.retry(id) {
                // Acked between the deadline and now, or cleared
                Retry::Gone => return Delivery::Abandoned,
                Retry::Exhausted(attempts) => {
                    return match self.remove(id) {
                        Some(_) => Delivery::Failed { attempts },
                        None => Delivery::Acked,
                    };
                }
                Retry::Send(frame) => {
                    if !sink.send_tracked(id, frame) {
                        return Delivery::Parked;
                    }
                    if let Some(attempt) = self.count_attempt(id) {
                        debug!("Resent {} (attempt {}/{})", id, attempt, self.max_attempts);
                        sink.emitted(id, attempt);
                    }
                }
            }
        }
    }
}
