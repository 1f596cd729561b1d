//! Server-scoped publish/subscribe channel.
//!
//! Every [`crate::Helios`] owns one bus; it lives exactly as long as the
//! server context. Publishing never blocks and never fails: events are
//! dropped when nobody listens, and slow subscribers observe `Lagged`.

use crate::message::{ErrorBody, Message, StreamType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Something observable happened inside the engine.
#[derive(Debug, Clone)]
pub enum HeliosEvent {
    Connected {
        starling: String,
    },
    Disconnected {
        starling: String,
        ttl: Duration,
    },
    Reconnected {
        starling: String,
    },
    Closed {
        starling: String,
    },
    StateRestored {
        starling: String,
        namespaces: Vec<String>,
    },
    MethodAdded {
        name: String,
    },
    RequestReceived {
        starling: String,
        method: String,
        request_id: String,
    },
    NotificationReceived {
        starling: String,
        notification: Value,
    },
    ErrorReceived {
        starling: String,
        error: ErrorBody,
    },
    /// Non-protocol traffic.
    MessageReceived {
        starling: String,
        message: Arc<Message>,
    },
    StreamOpened {
        starling: String,
        stream_id: String,
        stream_type: StreamType,
    },
    StreamClosed {
        starling: String,
        stream_id: String,
        reason: Option<String>,
    },
    MessageEmitted {
        starling: String,
        message_id: String,
        attempt: u32,
    },
    MessageAcked {
        starling: String,
        message_id: String,
    },
    DeliveryFailed {
        starling: String,
        message_id: String,
        attempts: u32,
    },
}

impl HeliosEvent {
    /// Short topic name, for logging and filtering.
    pub fn topic(&self) -> &'static str {
        match self {
            HeliosEvent::Connected { .. } => "starling:connected",
            HeliosEvent::Disconnected { .. } => "starling:disconnected",
            HeliosEvent::Reconnected { .. } => "starling:reconnected",
            HeliosEvent::Closed { .. } => "starling:closed",
            HeliosEvent::StateRestored { .. } => "starling:restored",
            HeliosEvent::MethodAdded { .. } => "methods:added",
            HeliosEvent::RequestReceived { .. } => "starling:request",
            HeliosEvent::NotificationReceived { .. } => "starling:notification",
            HeliosEvent::ErrorReceived { .. } => "starling:error",
            HeliosEvent::MessageReceived { .. } => "starling:message",
            HeliosEvent::StreamOpened { .. } => "stream:init",
            HeliosEvent::StreamClosed { .. } => "stream:close",
            HeliosEvent::MessageEmitted { .. } => "message:emitted",
            HeliosEvent::MessageAcked { .. } => "message:ack",
            HeliosEvent::DeliveryFailed { .. } => "message:emitted:error",
        }
    }
}

/// Broadcast channel owned by the server context.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HeliosEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: HeliosEvent) {
        trace!("event {}", event.topic());
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeliosEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(HeliosEvent::Connected {
            starling: "a".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "starling:connected");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(HeliosEvent::Closed {
            starling: "a".into(),
        });
    }
}
