//! Peer-to-peer routing.
//!
//! Messages carrying a `peer` header are addressed to another starling.
//! When a proxy handler is installed such messages are handed to it instead
//! of being processed locally; the handler decides whether to forward,
//! answer or deny them.

use crate::context::RequestContext;
use crate::error::{HeliosError, Result};
use crate::message::{Body, Content, Frame, Message, MessageKind};
use crate::starling::Starling;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides what happens to peer-addressed traffic.
pub trait ProxyHandler: Send + Sync + 'static {
    fn handle(&self, context: ProxyContext) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> ProxyHandler for F
where
    F: Fn(ProxyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, context: ProxyContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(context))
    }
}

/// Result of [`ProxyContext::forward`].
#[derive(Debug, Clone, PartialEq)]
pub enum Forwarded {
    /// The target answered the forwarded request.
    Response(Value),
    /// A non-request message was handed to the target.
    Delivered,
}

/// One peer-addressed message awaiting a routing decision.
#[derive(Clone)]
pub struct ProxyContext {
    source: Arc<Starling>,
    message: Arc<Message>,
    /// Present for requests; guards the single terminal response.
    request: Option<RequestContext>,
}

impl ProxyContext {
    pub(crate) fn new(source: Arc<Starling>, message: Arc<Message>) -> Self {
        let request = (message.kind() == MessageKind::Request)
            .then(|| RequestContext::new(source.clone(), &message));
        Self {
            source,
            message,
            request,
        }
    }

    pub fn source(&self) -> &Arc<Starling> {
        &self.source
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Identity named by the `peer` header.
    pub fn peer(&self) -> Option<&str> {
        self.message.peer()
    }

    /// The addressed starling, if it is registered.
    pub fn target(&self) -> Option<Arc<Starling>> {
        self.peer()
            .and_then(|peer| self.source.starlings().lookup_by_id(peer))
    }

    /// Re-issue the message on `target`.
    ///
    /// Requests wait for the target's answer; everything else is delivered
    /// and returns immediately. Responses cannot be forwarded.
    pub async fn forward(&self, target: &Arc<Starling>) -> Result<Forwarded> {
        if target.id() == self.source.id() {
            return Err(HeliosError::InvalidTarget {
                reason: "cannot forward to the sender".into(),
            });
        }
        if target.is_closed() || self.source.starlings().lookup_by_id(target.id()).is_none() {
            return Err(HeliosError::InvalidTarget {
                reason: format!("starling {} is not registered", target.id()),
            });
        }

        debug!(
            "Forwarding {} from {} to {}",
            self.message.id(),
            self.source.id(),
            target.id()
        );

        match self.message.content() {
            Content::Protocol(envelope) => match &envelope.body {
                Body::Request {
                    method, payload, ..
                } => {
                    let data = target.request(method, payload.clone()).await?;
                    Ok(Forwarded::Response(data))
                }
                Body::Response { .. } => Err(HeliosError::UnsupportedKind {
                    reason: "responses cannot be forwarded".into(),
                }),
                body => {
                    target.emit(Message::outgoing(body.clone()))?;
                    Ok(Forwarded::Delivered)
                }
            },
            Content::Text(text) => {
                target.send_raw(Frame::Text(text.clone()));
                Ok(Forwarded::Delivered)
            }
            Content::Json(value) => {
                target.send_raw(Frame::Text(serde_json::to_string(value)?));
                Ok(Forwarded::Delivered)
            }
            Content::Binary(bytes) => {
                target.send_raw(Frame::Binary(bytes.clone()));
                Ok(Forwarded::Delivered)
            }
        }
    }

    fn request_context(&self) -> Result<&RequestContext> {
        self.request.as_ref().ok_or_else(|| HeliosError::UnsupportedKind {
            reason: "only requests can be answered".into(),
        })
    }

    /// Answer the source's request directly.
    pub fn reply(&self, data: Value) -> Result<()> {
        self.request_context()?.success(data)
    }

    /// Refuse the source's request.
    pub fn deny(&self, reason: &str, status: u16) -> Result<()> {
        self.request_context()?
            .error_with_details("PROXY_DENIED", reason, json!({ "status": status }))
    }

    /// Report a handler failure back to the source, if it is still waiting.
    pub(crate) fn fail(&self, error: &HeliosError) {
        let Some(request) = &self.request else {
            return;
        };
        if request.is_finished() {
            return;
        }
        if let Err(e) = request.error(error.code(), error.to_string()) {
            warn!("Failed to report proxy error to {}: {}", self.source.id(), e);
        }
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("source", &self.source.id())
            .field("message", &self.message.id())
            .field("peer", &self.peer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helios::Helios;
    use crate::transport::{ChannelTransport, Handshake};
    use tokio::sync::mpsc;

    fn connect(helios: &Helios) -> (Arc<Starling>, mpsc::UnboundedReceiver<Frame>) {
        let (transport, rx) = ChannelTransport::new();
        let starling = helios.on_open(Arc::new(transport), &Handshake::default());
        (starling, rx)
    }

    fn context(source: &Arc<Starling>, message: Message) -> ProxyContext {
        ProxyContext::new(source.clone(), Arc::new(message))
    }

    #[tokio::test]
    async fn test_forward_to_sender_is_rejected() {
        let helios = Helios::new().unwrap();
        let (alice, _alice_rx) = connect(&helios);

        let ctx = context(&alice, Message::notification(json!({})).with_peer(alice.id()));
        assert!(matches!(
            ctx.forward(&alice).await,
            Err(HeliosError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_forward_to_closed_target_is_rejected() {
        let helios = Helios::new().unwrap();
        let (alice, _alice_rx) = connect(&helios);
        let (bob, _bob_rx) = connect(&helios);
        bob.close();

        let ctx = context(&alice, Message::notification(json!({})).with_peer(bob.id()));
        assert!(ctx.target().is_none());
        assert!(matches!(
            ctx.forward(&bob).await,
            Err(HeliosError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_forward_response_is_unsupported() {
        let helios = Helios::new().unwrap();
        let (alice, _alice_rx) = connect(&helios);
        let (bob, mut bob_rx) = connect(&helios);

        let ctx = context(&alice, Message::success("r1", json!(1)).with_peer(bob.id()));
        assert!(matches!(
            ctx.forward(&bob).await,
            Err(HeliosError::UnsupportedKind { .. })
        ));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reply_and_deny_need_a_request() {
        let helios = Helios::new().unwrap();
        let (alice, mut alice_rx) = connect(&helios);
        let (bob, _bob_rx) = connect(&helios);

        let ctx = context(&alice, Message::notification(json!({})).with_peer(bob.id()));
        assert!(matches!(
            ctx.reply(json!("hi")),
            Err(HeliosError::UnsupportedKind { .. })
        ));
        assert!(matches!(
            ctx.deny("not allowed", 403),
            Err(HeliosError::UnsupportedKind { .. })
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forward_notification_is_delivered() {
        let helios = Helios::new().unwrap();
        let (alice, _alice_rx) = connect(&helios);
        let (bob, mut bob_rx) = connect(&helios);

        let ctx = context(
            &alice,
            Message::notification(json!({ "text": "hi bob" })).with_peer(bob.id()),
        );
        assert_eq!(ctx.forward(&bob).await.unwrap(), Forwarded::Delivered);

        let Some(Frame::Text(text)) = bob_rx.recv().await else {
            panic!("Expected a text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["notification"]["text"], "hi bob");
    }
}
