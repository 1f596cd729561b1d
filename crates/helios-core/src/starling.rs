//! The per-peer actor.
//!
//! A [`Starling`] is the server-side identity of one remote peer. It outlives
//! the physical connection: when the transport drops the starling waits for
//! a grace period, buffering outbound traffic, and a reconnecting peer that
//! presents a recovery token picks up where it left off.
//!
//! Lifecycle: `Live -> Disconnected -> (Live | Closed)`, `Live -> Closed`.
//! `Closed` is terminal.
//!
//! Lock order is registry, then buffer, then link. No lock is held across
//! an await.

use crate::context::RequestContext;
use crate::delivery::{Delivery, DeliverySink, DeliveryTracker};
use crate::error::{RequestError, Result, TransportError};
use crate::events::HeliosEvent;
use crate::helios::HeliosContext;
use crate::locks::{lock, read, write};
use crate::message::{
    decode, encode, encode_ack, new_id, Body, Decoded, ErrorBody, Frame, Message, MessageKind,
};
use crate::offline::{FrameBuffer, RequestExecutor, RequestQueue};
use crate::proxy::ProxyContext;
use crate::recovery::token_notification;
use crate::requests::{OutgoingRequest, PendingRequests, RequestOptions, RequestResult};
use crate::starlings::Starlings;
use crate::transport::{Transport, TransportHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state of a starling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Live,
    Disconnected,
    Closed,
}

/// What happened to a frame handed to the starling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Parked in the offline buffer.
    Buffered,
    /// The starling is closed.
    Dropped,
}

struct Link {
    transport: Option<Arc<dyn Transport>>,
    status: LinkStatus,
    disconnected_at: Option<DateTime<Utc>>,
    /// Bumped on every transition; a grace timer only fires for its own.
    epoch: u64,
    grace_timer: Option<JoinHandle<()>>,
}

/// Server-side actor for one peer.
pub struct Starling {
    id: String,
    this: Weak<Starling>,
    ctx: Arc<HeliosContext>,
    link: Mutex<Link>,
    buffer: Mutex<FrameBuffer>,
    delivery: DeliveryTracker,
    requests: Arc<PendingRequests>,
    queue: RequestQueue,
    /// Recently received protocol messages, for duplicate suppression.
    seen: Cache<String, Arc<Message>>,
    data: RwLock<HashMap<String, Value>>,
    closed: AtomicBool,
}

impl Starling {
    pub(crate) fn new(ctx: Arc<HeliosContext>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let cfg_ctx = Arc::clone(&ctx);
        let config = &cfg_ctx.config;
        Arc::new_cyclic(|this| Self {
            id: new_id(),
            this: this.clone(),
            link: Mutex::new(Link {
                transport: Some(transport),
                status: LinkStatus::Live,
                disconnected_at: None,
                epoch: 0,
                grace_timer: None,
            }),
            buffer: Mutex::new(FrameBuffer::new(config.offline_buffer_capacity)),
            delivery: DeliveryTracker::new(config.delivery_attempts, config.ack_timeout),
            requests: Arc::new(PendingRequests::new(config.request_timeout)),
            queue: RequestQueue::new(config.request_retry_delays.clone()),
            seen: Cache::builder()
                .max_capacity(config.seen_capacity)
                .time_to_live(config.disconnection_ttl)
                .build(),
            data: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            ctx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> LinkStatus {
        lock(&self.link).status
    }

    pub fn is_live(&self) -> bool {
        self.status() == LinkStatus::Live
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.link).disconnected_at
    }

    pub fn transport_handle(&self) -> Option<TransportHandle> {
        lock(&self.link).transport.as_ref().map(|t| t.handle())
    }

    /// Every starling connected to the same server.
    pub fn starlings(&self) -> &Starlings {
        &self.ctx.starlings
    }

    pub fn delivery(&self) -> &DeliveryTracker {
        &self.delivery
    }

    pub fn requests(&self) -> &PendingRequests {
        &self.requests
    }

    pub fn buffered_len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    fn publish(&self, event: HeliosEvent) {
        self.ctx.events.publish(event);
    }

    fn live_transport(&self) -> Option<Arc<dyn Transport>> {
        let link = lock(&self.link);
        match link.status {
            LinkStatus::Live => link.transport.clone(),
            _ => None,
        }
    }

    // Key/value store

    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.data).get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        write(&self.data).insert(key.into(), value);
    }

    pub fn has(&self, key: &str) -> bool {
        read(&self.data).contains_key(key)
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        write(&self.data).remove(key)
    }

    // Outbound

    /// Send a frame on the live transport, or park it.
    ///
    /// Frames never overtake buffered ones: while the buffer is non-empty new
    /// frames queue behind it. A transport that fails a send is detached, so
    /// the buffer is only ever non-empty while disconnected.
    fn send_frame(&self, frame: Frame, tracked: Option<&str>) -> SendOutcome {
        let evicted = {
            let mut buffer = lock(&self.buffer);
            if buffer.is_empty() {
                if let Some(transport) = self.live_transport() {
                    match transport.send(frame.clone()) {
                        Ok(()) => return SendOutcome::Sent,
                        Err(e) => {
                            self.drop_failed_transport(transport.handle(), &e.to_string())
                        }
                    }
                }
            }
            if self.is_closed() {
                return SendOutcome::Dropped;
            }
            buffer.push(frame, tracked.map(str::to_string))
        };

        if let Some(evicted) = evicted {
            warn!("Offline buffer of {} is full, dropped oldest frame", self.id);
            if let Some(id) = evicted.tracked {
                if let Some(attempts) = self.delivery.remove(&id) {
                    self.publish(HeliosEvent::DeliveryFailed {
                        starling: self.id.clone(),
                        message_id: id,
                        attempts,
                    });
                }
            }
        }
        SendOutcome::Buffered
    }

    /// Send a message and track it until acknowledged.
    ///
    /// Opaque content is sent as-is and not tracked.
    pub fn emit(self: &Arc<Self>, message: Message) -> Result<Arc<Message>> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        let frame = encode(&message)?;
        let message = Arc::new(message);
        let id = message.id().to_string();
        let tracked = message.envelope().is_some();
        if tracked {
            self.delivery.register(message.clone(), frame.clone());
        }

        match self.send_frame(frame, tracked.then_some(id.as_str())) {
            SendOutcome::Sent if tracked => self.start_tracking(&id),
            SendOutcome::Sent => {}
            SendOutcome::Buffered => debug!("{} is offline, buffered {}", self.id, id),
            SendOutcome::Dropped => {
                self.delivery.remove(&id);
            }
        }
        Ok(message)
    }

    /// Send an untracked raw frame.
    pub fn send_raw(&self, frame: Frame) -> SendOutcome {
        self.send_frame(frame, None)
    }

    /// Push a notification.
    pub fn notify(self: &Arc<Self>, notification: Value) -> Result<()> {
        self.emit(Message::notification(notification))?;
        Ok(())
    }

    fn start_tracking(self: &Arc<Self>, id: &str) {
        // Acked before we got here
        let Some((attempt, ack_rx)) = self.delivery.arm(id) else {
            return;
        };
        self.emitted(id, attempt);

        let starling = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Delivery::Failed { attempts } =
                starling.delivery.track(starling.as_ref(), &id, ack_rx).await
            {
                error!(
                    "Delivery of {} to {} failed after {} attempts",
                    id, starling.id, attempts
                );
                starling.publish(HeliosEvent::DeliveryFailed {
                    starling: starling.id.clone(),
                    message_id: id,
                    attempts,
                });
            }
        });
    }

    fn send_ack(&self, id: &str) {
        let Some(transport) = self.live_transport() else {
            return;
        };
        match encode_ack(id) {
            Ok(frame) => {
                if let Err(e) = transport.send(frame) {
                    self.drop_failed_transport(transport.handle(), &e.to_string());
                }
            }
            Err(e) => warn!("Cannot acknowledge {}: {}", id, e),
        }
    }

    // Requests to the peer

    /// Call a method on the peer with default options.
    pub async fn request(self: &Arc<Self>, method: &str, payload: Value) -> RequestResult {
        self.request_with(method, payload, RequestOptions::default())
            .await
    }

    /// Call a method on the peer.
    ///
    /// While disconnected the request waits in the offline queue and is sent
    /// in order once the peer is back.
    pub async fn request_with(
        self: &Arc<Self>,
        method: &str,
        payload: Value,
        options: RequestOptions,
    ) -> RequestResult {
        if self.is_closed() {
            return Err(RequestError::Cancelled {
                reason: "Connection closed".into(),
            });
        }
        let request = self.requests.create(method, payload, options);

        let rx = if self.is_live() {
            self.send_request(&request)
        } else {
            let rx = self.queue.push(request);
            if self.is_closed() {
                self.queue.clear("Connection closed");
            }
            self.kick_queue();
            rx
        };
        rx.await.unwrap_or_else(|_| {
            Err(RequestError::Cancelled {
                reason: "Request dropped".into(),
            })
        })
    }

    fn send_request(self: &Arc<Self>, request: &OutgoingRequest) -> oneshot::Receiver<RequestResult> {
        let message = request.to_message();
        let request_id = message.id().to_string();
        let rx = self.requests.register(&request_id, request);
        if let Err(e) = self.emit(message) {
            self.requests.cancel(&request_id, &e.to_string());
        }
        rx
    }

    async fn execute_request(self: &Arc<Self>, request: &OutgoingRequest) -> RequestResult {
        if !self.is_live() {
            return Err(RequestError::NotLive);
        }
        self.send_request(request).await.unwrap_or_else(|_| {
            Err(RequestError::Cancelled {
                reason: "Request dropped".into(),
            })
        })
    }

    fn kick_queue(self: &Arc<Self>) {
        if self.queue.is_empty() || !self.is_live() {
            return;
        }
        let starling = self.clone();
        tokio::spawn(async move {
            starling.queue.drain(&starling).await;
        });
    }

    // Recovery

    /// Snapshot this starling into a signed recovery token.
    pub fn recovery_token(&self) -> Result<String> {
        self.ctx.states.generate_token(
            self,
            self.ctx.signer.as_ref(),
            self.ctx.config.token_ttl,
        )
    }

    /// Push a fresh recovery token as a `starling:token` notification.
    pub fn send_recovery_token(self: &Arc<Self>) -> Result<()> {
        let token = self.recovery_token()?;
        self.notify(token_notification(&token, self.ctx.config.token_ttl))
    }

    pub(crate) fn announce_recovery(self: &Arc<Self>) {
        if let Err(e) = self.notify(json!({
            "type": "connection:recovered",
            "timestamp": Utc::now().timestamp_millis(),
        })) {
            warn!("Failed to notify {} of recovery: {}", self.id, e);
        }
        self.publish(HeliosEvent::Reconnected {
            starling: self.id.clone(),
        });
    }

    // Inbound

    /// Process one frame received from the peer.
    pub fn handle_frame(self: &Arc<Self>, frame: Frame) {
        if self.is_closed() {
            debug!("Ignoring frame for closed starling {}", self.id);
            return;
        }

        match decode(&frame) {
            Decoded::Ack(id) => {
                if self.delivery.acknowledge(&id) {
                    self.publish(HeliosEvent::MessageAcked {
                        starling: self.id.clone(),
                        message_id: id,
                    });
                }
            }
            Decoded::MalformedAck(reason) => {
                warn!("Malformed ack from {}: {}", self.id, reason);
            }
            Decoded::Invalid(issues) => {
                warn!(
                    "Invalid message from {} ({} issue(s))",
                    self.id,
                    issues.len()
                );
                let details = serde_json::to_value(&issues).unwrap_or(Value::Null);
                let error = ErrorBody::new(
                    "INVALID_MESSAGE_FORMAT",
                    "Message format does not match the Helios-Starling protocol",
                )
                .with_details(details);
                if let Err(e) = self.emit(Message::error(error)) {
                    warn!("Failed to report invalid message to {}: {}", self.id, e);
                }
            }
            Decoded::Message(message) => {
                let message = Arc::new(message);
                if message.envelope().is_some() {
                    self.send_ack(message.id());
                    let id = message.id().to_string();
                    if self.seen.contains_key(&id) {
                        debug!("Duplicate message {} from {}", id, self.id);
                        return;
                    }
                    self.seen.insert(id, message.clone());
                }
                self.dispatch(message);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: Arc<Message>) {
        if message.peer().is_some() && message.kind() != MessageKind::Response {
            if let Some(proxy) = self.ctx.proxy() {
                let context = ProxyContext::new(self.clone(), message);
                tokio::spawn(async move {
                    if let Err(e) = proxy.handle(context.clone()).await {
                        warn!("Proxy handler failed: {}", e);
                        context.fail(&e);
                    }
                });
                return;
            }
        }

        let starling = self.id.clone();
        match message.body() {
            Some(Body::Request { .. }) => self.handle_request(message),
            Some(Body::Response { request_id, .. }) => {
                if !self.requests.resolve(&message) {
                    debug!("{} answered unknown request {}", self.id, request_id);
                }
            }
            Some(Body::Notification { notification }) => {
                self.publish(HeliosEvent::NotificationReceived {
                    starling,
                    notification: notification.clone(),
                });
            }
            Some(Body::Error { error }) => {
                warn!("{} reported {}: {}", self.id, error.code, error.message);
                self.publish(HeliosEvent::ErrorReceived {
                    starling,
                    error: error.clone(),
                });
            }
            Some(Body::StreamInit {
                stream_id,
                stream_type,
                ..
            }) => {
                self.publish(HeliosEvent::StreamOpened {
                    starling,
                    stream_id: stream_id.clone(),
                    stream_type: *stream_type,
                });
            }
            Some(Body::StreamClose { stream_id, reason }) => {
                self.publish(HeliosEvent::StreamClosed {
                    starling,
                    stream_id: stream_id.clone(),
                    reason: reason.clone(),
                });
            }
            None => {
                self.publish(HeliosEvent::MessageReceived { starling, message });
            }
        }
    }

    fn handle_request(self: &Arc<Self>, message: Arc<Message>) {
        let method = message.method().unwrap_or_default().to_string();
        let request_id = message.request_id().unwrap_or_default().to_string();
        debug!("{} -> {} ({})", self.id, method, request_id);
        self.publish(HeliosEvent::RequestReceived {
            starling: self.id.clone(),
            method: method.clone(),
            request_id: request_id.clone(),
        });

        let Some(handler) = self.ctx.methods.get(&method) else {
            warn!("Method not found: {}", method);
            let error = ErrorBody::new("METHOD_NOT_FOUND", format!("Method {} not found", method))
                .with_details(json!({ "method": method }));
            if let Err(e) = self.emit(Message::failure(request_id, error)) {
                warn!("Failed to answer {}: {}", self.id, e);
            }
            return;
        };

        let context = RequestContext::new(self.clone(), &message);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.methods.execute(&handler, context).await {
                debug!("{}", e);
            }
        });
    }

    // Link management

    /// Bind a transport, flushing buffered frames before anything else.
    ///
    /// Returns false when the starling is already closed.
    pub(crate) fn link(self: &Arc<Self>, transport: Arc<dyn Transport>) -> bool {
        let handle = transport.handle();
        let report = {
            let mut buffer = lock(&self.buffer);
            let previous = {
                let mut link = lock(&self.link);
                if self.is_closed() {
                    return false;
                }
                if let Some(timer) = link.grace_timer.take() {
                    timer.abort();
                }
                link.status = LinkStatus::Live;
                link.disconnected_at = None;
                link.epoch += 1;
                link.transport.replace(transport.clone())
            };
            if let Some(previous) = previous {
                if previous.handle() != handle {
                    previous.close(4000, "Superseded by a new connection");
                }
            }
            let report = buffer.flush(|frame| transport.send(frame.clone()).is_ok());
            if report.remaining > 0 {
                self.drop_failed_transport(handle, "flush interrupted");
            }
            report
        };

        info!(
            "Starling {} bound to {} ({} buffered frame(s) flushed)",
            self.id, handle, report.sent
        );
        if report.remaining > 0 {
            warn!(
                "{} frame(s) still buffered for {} after flush",
                report.remaining, self.id
            );
        }
        for id in &report.tracked {
            self.start_tracking(id);
        }
        self.kick_queue();
        true
    }

    /// Detach the transport `handle` and start the grace period.
    ///
    /// Stale handles (already replaced by a newer transport) are ignored.
    pub(crate) fn unlink(&self, handle: TransportHandle) -> bool {
        self.detach(handle).is_some()
    }

    /// Give up on a transport that refused a frame. The peer recovers through
    /// the usual reconnection path.
    fn drop_failed_transport(&self, handle: TransportHandle, error: &str) {
        if let Some(transport) = self.detach(handle) {
            warn!("Send to {} failed on {}, detaching: {}", self.id, handle, error);
            transport.close(1011, "Send failed");
        }
    }

    fn detach(&self, handle: TransportHandle) -> Option<Arc<dyn Transport>> {
        let ttl = self.ctx.config.disconnection_ttl;
        let transport = {
            let mut link = lock(&self.link);
            let bound = link.transport.as_ref().map(|t| t.handle());
            if link.status != LinkStatus::Live || bound != Some(handle) {
                return None;
            }
            let transport = link.transport.take();
            link.status = LinkStatus::Disconnected;
            link.disconnected_at = Some(Utc::now());
            link.epoch += 1;

            let epoch = link.epoch;
            let weak = self.this.clone();
            link.grace_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(starling) = weak.upgrade() {
                    starling.expire(epoch);
                }
            }));
            transport
        };

        info!("Starling {} disconnected, keeping it for {:?}", self.id, ttl);
        self.publish(HeliosEvent::Disconnected {
            starling: self.id.clone(),
            ttl,
        });
        transport
    }

    fn expire(self: &Arc<Self>, epoch: u64) {
        if self.begin_close(Some(epoch)) {
            info!("Starling {} was not recovered in time", self.id);
            self.finish_close();
        }
    }

    /// Close for good. Idempotent.
    pub fn close(self: &Arc<Self>) {
        if self.begin_close(None) {
            self.finish_close();
        }
    }

    fn begin_close(&self, expected_epoch: Option<u64>) -> bool {
        let (transport, timer) = {
            let mut link = lock(&self.link);
            if self.is_closed() {
                return false;
            }
            if let Some(epoch) = expected_epoch {
                if link.status != LinkStatus::Disconnected || link.epoch != epoch {
                    return false;
                }
            }
            self.closed.store(true, Ordering::SeqCst);
            link.status = LinkStatus::Closed;
            (link.transport.take(), link.grace_timer.take())
        };

        // The expiring timer is the caller; leave it be
        if let (Some(timer), None) = (timer, expected_epoch) {
            timer.abort();
        }
        if let Some(transport) = transport {
            transport.close(1000, "Starling closed");
        }
        true
    }

    fn finish_close(self: &Arc<Self>) {
        let cancelled = self.requests.cancel_all("Connection closed");
        let queued = self.queue.clear("Queue cleared");
        let buffered = lock(&self.buffer).clear();
        let unacked = self.delivery.clear();
        self.seen.invalidate_all();
        self.ctx.starlings.remove(self);

        info!(
            "Starling {} closed ({} pending, {} queued, {} buffered, {} unacked)",
            self.id, cancelled, queued, buffered, unacked
        );
        self.publish(HeliosEvent::Closed {
            starling: self.id.clone(),
        });
    }
}

impl DeliverySink for Starling {
    fn send_tracked(&self, id: &str, frame: Frame) -> bool {
        self.send_frame(frame, Some(id)) == SendOutcome::Sent
    }

    fn emitted(&self, id: &str, attempt: u32) {
        self.publish(HeliosEvent::MessageEmitted {
            starling: self.id.clone(),
            message_id: id.to_string(),
            attempt,
        });
    }
}

#[async_trait]
impl RequestExecutor for Arc<Starling> {
    fn is_live(&self) -> bool {
        Starling::is_live(self)
    }

    async fn execute(&self, request: &OutgoingRequest) -> RequestResult {
        self.execute_request(request).await
    }
}

impl std::fmt::Debug for Starling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Starling")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
