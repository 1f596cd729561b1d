//! Message model and wire codec.
//!
//! A [`Message`] is an immutable, direction-tagged unit of traffic. Protocol
//! messages carry a typed [`Envelope`]; anything else that arrives on the
//! socket (plain text, foreign JSON, binary) is kept as opaque content so the
//! hub can tolerate non-protocol traffic on the same connection.
//!
//! # Decoding
//!
//! - Binary frames starting with `0x01` are acknowledgments.
//! - Text that is not JSON, or JSON that does not have the base envelope
//!   shape, becomes an opaque message.
//! - JSON with the base shape but an invalid per-type shape is reported as
//!   [`Decoded::Invalid`] so the peer can be sent an error frame.

pub mod envelope;
pub mod frame;
pub mod schema;

pub use envelope::{Body, Envelope, ErrorBody, StreamType};
pub use frame::{decode_ack, encode_ack, Frame};
pub use schema::SchemaIssue;

use crate::config::ProtocolConfig;
use crate::error::Result;
use serde_json::{json, Map, Value};

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Generate a fresh message id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Plain,
    Request,
    Response,
}

/// What a message carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Protocol(Envelope),
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

/// A single message, incoming or outgoing.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    direction: Direction,
    content: Content,
}

impl Message {
    /// Create an outgoing protocol message with a fresh id and timestamp.
    pub fn outgoing(body: Body) -> Self {
        Self::outgoing_with_id(new_id(), body)
    }

    fn outgoing_with_id(id: String, body: Body) -> Self {
        Self {
            content: Content::Protocol(Envelope {
                protocol: Some(ProtocolConfig::PROTOCOL_NAME.to_string()),
                version: Some(ProtocolConfig::PROTOCOL_VERSION.to_string()),
                timestamp: now_millis(),
                id: Some(id.clone()),
                peer: None,
                body,
            }),
            id,
            direction: Direction::Outgoing,
        }
    }

    /// Create an outgoing request. Its id doubles as the `requestId`.
    pub fn request(method: impl Into<String>, payload: Value) -> Self {
        let id = new_id();
        Self::outgoing_with_id(
            id.clone(),
            Body::Request {
                request_id: id,
                method: method.into(),
                payload,
            },
        )
    }

    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self::outgoing(Body::Response {
            request_id: request_id.into(),
            success: true,
            data,
            error: None,
        })
    }

    pub fn failure(request_id: impl Into<String>, error: ErrorBody) -> Self {
        Self::outgoing(Body::Response {
            request_id: request_id.into(),
            success: false,
            data: Value::Null,
            error: Some(error),
        })
    }

    pub fn notification(notification: Value) -> Self {
        Self::outgoing(Body::Notification { notification })
    }

    pub fn error(error: ErrorBody) -> Self {
        Self::outgoing(Body::Error { error })
    }

    /// Address an outgoing message to another starling.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        if let Content::Protocol(env) = &mut self.content {
            env.peer = Some(peer.into());
        }
        self
    }

    /// Wrap an envelope received from a peer.
    pub fn incoming(envelope: Envelope) -> Self {
        let id = match (&envelope.id, &envelope.body) {
            (Some(id), _) => id.clone(),
            (None, Body::Request { request_id, .. }) => request_id.clone(),
            (None, _) => new_id(),
        };
        Self {
            id,
            direction: Direction::Incoming,
            content: Content::Protocol(envelope),
        }
    }

    /// Wrap non-protocol traffic received from a peer.
    pub fn opaque(content: Content) -> Self {
        Self {
            id: new_id(),
            direction: Direction::Incoming,
            content,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match &self.content {
            Content::Protocol(env) => Some(env),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Body> {
        self.envelope().map(|env| &env.body)
    }

    pub fn kind(&self) -> MessageKind {
        match self.body() {
            Some(Body::Request { .. }) => MessageKind::Request,
            Some(Body::Response { .. }) => MessageKind::Response,
            _ => MessageKind::Plain,
        }
    }

    /// The `requestId` of a request or response.
    pub fn request_id(&self) -> Option<&str> {
        match self.body() {
            Some(Body::Request { request_id, .. }) | Some(Body::Response { request_id, .. }) => {
                Some(request_id)
            }
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self.body() {
            Some(Body::Request { method, .. }) => Some(method),
            _ => None,
        }
    }

    pub fn peer(&self) -> Option<&str> {
        self.envelope().and_then(|env| env.peer.as_deref())
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.envelope().map(|env| env.timestamp)
    }

    /// Envelope headers: every field except the payload, in wire order.
    pub fn headers(&self) -> Map<String, Value> {
        let mut headers = Map::new();
        let Some(env) = self.envelope() else {
            let kind = match &self.content {
                Content::Text(_) => "text",
                Content::Json(_) => "json",
                _ => "binary",
            };
            headers.insert("type".into(), json!(kind));
            return headers;
        };

        if let Some(protocol) = &env.protocol {
            headers.insert("protocol".into(), json!(protocol));
        }
        if let Some(version) = &env.version {
            headers.insert("version".into(), json!(version));
        }
        headers.insert("timestamp".into(), json!(env.timestamp));
        headers.insert("type".into(), json!(env.body.type_name()));
        headers.insert("id".into(), json!(self.id));
        if let Some(peer) = &env.peer {
            headers.insert("peer".into(), json!(peer));
        }

        match &env.body {
            Body::Request {
                request_id, method, ..
            } => {
                headers.insert("requestId".into(), json!(request_id));
                headers.insert("method".into(), json!(method));
            }
            Body::Response {
                request_id,
                success,
                ..
            } => {
                headers.insert("requestId".into(), json!(request_id));
                headers.insert("success".into(), json!(success));
            }
            Body::StreamInit {
                stream_id,
                stream_type,
                ..
            } => {
                headers.insert("streamId".into(), json!(stream_id));
                headers.insert("streamType".into(), json!(stream_type));
            }
            Body::StreamClose { stream_id, .. } => {
                headers.insert("streamId".into(), json!(stream_id));
            }
            Body::Notification { .. } | Body::Error { .. } => {}
        }
        headers
    }

    /// The application payload of this message.
    ///
    /// Failed responses yield their error object. Binary content has no JSON
    /// payload; use [`Message::content`].
    pub fn payload(&self) -> Value {
        match &self.content {
            Content::Protocol(env) => match &env.body {
                Body::Request { payload, .. } => payload.clone(),
                Body::Response {
                    success: true,
                    data,
                    ..
                } => data.clone(),
                Body::Response { data, error, .. } => match error {
                    Some(error) => serde_json::to_value(error).unwrap_or(Value::Null),
                    None => data.clone(),
                },
                Body::Notification { notification } => notification.clone(),
                Body::Error { error } => serde_json::to_value(error).unwrap_or(Value::Null),
                Body::StreamInit { metadata, .. } => Value::Object(metadata.clone()),
                Body::StreamClose { reason, .. } => json!(reason),
            },
            Content::Text(text) => json!(text),
            Content::Json(value) => value.clone(),
            Content::Binary(_) => Value::Null,
        }
    }
}

/// Result of decoding one raw frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A protocol or opaque message.
    Message(Message),
    /// An acknowledgment for the given outgoing message id.
    Ack(String),
    /// A protocol frame whose per-type shape is invalid.
    Invalid(Vec<SchemaIssue>),
    /// An ack frame that could not be parsed.
    MalformedAck(String),
}

/// Decode a raw frame received from a peer.
pub fn decode(frame: &Frame) -> Decoded {
    match frame {
        Frame::Binary(bytes) if frame.is_ack() => match decode_ack(bytes) {
            Ok(id) => Decoded::Ack(id),
            Err(e) => Decoded::MalformedAck(e.to_string()),
        },
        Frame::Binary(bytes) => Decoded::Message(Message::opaque(Content::Binary(bytes.clone()))),
        Frame::Text(text) => {
            let value: Value = match serde_json::from_str(text) {
                Ok(v) => v,
                Err(_) => return Decoded::Message(Message::opaque(Content::Text(text.clone()))),
            };

            if schema::validate_base(&value).is_err() {
                return Decoded::Message(Message::opaque(Content::Json(value)));
            }
            if let Err(issues) = schema::validate_envelope(&value) {
                return Decoded::Invalid(issues);
            }

            match serde_json::from_value::<Envelope>(value) {
                Ok(envelope) => Decoded::Message(Message::incoming(envelope)),
                Err(e) => Decoded::Invalid(vec![SchemaIssue {
                    path: String::new(),
                    message: e.to_string(),
                }]),
            }
        }
    }
}

/// Encode a message for the transport.
pub fn encode(message: &Message) -> Result<Frame> {
    Ok(match &message.content {
        Content::Protocol(env) => Frame::Text(serde_json::to_string(env)?),
        Content::Text(text) => Frame::Text(text.clone()),
        Content::Json(value) => Frame::Text(serde_json::to_string(value)?),
        Content::Binary(bytes) => Frame::Binary(bytes.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode a frame produced by `encode`, as the peer would see it.
    fn roundtrip(message: &Message) -> Message {
        match decode(&encode(message).unwrap()) {
            Decoded::Message(m) => m,
            other => panic!("Expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_every_protocol_type() {
        let messages = vec![
            Message::request("user:create", json!({"name": "Ada"})),
            Message::success("r1", json!({"echo": "Hello world"})),
            Message::failure("r1", ErrorBody::new("METHOD_NOT_FOUND", "Method not found")),
            Message::notification(json!({"type": "connection:recovered"})),
            Message::error(
                ErrorBody::new("INVALID_MESSAGE_FORMAT", "bad").with_details(json!([{"path": "x"}])),
            ),
            Message::outgoing(Body::StreamInit {
                stream_id: new_id(),
                stream_type: StreamType::File,
                metadata: Map::new(),
            }),
            Message::outgoing(Body::StreamClose {
                stream_id: new_id(),
                reason: Some("done".into()),
            }),
            Message::notification(json!(1)).with_peer("starling-b"),
        ];

        for message in messages {
            let decoded = roundtrip(&message);
            assert_eq!(decoded.id(), message.id());
            assert_eq!(decoded.envelope(), message.envelope());
            assert_eq!(decoded.kind(), message.kind());
            assert_eq!(decoded.direction(), Direction::Incoming);
        }
    }

    #[test]
    fn test_request_id_is_message_id() {
        let request = Message::request("echo", Value::Null);
        assert_eq!(request.request_id(), Some(request.id()));
        assert_eq!(request.kind(), MessageKind::Request);
    }

    #[test]
    fn test_incoming_request_without_id_uses_request_id() {
        let frame = Frame::Text(
            r#"{"type":"request","requestId":"r1","method":"echo","payload":{"x":1}}"#.into(),
        );
        let Decoded::Message(message) = decode(&frame) else {
            panic!("Expected a message");
        };

        assert_eq!(message.id(), "r1");
        assert_eq!(message.method(), Some("echo"));
        assert_eq!(message.payload(), json!({"x": 1}));
    }

    #[test]
    fn test_plain_text_is_opaque() {
        let Decoded::Message(message) = decode(&Frame::Text("hello there".into())) else {
            panic!("Expected a message");
        };
        assert_eq!(message.content(), &Content::Text("hello there".into()));
        assert_eq!(message.kind(), MessageKind::Plain);
        assert_eq!(message.headers()["type"], "text");
    }

    #[test]
    fn test_foreign_json_is_opaque() {
        let Decoded::Message(message) = decode(&Frame::Text(r#"{"chat":"hi"}"#.into())) else {
            panic!("Expected a message");
        };
        assert_eq!(message.content(), &Content::Json(json!({"chat": "hi"})));
    }

    #[test]
    fn test_binary_is_opaque_unless_ack() {
        assert!(matches!(
            decode(&Frame::Binary(vec![0x02, 0x03])),
            Decoded::Message(_)
        ));
        assert_eq!(
            decode(&encode_ack("m1").unwrap()),
            Decoded::Ack("m1".into())
        );
        assert!(matches!(
            decode(&Frame::Binary(vec![0x01, 9])),
            Decoded::MalformedAck(_)
        ));
    }

    #[test]
    fn test_base_match_with_bad_shape_is_invalid() {
        let frame = Frame::Text(r#"{"timestamp":1,"type":"request","method":"echo"}"#.into());
        match decode(&frame) {
            Decoded::Invalid(issues) => assert_eq!(issues[0].path, "requestId"),
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_headers_are_ordered() {
        let message = Message::request("echo", Value::Null);
        let keys: Vec<_> = message.headers().keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["protocol", "version", "timestamp", "type", "id", "requestId", "method"]
        );
    }

    #[test]
    fn test_failed_response_payload_is_error() {
        let message = Message::failure("r1", ErrorBody::new("E", "boom"));
        assert_eq!(message.payload()["code"], "E");
    }
}
