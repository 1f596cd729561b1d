//! Typed wire envelope for protocol messages.
//!
//! ```text
//! {protocol?, version?, timestamp, id?, peer?, type, ...type-specific fields}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A protocol message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Milliseconds since the Unix epoch. Filled with the receive time when
    /// a peer omits it.
    #[serde(default = "super::now_millis")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Identity of the starling this message is addressed to, for proxying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(flatten)]
    pub body: Body,
}

/// Type-specific part of an envelope, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Body {
    #[serde(rename = "request", rename_all = "camelCase")]
    Request {
        request_id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },

    #[serde(rename = "response", rename_all = "camelCase")]
    Response {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    #[serde(rename = "notification")]
    Notification {
        #[serde(default)]
        notification: Value,
    },

    #[serde(rename = "error")]
    Error { error: ErrorBody },

    #[serde(rename = "stream:init", rename_all = "camelCase")]
    StreamInit {
        stream_id: String,
        stream_type: StreamType,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    #[serde(rename = "stream:close", rename_all = "camelCase")]
    StreamClose {
        stream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Body {
    /// The `type` tag of this body.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Request { .. } => "request",
            Body::Response { .. } => "response",
            Body::Notification { .. } => "notification",
            Body::Error { .. } => "error",
            Body::StreamInit { .. } => "stream:init",
            Body::StreamClose { .. } => "stream:close",
        }
    }
}

/// `{code, message, details?}` carried by failed responses and error frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Kinds of stream a peer may announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Audio,
    Video,
    File,
    Binary,
    Custom,
    DataChannel,
    MediaTrack,
    Composite,
}

impl StreamType {
    pub const ALL: [&'static str; 8] = [
        "audio",
        "video",
        "file",
        "binary",
        "custom",
        "data_channel",
        "media_track",
        "composite",
    ];
}
