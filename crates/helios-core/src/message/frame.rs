//! Raw transport frames and the binary acknowledgment control frame.
//!
//! ```text
//! [0x01][u8: len][UTF-8 message id of len bytes]
//! ```

use crate::config::ProtocolConfig;
use crate::error::{HeliosError, Result};

/// A single frame as exchanged with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this frame starts with the acknowledgment marker.
    pub fn is_ack(&self) -> bool {
        matches!(self, Frame::Binary(b) if b.first() == Some(&ProtocolConfig::ACK_MARKER))
    }
}

/// Build the acknowledgment frame for a message id.
pub fn encode_ack(id: &str) -> Result<Frame> {
    let id_bytes = id.as_bytes();
    let len = u8::try_from(id_bytes.len()).map_err(|_| HeliosError::ProtocolFormat {
        message: format!(
            "message id of {} bytes cannot be acknowledged",
            id_bytes.len()
        ),
        details: None,
    })?;

    let mut buf = Vec::with_capacity(2 + id_bytes.len());
    buf.push(ProtocolConfig::ACK_MARKER);
    buf.push(len);
    buf.extend_from_slice(id_bytes);
    Ok(Frame::Binary(buf))
}

/// Extract the acknowledged message id from an ack frame's bytes.
pub fn decode_ack(bytes: &[u8]) -> Result<String> {
    let malformed = |message: &str| HeliosError::ProtocolFormat {
        message: message.to_string(),
        details: None,
    };

    if bytes.first() != Some(&ProtocolConfig::ACK_MARKER) {
        return Err(malformed("missing ack marker"));
    }
    let len = *bytes.get(1).ok_or_else(|| malformed("ack frame truncated"))? as usize;
    let id_bytes = bytes
        .get(2..2 + len)
        .ok_or_else(|| malformed("ack frame shorter than its declared length"))?;
    let id = std::str::from_utf8(id_bytes).map_err(|_| malformed("ack id is not UTF-8"))?;
    if id.is_empty() {
        return Err(malformed("ack id is empty"));
    }
    Ok(id.to_string())
}
