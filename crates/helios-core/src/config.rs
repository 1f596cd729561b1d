//! Centralized configuration for the Helios engine.
//!
//! Wire-level constants live on [`ProtocolConfig`]; per-server tunables live
//! on [`HeliosConfig`], which is set through the builder.

use std::time::Duration;

/// Protocol constants shared by every connection.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const PROTOCOL_NAME: &'static str = "helios-starling";
    pub const PROTOCOL_VERSION: &'static str = "1.0.0";

    /// First byte of a binary acknowledgment frame.
    pub const ACK_MARKER: u8 = 0x01;

    /// Method names must be at least this long.
    pub const MIN_METHOD_NAME_LEN: usize = 3;

    /// Namespaces that application methods may not claim.
    pub const RESERVED_NAMESPACES: &'static [&'static str] = &[
        "system",
        "internal",
        "stream",
        "helios",
        "starlings",
        "starling",
    ];

    /// Built-in method returning a fresh recovery token.
    pub const TOKEN_METHOD: &'static str = "starling:getToken";
}

/// Runtime settings for a Helios server.
#[derive(Debug, Clone)]
pub struct HeliosConfig {
    /// How long a disconnected starling is kept for recovery.
    pub disconnection_ttl: Duration,
    /// Default deadline for requests issued by the server.
    pub request_timeout: Duration,
    /// Default budget for method handlers.
    pub method_timeout: Duration,
    /// Per-attempt acknowledgment deadline.
    pub ack_timeout: Duration,
    /// Send attempts per outgoing message before reporting failure.
    pub delivery_attempts: u32,
    /// Raw frames kept while a starling is offline.
    pub offline_buffer_capacity: usize,
    /// Delay before each retry of a queued request.
    pub request_retry_delays: Vec<Duration>,
    /// Lifetime of recovery tokens.
    pub token_ttl: Duration,
    /// Incoming message ids remembered for duplicate suppression.
    pub seen_capacity: u64,
    /// Hex-encoded token signing key. A random key is generated when unset.
    pub secret: Option<String>,
}

impl Default for HeliosConfig {
    fn default() -> Self {
        Self {
            disconnection_ttl: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(30),
            method_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            delivery_attempts: 5,
            offline_buffer_capacity: 1000,
            request_retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            token_ttl: Duration::from_secs(3600),
            seen_capacity: 1024,
            secret: None,
        }
    }
}
