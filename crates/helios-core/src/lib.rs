//! Helios Core - per-connection protocol engine for the Helios/Starling RPC hub.
//!
//! Remote peers ("starlings") hold persistent full-duplex connections to a
//! hub. This crate implements everything between the socket and the
//! application: framing, at-least-once delivery with acknowledgments,
//! request/response correlation, offline buffering, token-based session
//! recovery, method dispatch and peer-to-peer proxying.
//!
//! It owns no sockets. A transport adapter implements [`Transport`] and
//! drives [`Helios`] through its `on_open`, `on_message` and `on_close`
//! callbacks; see the `helios-server` crate for the WebSocket adapter.
//!
//! # Example
//!
//! ```rust,ignore
//! use helios_core::{Helios, RequestContext};
//!
//! let helios = Helios::new()?;
//! helios.method("echo", |ctx: RequestContext| async move {
//!     let payload = ctx.payload().clone();
//!     ctx.success(payload)
//! })?;
//! ```

pub mod config;
pub mod context;
pub mod delivery;
pub mod error;
pub mod events;
pub mod helios;
pub mod message;
pub mod methods;
pub mod offline;
pub mod proxy;
pub mod recovery;
pub mod requests;
pub mod starling;
pub mod starlings;
pub mod transport;

mod locks;

// Re-export commonly used types
pub use config::{HeliosConfig, ProtocolConfig};
pub use context::RequestContext;
pub use error::{HeliosError, RequestError, Result, TransportError};
pub use events::{EventBus, HeliosEvent};
pub use helios::{Helios, HeliosBuilder};
pub use message::{Body, Content, Decoded, Envelope, ErrorBody, Frame, Message, MessageKind};
pub use methods::{MethodHandler, MethodOptions};
pub use proxy::{Forwarded, ProxyContext, ProxyHandler};
pub use recovery::{HmacSigner, RecoveryClaims, StateProvider, TokenSigner};
pub use requests::{RequestOptions, RequestResult};
pub use starling::{LinkStatus, SendOutcome, Starling};
pub use starlings::Starlings;
pub use transport::{ChannelTransport, CloseReason, Handshake, Transport, TransportHandle};
