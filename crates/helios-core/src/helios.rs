//! Server facade.
//!
//! [`Helios`] owns everything shared across connections: the method table,
//! the starling registry, state providers, the token signer and the event
//! bus. A transport adapter drives it through the `on_*` callbacks.

use crate::config::{HeliosConfig, ProtocolConfig};
use crate::context::RequestContext;
use crate::error::{HeliosError, Result};
use crate::events::{EventBus, HeliosEvent};
use crate::locks::{read, write};
use crate::message::Frame;
use crate::methods::{MethodHandler, MethodOptions, Methods};
use crate::proxy::ProxyHandler;
use crate::recovery::{HmacSigner, StateProvider, StateProviders, TokenSigner};
use crate::starling::Starling;
use crate::starlings::Starlings;
use crate::transport::{Handshake, Transport, TransportHandle};
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// State shared by every starling of one server.
pub struct HeliosContext {
    pub(crate) config: HeliosConfig,
    pub(crate) events: EventBus,
    pub(crate) methods: Methods,
    pub(crate) starlings: Starlings,
    pub(crate) states: StateProviders,
    pub(crate) signer: Arc<dyn TokenSigner>,
    proxy: RwLock<Option<Arc<dyn ProxyHandler>>>,
}

impl HeliosContext {
    pub(crate) fn proxy(&self) -> Option<Arc<dyn ProxyHandler>> {
        read(&self.proxy).clone()
    }
}

/// Builder for [`Helios`].
#[derive(Default)]
pub struct HeliosBuilder {
    config: HeliosConfig,
    signer: Option<Arc<dyn TokenSigner>>,
}

impl HeliosBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: HeliosConfig) -> Self {
        self.config = config;
        self
    }

    pub fn disconnection_ttl(mut self, ttl: Duration) -> Self {
        self.config.disconnection_ttl = ttl;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn method_timeout(mut self, timeout: Duration) -> Self {
        self.config.method_timeout = timeout;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn delivery_attempts(mut self, attempts: u32) -> Self {
        self.config.delivery_attempts = attempts;
        self
    }

    pub fn offline_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.offline_buffer_capacity = capacity;
        self
    }

    pub fn request_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.config.request_retry_delays = delays;
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.config.token_ttl = ttl;
        self
    }

    /// Hex-encoded signing key, so tokens survive a restart.
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.config.secret = Some(secret.into());
        self
    }

    /// Use a custom token signer; overrides `secret`.
    pub fn signer(mut self, signer: Arc<dyn TokenSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<Helios> {
        let signer: Arc<dyn TokenSigner> = match (self.signer, &self.config.secret) {
            (Some(signer), _) => signer,
            (None, Some(secret)) => Arc::new(HmacSigner::from_hex(secret)?),
            (None, None) => Arc::new(HmacSigner::random()),
        };

        let events = EventBus::new();
        let ctx = Arc::new(HeliosContext {
            methods: Methods::new(self.config.method_timeout, events.clone()),
            starlings: Starlings::new(),
            states: StateProviders::new(),
            signer,
            proxy: RwLock::new(None),
            events,
            config: self.config,
        });

        let helios = Helios { ctx };
        helios.register_builtins()?;
        Ok(helios)
    }
}

/// A Helios server instance.
#[derive(Clone)]
pub struct Helios {
    ctx: Arc<HeliosContext>,
}

impl Helios {
    /// Server with default settings and a random signing key.
    pub fn new() -> Result<Self> {
        HeliosBuilder::new().build()
    }

    pub fn builder() -> HeliosBuilder {
        HeliosBuilder::new()
    }

    fn register_builtins(&self) -> Result<()> {
        let ttl = self.ctx.config.token_ttl;
        self.ctx.methods.register(
            ProtocolConfig::TOKEN_METHOD,
            move |context: RequestContext| async move {
                let token = context.starling().recovery_token().map_err(|e| {
                    HeliosError::handler("TOKEN_GENERATION_ERROR", e.to_string())
                })?;
                context.success(json!({
                    "token": token,
                    "expiresIn": ttl.as_secs(),
                }))
            },
            MethodOptions {
                internal: true,
                ..Default::default()
            },
        )
    }

    pub fn config(&self) -> &HeliosConfig {
        &self.ctx.config
    }

    pub fn methods(&self) -> &Methods {
        &self.ctx.methods
    }

    pub fn starlings(&self) -> &Starlings {
        &self.ctx.starlings
    }

    pub fn state_providers(&self) -> &StateProviders {
        &self.ctx.states
    }

    /// Register a method with default options.
    pub fn method(&self, name: &str, handler: impl MethodHandler) -> Result<()> {
        self.ctx
            .methods
            .register(name, handler, MethodOptions::default())
    }

    pub fn register_method(
        &self,
        name: &str,
        handler: impl MethodHandler,
        options: MethodOptions,
    ) -> Result<()> {
        self.ctx.methods.register(name, handler, options)
    }

    pub fn register_state_provider(
        &self,
        namespace: &str,
        provider: impl StateProvider + 'static,
    ) -> Result<()> {
        self.ctx.states.register(namespace, Arc::new(provider))
    }

    /// Route peer-addressed messages through `handler`.
    pub fn use_proxy(&self, handler: impl ProxyHandler) {
        *write(&self.ctx.proxy) = Some(Arc::new(handler));
        info!("Proxy handler installed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeliosEvent> {
        self.ctx.events.subscribe()
    }

    // Transport callbacks

    /// A transport connected.
    pub fn on_open(&self, transport: Arc<dyn Transport>, handshake: &Handshake) -> Arc<Starling> {
        debug!(
            "Transport {} opened from {}",
            transport.handle(),
            handshake.remote_addr.as_deref().unwrap_or("unknown")
        );
        self.ctx.starlings.connect(&self.ctx, transport, handshake)
    }

    /// A frame arrived on `handle`.
    pub fn on_message(&self, handle: TransportHandle, frame: Frame) -> Result<()> {
        let starling = self.ctx.starlings.lookup(handle)?;
        starling.handle_frame(frame);
        Ok(())
    }

    /// The transport `handle` closed.
    pub fn on_close(&self, handle: TransportHandle, code: u16, reason: &str) {
        debug!("Transport {} closed ({} {})", handle, code, reason);
        if let Some(starling) = self.ctx.starlings.release(handle) {
            starling.unlink(handle);
        }
    }

    /// The transport `handle` reported an error.
    pub fn on_error(&self, handle: TransportHandle, error: &str) {
        match self.ctx.starlings.lookup(handle) {
            Ok(starling) => warn!("Transport error on {}: {}", starling.id(), error),
            Err(_) => warn!("Transport error on unknown {}: {}", handle, error),
        }
    }

    /// Close every starling.
    pub fn shutdown(&self) {
        let starlings = self.ctx.starlings.all();
        info!("Shutting down {} starling(s)", starlings.len());
        for starling in starlings {
            starling.close();
        }
    }
}

impl std::fmt::Debug for Helios {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Helios")
            .field("starlings", &self.ctx.starlings.len())
            .field("methods", &self.ctx.methods.len())
            .finish()
    }
}
