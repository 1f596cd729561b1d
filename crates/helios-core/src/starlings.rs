//! Connection registry.
//!
//! Maps live transports and identities to starlings. Both indices sit under
//! one lock so they never disagree.

use crate::error::{HeliosError, Result};
use crate::events::HeliosEvent;
use crate::helios::HeliosContext;
use crate::locks::lock;
use crate::recovery::restore_from_token;
use crate::starling::Starling;
use crate::transport::{Handshake, Transport, TransportHandle};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Default)]
struct Indices {
    by_transport: HashMap<TransportHandle, Arc<Starling>>,
    by_id: HashMap<String, Arc<Starling>>,
}

/// Every starling known to a server.
#[derive(Default)]
pub struct Starlings {
    inner: Mutex<Indices>,
}

impl Starlings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new transport.
    ///
    /// A valid recovery token rebinds the starling it names, or restores its
    /// saved state on a fresh starling when that one is gone. Anything else
    /// (no token, bad signature, expired) yields a fresh starling and leaves
    /// existing ones untouched.
    pub(crate) fn connect(
        &self,
        ctx: &Arc<HeliosContext>,
        transport: Arc<dyn Transport>,
        handshake: &Handshake,
    ) -> Arc<Starling> {
        let Some(token) = handshake.recover.as_deref() else {
            return self.create(ctx, transport);
        };

        let claims = match restore_from_token(token, ctx.signer.as_ref()) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("Recovery rejected, starting a new session: {}", e);
                return self.create(ctx, transport);
            }
        };

        if let Some(existing) = self.lookup_by_id(&claims.identity) {
            let restored = ctx.states.apply_state(&existing, &claims.state).restored;
            if self.rebind(&existing, transport.clone()) {
                info!("Starling {} recovered", existing.id());
                existing.announce_recovery();
                Self::report_restored(ctx, &existing, restored);
                return existing;
            }
            warn!(
                "Starling {} closed during recovery, starting a new session",
                existing.id()
            );
        }

        let starling = self.create(ctx, transport);
        let restored = ctx.states.apply_state(&starling, &claims.state).restored;
        Self::report_restored(ctx, &starling, restored);
        starling
    }

    fn create(&self, ctx: &Arc<HeliosContext>, transport: Arc<dyn Transport>) -> Arc<Starling> {
        let handle = transport.handle();
        let starling = Starling::new(ctx.clone(), transport);
        {
            let mut inner = lock(&self.inner);
            inner.by_transport.insert(handle, starling.clone());
            inner
                .by_id
                .insert(starling.id().to_string(), starling.clone());
        }
        info!("Starling {} connected on {}", starling.id(), handle);
        ctx.events.publish(HeliosEvent::Connected {
            starling: starling.id().to_string(),
        });
        starling
    }

    /// Move `starling` onto `transport`, dropping its previous binding.
    fn rebind(&self, starling: &Arc<Starling>, transport: Arc<dyn Transport>) -> bool {
        let handle = transport.handle();
        let mut inner = lock(&self.inner);
        if !inner.by_id.contains_key(starling.id()) || !starling.link(transport) {
            return false;
        }
        inner
            .by_transport
            .retain(|_, bound| bound.id() != starling.id());
        inner.by_transport.insert(handle, starling.clone());
        true
    }

    fn report_restored(ctx: &HeliosContext, starling: &Starling, namespaces: Vec<String>) {
        if namespaces.is_empty() {
            return;
        }
        ctx.events.publish(HeliosEvent::StateRestored {
            starling: starling.id().to_string(),
            namespaces,
        });
    }

    /// Starling bound to `handle`.
    pub fn lookup(&self, handle: TransportHandle) -> Result<Arc<Starling>> {
        lock(&self.inner)
            .by_transport
            .get(&handle)
            .cloned()
            .ok_or_else(|| HeliosError::NotFound(handle.to_string()))
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Starling>> {
        lock(&self.inner).by_id.get(id).cloned()
    }

    /// Forget `handle` and return the starling it was bound to.
    pub(crate) fn release(&self, handle: TransportHandle) -> Option<Arc<Starling>> {
        lock(&self.inner).by_transport.remove(&handle)
    }

    /// Drop every transport binding of `starling`, keeping its identity.
    pub fn unbind_transport(&self, starling: &Starling) -> usize {
        let mut inner = lock(&self.inner);
        let before = inner.by_transport.len();
        inner
            .by_transport
            .retain(|_, bound| bound.id() != starling.id());
        before - inner.by_transport.len()
    }

    /// Remove `starling` from both indices.
    pub fn remove(&self, starling: &Starling) -> bool {
        let mut inner = lock(&self.inner);
        inner
            .by_transport
            .retain(|_, bound| bound.id() != starling.id());
        inner.by_id.remove(starling.id()).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).by_id.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.inner).by_id.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<Starling>> {
        lock(&self.inner).by_id.values().cloned().collect()
    }

    /// Send a notification to every live starling; returns how many got it.
    pub fn broadcast(&self, notification: Value) -> usize {
        self.all()
            .into_iter()
            .filter(|s| s.is_live())
            .filter(|s| s.notify(notification.clone()).is_ok())
            .count()
    }

    /// Per-starling summary for diagnostics.
    pub fn describe(&self) -> Vec<Map<String, Value>> {
        self.all()
            .into_iter()
            .map(|s| {
                let mut entry = Map::new();
                entry.insert("id".into(), Value::from(s.id()));
                entry.insert("status".into(), Value::from(format!("{:?}", s.status())));
                entry.insert(
                    "disconnectedAt".into(),
                    s.disconnected_at()
                        .map(|t| Value::from(t.to_rfc3339()))
                        .unwrap_or(Value::Null),
                );
                entry.insert("inFlight".into(), Value::from(s.delivery().len()));
                entry.insert("pendingRequests".into(), Value::from(s.requests().len()));
                entry
            })
            .collect()
    }
}
