//! Per-request handle given to method handlers.

use crate::error::{HeliosError, Result};
use crate::message::{ErrorBody, Message};
use crate::starling::Starling;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One incoming request being handled.
///
/// Cloning is cheap and clones share the terminal state: exactly one of
/// [`success`](Self::success) or [`error`](Self::error) goes out, any
/// further attempt fails with `AlreadyFinished`.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

struct Inner {
    starling: Arc<Starling>,
    request_id: String,
    method: String,
    payload: Value,
    timestamp: u64,
    finished: AtomicBool,
}

impl RequestContext {
    pub(crate) fn new(starling: Arc<Starling>, request: &Message) -> Self {
        Self {
            inner: Arc::new(Inner {
                starling,
                request_id: request.request_id().unwrap_or_default().to_string(),
                method: request.method().unwrap_or_default().to_string(),
                payload: request.payload(),
                timestamp: request.timestamp().unwrap_or_default(),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn starling(&self) -> &Arc<Starling> {
        &self.inner.starling
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// Sender timestamp in milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.inner.timestamp
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    fn finish(&self) -> Result<()> {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return Err(HeliosError::AlreadyFinished {
                request_id: self.inner.request_id.clone(),
            });
        }
        Ok(())
    }

    /// Send the successful response.
    pub fn success(&self, data: Value) -> Result<()> {
        self.finish()?;
        self.inner
            .starling
            .emit(Message::success(&self.inner.request_id, data))?;
        Ok(())
    }

    /// Send an error response.
    pub fn error(&self, code: impl Into<String>, message: impl Into<String>) -> Result<()> {
        self.respond_error(ErrorBody::new(code, message))
    }

    pub fn error_with_details(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Result<()> {
        self.respond_error(ErrorBody::new(code, message).with_details(details))
    }

    fn respond_error(&self, error: ErrorBody) -> Result<()> {
        self.finish()?;
        self.inner
            .starling
            .emit(Message::failure(&self.inner.request_id, error))?;
        Ok(())
    }

    /// Push an intermediate notification tied to this request.
    ///
    /// Only allowed before the terminal response.
    pub fn notification(&self, data: Value) -> Result<()> {
        if self.is_finished() {
            return Err(HeliosError::AlreadyFinished {
                request_id: self.inner.request_id.clone(),
            });
        }
        self.inner.starling.emit(Message::notification(json!({
            "requestId": self.inner.request_id,
            "data": data,
        })))?;
        Ok(())
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("starling", &self.inner.starling.id())
            .field("request_id", &self.inner.request_id)
            .field("method", &self.inner.method)
            .field("finished", &self.is_finished())
            .finish()
    }
}
