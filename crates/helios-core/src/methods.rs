//! Server-wide method registry.
//!
//! Methods are registered once on the server and shared by every starling.
//! Names are `namespace:action` style identifiers; a handful of namespaces
//! are reserved for built-ins.

use crate::config::ProtocolConfig;
use crate::context::RequestContext;
use crate::error::{HeliosError, Result};
use crate::events::{EventBus, HeliosEvent};
use crate::locks::{read, write};
use futures::future::BoxFuture;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Handles requests for one method.
///
/// Implemented for any `Fn(RequestContext) -> impl Future<Output = Result<()>>`,
/// so plain async closures can be registered directly.
pub trait MethodHandler: Send + Sync + 'static {
    fn call(&self, context: RequestContext) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> MethodHandler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, context: RequestContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(context))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    /// Handler budget; the server default applies when `None`.
    pub timeout: Option<Duration>,
    /// Built-in method, exempt from name rules.
    pub internal: bool,
}

/// A registered method.
pub struct Method {
    name: String,
    handler: Arc<dyn MethodHandler>,
    options: MethodOptions,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &MethodOptions {
        &self.options
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_:]*$").expect("method name regex must compile"));

/// Check a method name against the registration rules.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| HeliosError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.len() < ProtocolConfig::MIN_METHOD_NAME_LEN {
        return Err(invalid("must be at least 3 characters"));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(invalid(
            "must start with a letter followed by letters, digits, '_' or ':'",
        ));
    }
    // A bare name is its own first segment
    let namespace = name.split(':').next().unwrap_or(name);
    if ProtocolConfig::RESERVED_NAMESPACES.contains(&namespace) {
        return Err(HeliosError::ReservedNamespace {
            namespace: namespace.to_string(),
        });
    }
    Ok(())
}

/// Method table shared by all starlings.
pub struct Methods {
    methods: RwLock<HashMap<String, Arc<Method>>>,
    default_timeout: Duration,
    events: EventBus,
}

impl Methods {
    pub fn new(default_timeout: Duration, events: EventBus) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            default_timeout,
            events,
        }
    }

    pub fn register(
        &self,
        name: &str,
        handler: impl MethodHandler,
        options: MethodOptions,
    ) -> Result<()> {
        if !options.internal {
            validate_name(name)?;
        }

        {
            let mut methods = write(&self.methods);
            if methods.contains_key(name) {
                return Err(HeliosError::DuplicateName {
                    name: name.to_string(),
                });
            }
            methods.insert(
                name.to_string(),
                Arc::new(Method {
                    name: name.to_string(),
                    handler: Arc::new(handler),
                    options,
                }),
            );
        }

        info!("Registered method {}", name);
        self.events.publish(HeliosEvent::MethodAdded {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Method>> {
        read(&self.methods).get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        read(&self.methods).contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = write(&self.methods).remove(name).is_some();
        if removed {
            debug!("Removed method {}", name);
        }
        removed
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.methods).keys().cloned().collect();
        names.sort();
        names
    }

    /// Names under `namespace:`, sorted.
    pub fn by_namespace(&self, namespace: &str) -> Vec<String> {
        let prefix = format!("{}:", namespace);
        let mut names: Vec<String> = read(&self.methods)
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        read(&self.methods).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.methods).is_empty()
    }

    /// Run a handler within its time budget.
    ///
    /// A handler that errors or panics before responding gets an error
    /// response on its behalf. On timeout the handler keeps running
    /// detached; its late response is still delivered if it sends one.
    pub async fn execute(&self, method: &Method, context: RequestContext) -> Result<()> {
        let budget = method.options.timeout.unwrap_or(self.default_timeout);
        let handler = method.handler.clone();
        let task_context = context.clone();
        let mut task = tokio::spawn(async move { handler.call(task_context).await });

        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(Ok(()))) => {
                if !context.is_finished() {
                    warn!(
                        "Method {} returned without responding to {}",
                        method.name,
                        context.request_id()
                    );
                }
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!("Method {} failed: {}", method.name, e);
                if !context.is_finished() {
                    let message = match &e {
                        HeliosError::Handler { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    context.error(e.code(), message)?;
                }
                Ok(())
            }
            Ok(Err(join_error)) => {
                error!("Method {} panicked: {}", method.name, join_error);
                if !context.is_finished() {
                    context.error("INTERNAL_ERROR", "Method handler panicked")?;
                }
                Ok(())
            }
            Err(_) => {
                warn!("Method {} timed out after {:?}", method.name, budget);
                Err(HeliosError::MethodTimeout {
                    method: method.name.clone(),
                    timeout: budget,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Methods {
        Methods::new(Duration::from_secs(30), EventBus::new())
    }

    async fn noop(_context: RequestContext) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_valid_names() {
        for name in ["echo", "user:create", "chat:room:join", "abc", "v2:list", "user_profile:get"] {
            assert!(validate_name(name).is_ok(), "rejected {}", name);
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["ab", "1abc", ":user", "_abc", "user-create", "user.get", "user get"] {
            assert!(
                matches!(validate_name(name), Err(HeliosError::InvalidName { .. })),
                "accepted {}",
                name
            );
        }
    }

    #[test]
    fn test_reserved_namespaces() {
        for name in [
            "system:ping",
            "helios:status",
            "starling:getToken",
            "system",
            "helios",
            "starling",
            "internal",
            "stream",
        ] {
            assert!(
                matches!(
                    validate_name(name),
                    Err(HeliosError::ReservedNamespace { .. })
                ),
                "accepted {}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_register_rejects_bare_reserved_name() {
        let methods = registry();
        let result = methods.register("system", noop, MethodOptions::default());
        assert!(matches!(result, Err(HeliosError::ReservedNamespace { .. })));
        assert!(!methods.has("system"));
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let methods = registry();
        let mut events = methods.events.subscribe();

        methods.register("user:create", noop, MethodOptions::default()).unwrap();
        methods.register("user:delete", noop, MethodOptions::default()).unwrap();
        methods.register("echo", noop, MethodOptions::default()).unwrap();

        assert!(methods.has("echo"));
        assert_eq!(methods.get("echo").unwrap().name(), "echo");
        assert_eq!(methods.names(), vec!["echo", "user:create", "user:delete"]);
        assert_eq!(methods.by_namespace("user"), vec!["user:create", "user:delete"]);

        match events.recv().await.unwrap() {
            HeliosEvent::MethodAdded { name } => assert_eq!(name, "user:create"),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let methods = registry();
        methods.register("echo", noop, MethodOptions::default()).unwrap();
        assert!(matches!(
            methods.register("echo", noop, MethodOptions::default()),
            Err(HeliosError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_internal_bypasses_name_rules() {
        let methods = registry();
        let internal = MethodOptions {
            internal: true,
            ..Default::default()
        };
        methods.register("starling:getToken", noop, internal.clone()).unwrap();
        assert!(matches!(
            methods.register("starling:getToken", noop, internal),
            Err(HeliosError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_remove() {
        let methods = registry();
        methods.register("echo", noop, MethodOptions::default()).unwrap();
        assert!(methods.remove("echo"));
        assert!(!methods.remove("echo"));
        assert!(methods.is_empty());
    }
}
