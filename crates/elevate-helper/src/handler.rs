//! Action handlers and the name→handler registry.

use crate::context::HelperContext;
use async_trait::async_trait;
use elevate_contracts::{ActionReply, ArgumentMap};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Implementation of one privileged action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: HelperContext, arguments: ArgumentMap) -> ActionReply;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(HelperContext, ArgumentMap) -> Fut + Send + Sync,
    Fut: Future<Output = ActionReply> + Send + 'static,
{
    async fn handle(&self, ctx: HelperContext, arguments: ArgumentMap) -> ActionReply {
        (self.f)(ctx, arguments).await
    }
}

/// Wrap an async closure as an [`ActionHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(HelperContext, ArgumentMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionReply> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handlers keyed by full action name. Built once at helper startup and
/// read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Sorted action names, as announced in the handshake.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_registered_names_only() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "org.example.write",
            handler_fn(|_ctx, _args| async { ActionReply::success() }),
        );
        registry.register(
            "org.example.read",
            handler_fn(|_ctx, _args| async { ActionReply::success() }),
        );

        assert!(registry.resolve("org.example.write").is_some());
        assert!(registry.resolve("org.example.delete").is_none());
        assert_eq!(registry.names(), vec!["org.example.read", "org.example.write"]);
        assert_eq!(registry.len(), 2);
    }
}
