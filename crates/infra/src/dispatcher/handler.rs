//! Handler contract and the topic → handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use backlot_core::TaskId;

/// Work performed for one topic.
///
/// Delivery is at-least-once: a crash between claim and outcome means the
/// same task may be handed over again, so handlers must tolerate duplicates.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &serde_json::Value, task_id: TaskId) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, TaskId) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: &serde_json::Value, task_id: TaskId) -> anyhow::Result<()> {
        (self.0)(payload.clone(), task_id).await
    }
}

/// Topic → handler mapping, built by calling code before dispatch starts.
///
/// Lookup order: exact topic, then the longest matching `prefix.*` pattern,
/// then the `*` fallback.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic or topic pattern.
    pub fn register<H>(&mut self, topic_pattern: impl Into<String>, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        self.handlers.insert(topic_pattern.into(), Arc::new(handler));
        self
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, topic_pattern: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(serde_json::Value, TaskId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(topic_pattern, FnHandler(f))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Find the handler for a topic.
    pub fn resolve(&self, topic: &str) -> Option<Arc<dyn TaskHandler>> {
        if let Some(h) = self.handlers.get(topic) {
            return Some(h.clone());
        }

        // Category match ("mail.*" matches "mail.welcome"); longest prefix wins.
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = topic.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone());
        if category.is_some() {
            return category;
        }

        self.handlers.get("*").cloned()
    }
}
