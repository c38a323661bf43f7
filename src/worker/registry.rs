use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type TaskHandlerFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Maps handler names carried in leaf bodies to executable code. What the
/// handlers actually are is deployment-specific; the runtime only cares
/// that a name resolves.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    pub fn register<F, Fut>(&self, handler_name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler_fn: TaskHandlerFn = Arc::new(move |payload: Value| {
            Box::pin(handler(payload)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });

        self.handlers.insert(handler_name.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", handler_name);
    }

    pub async fn execute(&self, handler_name: &str, payload: Value) -> Result<Value> {
        let handler_fn = match self.handlers.get(handler_name) {
            Some(entry) => entry.value().clone(),
            None => {
                let error = format!("Unknown task handler: {}", handler_name);
                tracing::error!("{}", error);
                return Err(anyhow::anyhow!(error));
            }
        };

        handler_fn(payload).await
    }

    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn has_handler(&self, handler_name: &str) -> bool {
        self.handlers.contains_key(handler_name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
