//! Cluster Event Dispatch
//!
//! Routes repository change events to the handler registered for the
//! event's key prefix. Every handler gets its own watch subscription and
//! task, so events under one prefix are handled in order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::context::ContextManager;
use super::handlers;
use crate::error::{Error, Result};
use crate::repository::{ChangeType, DataChangedEvent};

/// Reacts to changes under one key prefix
#[async_trait]
pub trait DataChangedEventHandler: Send + Sync {
    /// Key prefix this handler owns
    fn subscribed_key(&self) -> &'static str;

    /// Change types this handler accepts
    fn subscribed_types(&self) -> &'static [ChangeType];

    /// Apply the event to the context
    async fn handle(&self, context: &Arc<ContextManager>, event: &DataChangedEvent) -> Result<()>;
}

/// Immutable set of handlers with disjoint prefixes
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn DataChangedEventHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder { handlers: Vec::new() }
    }

    /// Registry with every built-in handler
    pub fn with_default_handlers() -> Result<Self> {
        let mut builder = Self::builder();
        for handler in handlers::default_handlers() {
            builder = builder.register(handler)?;
        }
        Ok(builder.build())
    }

    /// Handler whose prefix covers the key and that accepts the change type
    pub fn find(&self, event: &DataChangedEvent) -> Option<&Arc<dyn DataChangedEventHandler>> {
        self.handlers.iter().find(|handler| {
            prefix_matches(handler.subscribed_key(), &event.key)
                && handler.subscribed_types().contains(&event.change_type)
        })
    }

    pub fn handlers(&self) -> &[Arc<dyn DataChangedEventHandler>] {
        &self.handlers
    }
}

/// Builds a [`HandlerRegistry`]; duplicate prefixes are rejected
pub struct HandlerRegistryBuilder {
    handlers: Vec<Arc<dyn DataChangedEventHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn DataChangedEventHandler>) -> Result<Self> {
        let key = handler.subscribed_key();
        let overlapping = self.handlers.iter().any(|existing| {
            prefix_matches(existing.subscribed_key(), key) || prefix_matches(key, existing.subscribed_key())
        });
        if overlapping {
            return Err(Error::DuplicateHandler(key.to_string()));
        }
        self.handlers.push(handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

fn prefix_matches(prefix: &str, key: &str) -> bool {
    key == prefix || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Subscribes every registered handler to the repository
pub struct ClusterEventDispatcher {
    registry: Arc<HandlerRegistry>,
    context: Arc<ContextManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterEventDispatcher {
    pub fn new(registry: HandlerRegistry, context: Arc<ContextManager>) -> Self {
        Self {
            registry: Arc::new(registry),
            context,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Route one event; returns whether a handler accepted it
    pub async fn dispatch(&self, event: &DataChangedEvent) -> Result<bool> {
        dispatch_event(&self.registry, &self.context, event).await
    }

    /// Start one watch loop per handler prefix
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for handler in self.registry.handlers() {
            let prefix = handler.subscribed_key();
            let mut rx = self.context.repository().watch(prefix);
            let registry = Arc::clone(&self.registry);
            let context = Arc::clone(&self.context);

            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = dispatch_event(&registry, &context, &event).await {
                        tracing::error!(
                            "Failed to handle {} event for {}: {}",
                            event.change_type,
                            event.key,
                            e
                        );
                    }
                }
                tracing::debug!("Event loop for {} stopped", prefix);
            }));
            tracing::debug!("Watching {}", prefix);
        }
        tracing::info!("Cluster event dispatcher started with {} handler(s)", tasks.len());
    }

    /// Remove every subscription and wait for the event loops to drain
    pub async fn stop(&self) {
        for handler in self.registry.handlers() {
            self.context.repository().remove_data_listener(handler.subscribed_key());
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Event loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Cluster event dispatcher stopped");
    }
}

async fn dispatch_event(
    registry: &HandlerRegistry,
    context: &Arc<ContextManager>,
    event: &DataChangedEvent,
) -> Result<bool> {
    match registry.find(event) {
        Some(handler) => {
            tracing::debug!("Dispatching {} {} to {}", event.change_type, event.key, handler.subscribed_key());
            handler.handle(context, event).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ComputeNodeInstance, InstanceMetaData, InstanceType};
    use crate::repository::{PersistRepository, RegistryRepository};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        key: &'static str,
        count: AtomicUsize,
    }

    #[async_trait]
    impl DataChangedEventHandler for CountingHandler {
        fn subscribed_key(&self) -> &'static str {
            self.key
        }

        fn subscribed_types(&self) -> &'static [ChangeType] {
            &[ChangeType::Added, ChangeType::Updated]
        }

        async fn handle(&self, _context: &Arc<ContextManager>, _event: &DataChangedEvent) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(key: &'static str) -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            key,
            count: AtomicUsize::new(0),
        })
    }

    fn context() -> Arc<ContextManager> {
        let repository: Arc<dyn PersistRepository> =
            Arc::new(RegistryRepository::open_in_memory().unwrap());
        Arc::new(ContextManager::new(
            repository,
            ComputeNodeInstance::new(InstanceMetaData::new("local", InstanceType::Proxy)),
        ))
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let result = HandlerRegistry::builder()
            .register(counting("/a"))
            .and_then(|b| b.register(counting("/a")));
        assert!(matches!(result, Err(Error::DuplicateHandler(_))));

        let result = HandlerRegistry::builder()
            .register(counting("/a"))
            .and_then(|b| b.register(counting("/a/b")));
        assert!(result.is_err());

        assert!(HandlerRegistry::with_default_handlers().is_ok());
    }

    #[test]
    fn test_find_respects_prefix_and_type() {
        let registry = HandlerRegistry::builder()
            .register(counting("/props"))
            .unwrap()
            .build();

        let added = DataChangedEvent::new("/props/active_version", "0", ChangeType::Added);
        let deleted = DataChangedEvent::new("/props/active_version", "0", ChangeType::Deleted);
        let other = DataChangedEvent::new("/props_x/active_version", "0", ChangeType::Added);

        assert!(registry.find(&added).is_some());
        assert!(registry.find(&deleted).is_none());
        assert!(registry.find(&other).is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_and_stops() {
        let context = context();
        let handler = counting("/custom");
        let registry = HandlerRegistry::builder()
            .register(handler.clone())
            .unwrap()
            .build();
        let dispatcher = ClusterEventDispatcher::new(registry, Arc::clone(&context));
        dispatcher.start();

        context.repository().persist("/custom/a", "1").await.unwrap();
        context.repository().persist("/custom/a", "2").await.unwrap();
        context.repository().delete("/custom/a").await.unwrap();
        context.repository().persist("/elsewhere", "1").await.unwrap();

        for _ in 0..50 {
            if handler.count.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(handler.count.load(Ordering::SeqCst), 2);

        dispatcher.stop().await;
        context.repository().persist("/custom/b", "1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(handler.count.load(Ordering::SeqCst), 2);
    }
}
