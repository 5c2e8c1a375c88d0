//! In-process event dispatch.
//!
//! A registry maps an event type tag to the handlers registered for it.
//! Publishing runs every matching handler concurrently and waits for all
//! of them; failures are collected rather than short-circuited.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::foundation::{DomainError, ErrorCode, PendingEvent};
use crate::ports::{EventPublisher, EventSubscriber, LocalEventHandler};

/// Registry-based [`EventPublisher`] for handlers in the same process.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(LocalEventDispatcher::new());
/// dispatcher.subscribe("OrderCreated", Arc::new(ReserveStock::new(..)));
///
/// let pipeline = TransactionalEventPipeline::new(dispatcher.clone());
/// ```
pub struct LocalEventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn LocalEventHandler>>>>,
}

impl LocalEventDispatcher {
    /// Creates a dispatcher with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Number of handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .map_or(0, Vec::len)
    }
}

impl Default for LocalEventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for LocalEventDispatcher {
    async fn publish(&self, event: PendingEvent) -> Result<(), DomainError> {
        // Clone handlers to release the lock before awaiting
        let handlers: Vec<Arc<dyn LocalEventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event.event_type())
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!(event_type = event.event_type(), "No local handlers registered");
            return Ok(());
        }

        let results = join_all(handlers.iter().map(|handler| {
            let event = Arc::clone(&event);
            async move { (handler.name(), handler.handle(event).await) }
        }))
        .await;

        let errors: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| format!("{}: {}", name, e)))
            .collect();

        if errors.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            event_type = event.event_type(),
            event_id = %event.event_id(),
            failures = errors.len(),
            "Local event handlers failed"
        );
        Err(DomainError::new(
            ErrorCode::HandlerFailed,
            format!("Handler errors: {}", errors.join(", ")),
        ))
    }
}

impl EventSubscriber for LocalEventDispatcher {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn LocalEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }
}
