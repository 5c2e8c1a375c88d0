//! Local event handler port - In-process reactions to committed events.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::foundation::{DomainError, PendingEvent};

/// Handler for processing a domain event inside the publishing process.
///
/// Implementations should be:
/// - **Idempotent** - Publication is at-least-once
/// - **Quick** - Handlers for one event run concurrently and are awaited together
///
/// # Example
///
/// ```ignore
/// struct ReserveStock { /* ... */ }
///
/// #[async_trait]
/// impl LocalEventHandler for ReserveStock {
///     async fn handle(&self, event: PendingEvent) -> Result<(), DomainError> {
///         let created = event
///             .as_any()
///             .downcast_ref::<OrderCreated>()
///             .ok_or_else(|| DomainError::new(ErrorCode::InternalError, "unexpected event"))?;
///         // reserve stock for created.order_id...
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "ReserveStock"
///     }
/// }
/// ```
#[async_trait]
pub trait LocalEventHandler: Send + Sync {
    /// Process an event.
    async fn handle(&self, event: PendingEvent) -> Result<(), DomainError>;

    /// Handler name for logging and aggregated error messages.
    fn name(&self) -> &'static str;
}

/// Registration side of an in-process event registry.
///
/// Handlers are registered at startup, keyed by event type tag
/// (`DomainEvent::event_type`), and invoked in registration order.
pub trait EventSubscriber: Send + Sync {
    /// Subscribe a handler to one event type.
    fn subscribe(&self, event_type: &str, handler: Arc<dyn LocalEventHandler>);

    /// Subscribe the same handler to several event types.
    fn subscribe_all(&self, event_types: &[&str], handler: Arc<dyn LocalEventHandler>) {
        for event_type in event_types {
            self.subscribe(event_type, Arc::clone(&handler));
        }
    }
}
