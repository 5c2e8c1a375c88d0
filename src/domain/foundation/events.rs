//! Event infrastructure for domain event publishing and handling.
//!
//! This module provides the core types and traits for event-driven architecture:
//! - `EventId` - Unique identifier for events (deduplication)
//! - `DomainEvent` - Trait that all domain events implement
//! - `PublishableEvent` - Object-safe view of a serializable domain event
//! - `PendingEvent` - Shared handle stored on entities until the next commit
//! - `domain_event!` - Macro to simplify DomainEvent implementations

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::Timestamp;

// ============================================
// DomainEvent Trait
// ============================================

/// Trait that all domain events must implement.
///
/// A domain event is an immutable fact: it has a unique identifier, the
/// moment it occurred, and a payload (the implementing type itself).
pub trait DomainEvent: Send + Sync {
    /// Returns the event type name (e.g., "OrderCreated").
    ///
    /// Used as the broker `type` tag, the `EventType` header, and
    /// (lowercased) in the routing key `events.<name>`.
    fn event_type(&self) -> &'static str;

    /// Returns when the event occurred.
    fn occurred_at(&self) -> Timestamp;

    /// Returns the unique ID for this event instance.
    fn event_id(&self) -> EventId;
}

/// Object-safe view of a domain event that can be serialized for transport.
///
/// Automatically implemented for every `DomainEvent + Serialize + Debug`
/// type, so entities can hold heterogeneous events in one list and the
/// publication pipeline can serialize them without knowing their types.
pub trait PublishableEvent: DomainEvent + fmt::Debug {
    /// Serializes the event payload to JSON.
    fn to_json(&self) -> Result<JsonValue, serde_json::Error>;

    /// Downcasting hook for in-process handlers that want the concrete type.
    fn as_any(&self) -> &dyn Any;
}

impl<T> PublishableEvent for T
where
    T: DomainEvent + Serialize + fmt::Debug + 'static,
{
    fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A raised event waiting for the next successful commit.
pub type PendingEvent = Arc<dyn PublishableEvent>;

/// Macro to implement DomainEvent trait with minimal boilerplate.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// pub struct OrderCreated {
///     pub event_id: EventId,
///     pub order_id: Uuid,
///     pub occurred_at: Timestamp,
/// }
///
/// domain_event!(
///     OrderCreated,
///     occurred_at = occurred_at,
///     event_id = event_id
/// );
/// ```
#[macro_export]
macro_rules! domain_event {
    (
        $event_name:ident,
        occurred_at = $occurred_field:ident,
        event_id = $event_id_field:ident
    ) => {
        impl $crate::domain::foundation::DomainEvent for $event_name {
            fn event_type(&self) -> &'static str {
                stringify!($event_name)
            }

            fn occurred_at(&self) -> $crate::domain::foundation::Timestamp {
                self.$occurred_field
            }

            fn event_id(&self) -> $crate::domain::foundation::EventId {
                self.$event_id_field
            }
        }
    };
}

// Re-export the macro
pub use domain_event;

/// Unique identifier for events (used for deduplication).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random EventId using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an EventId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
