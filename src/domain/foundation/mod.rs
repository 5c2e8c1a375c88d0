//! Foundation module - Shared domain primitives.
//!
//! Contains value objects, identifiers, event primitives, and error types
//! that every service on the platform shares.

mod errors;
mod events;
mod ids;
mod timestamp;

pub use errors::{DomainError, ErrorCode, ValidationError};
pub use events::{DomainEvent, EventId, PendingEvent, PublishableEvent};
pub use ids::TenantId;
pub use timestamp::Timestamp;
