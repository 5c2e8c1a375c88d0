//! TransactionalStore port - What the event pipeline needs from a store.
//!
//! The pipeline only harvests, commits, and clears. Tracking, change
//! detection, and isolation are the store's business.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, PendingEvent};

/// A unit of work whose commit can be wrapped by the event pipeline.
#[async_trait]
pub trait TransactionalStore: Send {
    /// Every pending event across tracked entities.
    ///
    /// Order is entity enumeration order, then per-entity raise order.
    /// Harvesting does not remove anything.
    fn harvest_pending_events(&self) -> Vec<PendingEvent>;

    /// Writes tracked changes atomically and returns the number of
    /// entities written.
    ///
    /// On failure nothing is written and tracked state is unchanged.
    async fn commit(&mut self) -> Result<usize, DomainError>;

    /// Drops pending events from every tracked entity.
    fn clear_pending_events(&mut self);
}
