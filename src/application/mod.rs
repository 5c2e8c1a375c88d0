//! Application layer - Unit of work and the transactional event pipeline.
//!
//! This layer coordinates the domain (tenancy, entities, events) with the
//! storage and publication ports.

pub mod event_pipeline;
pub mod unit_of_work;

pub use event_pipeline::{PublishFailure, SaveOutcome, TransactionalEventPipeline};
pub use unit_of_work::{EntryState, UnitOfWork};
