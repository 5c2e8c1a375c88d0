//! TransactionalEventPipeline - Publish domain events only after commit.
//!
//! Every save runs four steps:
//!
//! 1. **Harvest** pending events from all tracked entities
//! 2. **Commit** the store; on failure return the error, publish nothing,
//!    and leave pending events in place so a retried save re-harvests them
//! 3. **Publish** each harvested event in order; a failed publish is logged
//!    and recorded, and the remaining events are still attempted
//! 4. **Clear** pending events, whatever the publish outcome
//!
//! ## Known limitation
//!
//! Events are lost if the process dies between commit and publish. There
//! is no outbox: callers that need stronger delivery must add one.

use std::sync::Arc;

use crate::domain::foundation::{DomainError, EventId};
use crate::ports::{EventPublisher, TransactionalStore};

/// One event that could not be published after a successful commit.
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub event_id: EventId,
    pub event_type: &'static str,
    pub error: DomainError,
}

/// Result of a successful save.
#[derive(Debug, Clone, Default)]
pub struct SaveOutcome {
    /// Entities written by the commit.
    pub entities_written: usize,
    /// Events handed to the publisher without error.
    pub events_published: usize,
    /// Events whose publication failed, in harvest order.
    pub publish_failures: Vec<PublishFailure>,
}

impl SaveOutcome {
    /// Whether every harvested event was published.
    pub fn fully_published(&self) -> bool {
        self.publish_failures.is_empty()
    }
}

/// Wraps a store's commit with event harvesting and publication.
pub struct TransactionalEventPipeline {
    publisher: Arc<dyn EventPublisher>,
}

impl TransactionalEventPipeline {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    /// Runs harvest, commit, publish, clear against `store`.
    ///
    /// # Errors
    ///
    /// Only commit failures are returned. Publication failures are
    /// reported in [`SaveOutcome::publish_failures`].
    pub async fn save<S>(&self, store: &mut S) -> Result<SaveOutcome, DomainError>
    where
        S: TransactionalStore + ?Sized,
    {
        let events = store.harvest_pending_events();

        let entities_written = match store.commit().await {
            Ok(written) => written,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    pending_events = events.len(),
                    "Commit failed; pending events kept for retry"
                );
                return Err(err);
            }
        };

        let mut outcome = SaveOutcome {
            entities_written,
            ..SaveOutcome::default()
        };

        for event in events {
            let event_id = event.event_id();
            let event_type = event.event_type();
            match self.publisher.publish(event).await {
                Ok(()) => outcome.events_published += 1,
                Err(error) => {
                    tracing::error!(
                        %event_id,
                        event_type,
                        error = %error,
                        "Failed to publish committed event"
                    );
                    outcome.publish_failures.push(PublishFailure {
                        event_id,
                        event_type,
                        error,
                    });
                }
            }
        }

        store.clear_pending_events();

        tracing::debug!(
            entities_written = outcome.entities_written,
            events_published = outcome.events_published,
            publish_failures = outcome.publish_failures.len(),
            "Save completed"
        );
        Ok(outcome)
    }
}
