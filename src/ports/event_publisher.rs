//! EventPublisher port - Interface for publishing committed domain events.
//!
//! The transactional pipeline hands every harvested event to this port
//! after a successful commit. It does not know whether the event goes to
//! the message broker, to in-process handlers, or to both.

use async_trait::async_trait;

use crate::domain::foundation::{DomainError, PendingEvent};

/// Port for publishing domain events.
///
/// Implementations must:
/// - Publish each event once per call (no local buffering or batching)
/// - Return failures to the caller rather than swallowing them
///
/// # Example
///
/// ```ignore
/// let event: PendingEvent = Arc::new(OrderCreated { .. });
/// publisher.publish(event).await?;
/// ```
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: PendingEvent) -> Result<(), DomainError>;

    /// Publish events sequentially in the given order, stopping at the
    /// first failure.
    async fn publish_all(&self, events: Vec<PendingEvent>) -> Result<(), DomainError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{ErrorCode, EventId, Timestamp};
    use crate::domain_event;
    use serde::Serialize;
    use std::sync::{Arc, Mutex};

    // Compile-time check that trait is object-safe
    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn EventPublisher) {}

    #[derive(Debug, Serialize)]
    struct StockReserved {
        event_id: EventId,
        occurred_at: Timestamp,
    }

    domain_event!(StockReserved, occurred_at = occurred_at, event_id = event_id);

    #[derive(Default)]
    struct FailsOnSecond {
        seen: Mutex<Vec<EventId>>,
    }

    #[async_trait]
    impl EventPublisher for FailsOnSecond {
        async fn publish(&self, event: PendingEvent) -> Result<(), DomainError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(event.event_id());
            if seen.len() == 2 {
                return Err(DomainError::new(ErrorCode::BrokerUnavailable, "down"));
            }
            Ok(())
        }
    }

    fn reserved() -> PendingEvent {
        Arc::new(StockReserved {
            event_id: EventId::new(),
            occurred_at: Timestamp::now(),
        })
    }

    #[tokio::test]
    async fn publish_all_stops_at_first_failure() {
        let publisher = FailsOnSecond::default();
        let result = publisher
            .publish_all(vec![reserved(), reserved(), reserved()])
            .await;

        assert!(result.is_err());
        assert_eq!(publisher.seen.lock().unwrap().len(), 2);
    }
}
