//! Publishes each event to several publishers in turn.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::foundation::{DomainError, PendingEvent};
use crate::ports::EventPublisher;

/// [`EventPublisher`] that forwards every event to each inner publisher in
/// order, e.g. the broker first and then local handlers.
///
/// Every inner publisher is attempted; the first failure is returned.
pub struct FanoutEventPublisher {
    targets: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutEventPublisher {
    pub fn new(targets: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl EventPublisher for FanoutEventPublisher {
    async fn publish(&self, event: PendingEvent) -> Result<(), DomainError> {
        let mut first_error = None;
        for target in &self.targets {
            if let Err(err) = target.publish(Arc::clone(&event)).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
