//! BrokerConsumer - Manual-ack queue subscriptions.
//!
//! Per delivery:
//!
//! | Outcome                  | Settlement           |
//! |--------------------------|----------------------|
//! | body fails to decode     | nack, no requeue     |
//! | handler returns `Ok`     | ack                  |
//! | handler returns `Err`    | nack, requeue        |
//!
//! There is no redelivery limit; a handler that always fails sees the
//! same message again until the broker's own policy intervenes.

use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::BrokerConnection;
use crate::ports::{BrokerChannel, BrokerError, DeliveryStream, InboundDelivery, MessageHandler};

/// Unacknowledged deliveries allowed per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded; the broker forgets the message.
    Acked,
    /// Handler failed; the message goes back on the queue.
    Requeued,
    /// Body could not be decoded; the message is discarded.
    Dropped,
}

/// Subscribes typed handlers to durable queues on the shared exchange.
#[derive(Clone, Debug)]
pub struct BrokerConsumer {
    connection: BrokerConnection,
}

impl BrokerConsumer {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }

    /// Declares `queue`, binds it to the exchange with `queue` as routing
    /// key, limits prefetch to one and starts a background receive loop.
    ///
    /// Setup errors are returned directly. Once running, the loop survives
    /// connection loss by redeclaring its topology after reconnecting, and
    /// stops when `cancel` fires, the returned [`Subscription`] is
    /// cancelled, or the connection is closed.
    pub async fn subscribe<T>(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler<T>>,
        cancel: &CancellationToken,
    ) -> Result<Subscription, BrokerError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (channel, stream) = setup(&self.connection, queue, cancel).await?;

        tracing::info!(queue = %queue, handler = handler.name(), "Subscribed to queue");

        let token = cancel.child_token();
        let task = tokio::spawn(consume_loop(
            self.connection.clone(),
            queue.to_string(),
            handler,
            channel,
            stream,
            token.clone(),
        ));

        Ok(Subscription {
            queue: queue.to_string(),
            cancel: token,
            task,
        })
    }
}

/// Handle to a running subscription.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stops the receive loop after the in-flight delivery, if any, is
    /// settled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the receive loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(queue = %self.queue, error = %e, "Consumer task failed");
        }
    }
}

/// Decodes one delivery, runs the handler and settles the delivery.
///
/// Settlement failures are logged; the returned outcome is the settlement
/// that was attempted.
pub async fn handle_delivery<T>(
    handler: &dyn MessageHandler<T>,
    queue: &str,
    delivery: InboundDelivery,
) -> DeliveryOutcome
where
    T: DeserializeOwned + Send + 'static,
{
    let properties = &delivery.message.properties;

    let message: T = match serde_json::from_slice(&delivery.message.body) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(
                queue = %queue,
                message_type = %properties.type_tag,
                message_id = %properties.message_id,
                error = %e,
                "Dropping message that failed to decode"
            );
            if let Err(e) = delivery.nack(false).await {
                tracing::warn!(queue = %queue, error = %e, "Failed to reject message");
            }
            return DeliveryOutcome::Dropped;
        }
    };

    match handler.handle(message).await {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                tracing::warn!(queue = %queue, error = %e, "Failed to acknowledge message");
            }
            DeliveryOutcome::Acked
        }
        Err(err) => {
            tracing::warn!(
                queue = %queue,
                handler = handler.name(),
                message_type = %properties.type_tag,
                message_id = %properties.message_id,
                redelivered = delivery.redelivered,
                error = %err,
                "Handler failed, requeueing message"
            );
            if let Err(e) = delivery.nack(true).await {
                tracing::warn!(queue = %queue, error = %e, "Failed to requeue message");
            }
            DeliveryOutcome::Requeued
        }
    }
}

/// Declares and binds the queue, applies prefetch and starts consuming.
async fn setup(
    connection: &BrokerConnection,
    queue: &str,
    cancel: &CancellationToken,
) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), BrokerError> {
    let channel = connection.ensure_ready(cancel).await?;

    let topology = async {
        channel.declare_queue(queue).await?;
        channel.bind_queue(queue, connection.exchange(), queue).await?;
        channel.set_prefetch(PREFETCH_COUNT).await?;
        let consumer_tag = format!("{}.{}", queue, Uuid::new_v4().simple());
        channel.consume(queue, &consumer_tag).await
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BrokerError::Cancelled),
        result = topology => result,
    };

    match result {
        Ok(stream) => Ok((channel, stream)),
        Err(err) => {
            tracing::error!(queue = %queue, error = %err, "Failed to set up consumer");
            connection.report_failure(&channel, &err);
            Err(err)
        }
    }
}

async fn consume_loop<T>(
    connection: BrokerConnection,
    queue: String,
    handler: Arc<dyn MessageHandler<T>>,
    mut channel: Arc<dyn BrokerChannel>,
    mut stream: DeliveryStream,
    cancel: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                handle_delivery(handler.as_ref(), &queue, delivery).await;
                continue;
            }
            Some(Err(err)) => {
                tracing::warn!(queue = %queue, error = %err, "Consumer stream error");
                connection.report_failure(&channel, &err);
                if channel.is_open() && !err.is_retryable() {
                    continue;
                }
            }
            None => {
                tracing::warn!(queue = %queue, "Consumer stream ended");
                connection.report_disconnect(&channel);
            }
        }

        match resubscribe(&connection, &queue, &cancel).await {
            Some((c, s)) => {
                channel = c;
                stream = s;
                tracing::info!(queue = %queue, "Consumer resubscribed");
            }
            None => break,
        }
    }

    tracing::debug!(queue = %queue, "Consumer stopped");
}

/// Retries topology setup every recovery interval until it succeeds, the
/// subscription is cancelled or the connection is closed.
async fn resubscribe(
    connection: &BrokerConnection,
    queue: &str,
    cancel: &CancellationToken,
) -> Option<(Arc<dyn BrokerChannel>, DeliveryStream)> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match setup(connection, queue, cancel).await {
            Ok(link) => return Some(link),
            Err(BrokerError::Closed) | Err(BrokerError::Cancelled) => return None,
            Err(_) => {}
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(connection.recovery_interval()) => {}
        }
    }
}
