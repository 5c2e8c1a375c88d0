//! MessageHandler port - Typed consumer-side handler for broker messages.

use async_trait::async_trait;

use crate::domain::foundation::DomainError;

/// Processes one decoded message from a broker queue.
///
/// Returning `Ok` acknowledges the message. Returning `Err` requeues it
/// for redelivery, so handlers must be idempotent.
///
/// # Example
///
/// ```ignore
/// struct SendConfirmation { mailer: Arc<dyn Mailer> }
///
/// #[async_trait]
/// impl MessageHandler<OrderCreated> for SendConfirmation {
///     async fn handle(&self, message: OrderCreated) -> Result<(), DomainError> {
///         self.mailer.order_confirmation(message.order_id).await
///     }
///
///     fn name(&self) -> &'static str {
///         "SendConfirmation"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Process a message.
    async fn handle(&self, message: T) -> Result<(), DomainError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}
