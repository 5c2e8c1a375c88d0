//! BrokerTransport port - AMQP 0-9-1 shaped access to a message broker.
//!
//! The broker client (connection lifecycle, publisher, consumer) is
//! written against these traits. One adapter speaks AMQP over the network
//! and one keeps exchanges and queues in memory for tests.
//!
//! Declarations are idempotent: declaring an existing exchange or queue
//! with the same attributes, or repeating a binding, is a no-op.

use async_trait::async_trait;
use futures::stream::BoxStream;
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::foundation::{DomainError, ErrorCode, Timestamp};

/// MIME type of every message body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors that can occur in broker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or the channel is gone
    #[error("Broker connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The broker rejected an operation
    #[error("Broker protocol error: {0}")]
    Protocol(String),

    /// The operation was cancelled by the caller
    #[error("Broker operation cancelled")]
    Cancelled,

    /// The connection was closed deliberately and will not reopen
    #[error("Broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether a later identical call may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::ConnectionUnavailable(_))
    }
}

impl From<BrokerError> for DomainError {
    fn from(err: BrokerError) -> Self {
        let code = match &err {
            BrokerError::ConnectionUnavailable(_) => ErrorCode::BrokerUnavailable,
            BrokerError::Serialization(_) => ErrorCode::SerializationFailed,
            BrokerError::Protocol(_) | BrokerError::Cancelled | BrokerError::Closed => {
                ErrorCode::InternalError
            }
        };
        DomainError::new(code, err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

/// Envelope metadata carried by every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// Unique per publish.
    pub message_id: String,
    /// Unix seconds.
    pub timestamp: u64,
    pub content_type: String,
    /// Event or message type name.
    pub type_tag: String,
    /// Delivery mode 2: survives a broker restart.
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// The wire envelope: a UTF-8 JSON body plus properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl BrokerMessage {
    /// New persistent JSON message with a fresh id and the current time.
    pub fn new(body: Vec<u8>, type_tag: impl Into<String>) -> Self {
        Self {
            body,
            properties: MessageProperties {
                message_id: Uuid::new_v4().to_string(),
                timestamp: Timestamp::now().as_unix_secs(),
                content_type: JSON_CONTENT_TYPE.to_string(),
                type_tag: type_tag.into(),
                persistent: true,
                headers: BTreeMap::new(),
            },
        }
    }

    /// Adds a string header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.properties.headers.get(key).map(String::as_str)
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message received from a queue, awaiting explicit settlement.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub routing_key: String,
    pub message: BrokerMessage,
    acker: Box<dyn DeliveryAcker>,
}

impl InboundDelivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        routing_key: impl Into<String>,
        message: BrokerMessage,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            routing_key: routing_key.into(),
            message,
            acker,
        }
    }

    /// Positive acknowledgement: the broker forgets the message.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Negative acknowledgement, optionally returning the message to the
    /// queue for redelivery.
    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("routing_key", &self.routing_key)
            .field("message_id", &self.message.properties.message_id)
            .finish()
    }
}

/// Manual-ack stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, BrokerError>>;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Full `amqp://` URI including credentials.
    pub uri: SecretString,
    /// Client-provided connection name shown in the broker UI.
    pub connection_name: Option<String>,
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Opens a network connection and one logical channel on it.
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// One logical channel on an open connection.
///
/// Shared by every publisher and consumer in the process; all methods take
/// `&self` and may be called concurrently.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether both the channel and its connection are still open.
    fn is_open(&self) -> bool;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable, non-exclusive, non-auto-delete queue.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Publish one message to `exchange` under `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Result<(), BrokerError>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn close_channel(&self) -> Result<(), BrokerError>;

    async fn close_connection(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    fn assert_transport_object_safe(_: &dyn BrokerTransport) {}

    #[allow(dead_code)]
    fn assert_channel_object_safe(_: &dyn BrokerChannel) {}

    #[test]
    fn new_message_is_persistent_json() {
        let message = BrokerMessage::new(b"{}".to_vec(), "OrderCreated");
        assert!(message.properties.persistent);
        assert_eq!(message.properties.content_type, "application/json");
        assert_eq!(message.properties.type_tag, "OrderCreated");
        assert!(Uuid::parse_str(&message.properties.message_id).is_ok());
        assert!(message.properties.timestamp > 0);
    }

    #[test]
    fn message_ids_are_unique_per_message() {
        let a = BrokerMessage::new(b"{}".to_vec(), "OrderCreated");
        let b = BrokerMessage::new(b"{}".to_vec(), "OrderCreated");
        assert_ne!(a.properties.message_id, b.properties.message_id);
    }

    #[test]
    fn headers_are_readable() {
        let message = BrokerMessage::new(Vec::new(), "OrderCreated").with_header("EventType", "OrderCreated");
        assert_eq!(message.header("EventType"), Some("OrderCreated"));
        assert_eq!(message.header("Missing"), None);
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(BrokerError::ConnectionUnavailable("refused".into()).is_retryable());
        assert!(!BrokerError::Serialization("bad".into()).is_retryable());
        assert!(!BrokerError::Closed.is_retryable());
    }

    #[test]
    fn broker_errors_map_onto_domain_codes() {
        let unavailable: DomainError = BrokerError::ConnectionUnavailable("refused".into()).into();
        assert_eq!(unavailable.code, ErrorCode::BrokerUnavailable);
        assert!(unavailable.is_retryable());

        let serialization: DomainError = BrokerError::Serialization("bad".into()).into();
        assert_eq!(serialization.code, ErrorCode::SerializationFailed);
        assert!(!serialization.is_retryable());
    }
}
