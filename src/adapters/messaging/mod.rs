//! Messaging adapters - The RabbitMQ broker client.
//!
//! - `BrokerConnection` - Shared connection/channel with lazy init and recovery
//! - `BrokerPublisher` - Durable JSON publishes; implements `EventPublisher`
//! - `BrokerConsumer` - Manual-ack subscriptions with requeue/drop policy
//! - `LapinTransport` - AMQP 0-9-1 over the network
//! - `InMemoryBrokerTransport` - Exchanges and queues in process, for tests

mod amqp;
mod connection;
mod consumer;
mod in_memory;
mod publisher;

pub use amqp::LapinTransport;
pub use connection::{BrokerConnection, ConnectionSettings, ConnectionState};
pub use consumer::{handle_delivery, BrokerConsumer, DeliveryOutcome, Subscription, PREFETCH_COUNT};
pub use in_memory::{topic_matches, InMemoryBrokerTransport};
pub use publisher::{event_routing_key, BrokerPublisher, EVENT_TYPE_HEADER, OCCURRED_AT_HEADER};
pub use crate::ports::BrokerMessage;
