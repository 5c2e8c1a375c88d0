//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the domain and the outside world. Adapters implement these ports.
//!
//! ## Event Ports
//!
//! - `EventPublisher` - Post-commit publication of domain events
//! - `EventSubscriber` / `LocalEventHandler` - In-process event registry
//!
//! ## Persistence Ports
//!
//! - `TransactionalStore` - Harvest / commit / clear, as seen by the pipeline
//! - `EntityStore` - Tenant-scoped JSON row storage
//!
//! ## Messaging Ports
//!
//! - `BrokerTransport` / `BrokerChannel` - AMQP-shaped broker access
//! - `MessageHandler` - Typed consumer callback
//!
//! ## Operations
//!
//! - `HealthCheck` - Dependency readiness probes

mod broker_transport;
mod entity_store;
mod event_publisher;
mod event_subscriber;
mod health_check;
mod message_handler;
mod transactional_store;

pub use broker_transport::{
    BrokerChannel, BrokerError, BrokerMessage, BrokerTransport, ConnectOptions, DeliveryAcker,
    DeliveryStream, InboundDelivery, MessageProperties, JSON_CONTENT_TYPE,
};
pub use entity_store::{EntityChange, EntityRow, EntityStore};
pub use event_publisher::EventPublisher;
pub use event_subscriber::{EventSubscriber, LocalEventHandler};
pub use health_check::{HealthCheck, HealthStatus};
pub use message_handler::MessageHandler;
pub use transactional_store::TransactionalStore;
