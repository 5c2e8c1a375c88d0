//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the pipeline to external systems:
//! - `persistence` - Entity stores (PostgreSQL, in-memory)
//! - `messaging` - RabbitMQ broker client
//! - `events` - In-process event dispatch and fan-out
//! - `health` - Readiness probes for the broker and the database

pub mod events;
pub mod health;
pub mod messaging;
pub mod persistence;

pub use events::{FanoutEventPublisher, LocalEventDispatcher};
pub use health::{BrokerHealthCheck, DatabaseHealthCheck};
pub use messaging::{BrokerConnection, BrokerConsumer, BrokerPublisher, LapinTransport};
pub use persistence::{InMemoryEntityStore, PostgresEntityStore};
