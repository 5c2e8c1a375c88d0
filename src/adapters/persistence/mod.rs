//! Persistence adapters - Implementations of the `EntityStore` port.
//!
//! - `PostgresEntityStore` - JSONB rows in PostgreSQL with a tenant column
//! - `InMemoryEntityStore` - Shared in-process map for tests and local runs

mod in_memory;
mod postgres;

pub use in_memory::InMemoryEntityStore;
pub use postgres::PostgresEntityStore;
