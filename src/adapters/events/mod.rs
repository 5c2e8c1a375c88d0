//! Event adapters - Implementations of the event publishing ports.
//!
//! - `LocalEventDispatcher` - In-process registry fan-out to local handlers
//! - `FanoutEventPublisher` - Sends each event to several publishers
//!
//! The broker-backed publisher lives in `adapters::messaging`.

mod fanout;
mod local_dispatcher;

pub use fanout::FanoutEventPublisher;
pub use local_dispatcher::LocalEventDispatcher;
