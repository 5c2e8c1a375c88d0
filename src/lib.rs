//! E-Commerce Common - Shared backend toolkit for the e-commerce services
//!
//! This crate implements tenant isolation for persisted entities and the
//! transactional publication of domain events to RabbitMQ: entities raise
//! events, a unit of work commits them, and the events harvested before
//! the commit are published once it succeeds.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;
