//! Domain layer containing tenant isolation and event primitives.
//!
//! # Module Organization
//!
//! - `foundation` - Shared domain primitives (value objects, IDs, events, errors)
//! - `tenancy` - Tenant context, entity capabilities and isolation predicates

pub mod foundation;
pub mod tenancy;
