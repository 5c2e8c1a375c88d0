//! Tenancy module - Per-unit-of-work tenant context and row isolation.
//!
//! Every tenant-scoped entity is visible only to the tenant that owns it.
//! Tenant-exempt entity types are declared explicitly and bypass isolation.

mod context;
mod entity;
mod isolation;

pub use context::TenantContext;
pub use entity::{EntityCore, HasTenantScope, Persisted, TenantAccessor, TenantScope};
pub use isolation::{IsolationPredicateFactory, QueryScope, TenantFilter};
