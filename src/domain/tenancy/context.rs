//! The current tenant of one unit of work.

use crate::domain::foundation::{DomainError, TenantId};

/// Holds the tenant for the current unit of work (typically one inbound
/// request).
///
/// A context is owned by exactly one unit of work and is never shared
/// across concurrent units, so it needs no internal locking. It is
/// deliberately not `Clone`.
///
/// Reading before a tenant has been set is an error, never a default:
///
/// ```ignore
/// let mut ctx = TenantContext::new();
/// assert!(ctx.current_tenant().is_err());
///
/// ctx.set_tenant(tenant_id);
/// assert_eq!(ctx.current_tenant()?, tenant_id);
/// ```
#[derive(Debug, Default)]
pub struct TenantContext {
    current: Option<TenantId>,
}

impl TenantContext {
    /// Creates a context with no tenant set.
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Creates a context already bound to `tenant_id`.
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            current: Some(tenant_id),
        }
    }

    /// Stores `tenant_id`, overwriting any previous value.
    pub fn set_tenant(&mut self, tenant_id: TenantId) {
        if let Some(previous) = self.current.replace(tenant_id) {
            if previous != tenant_id {
                tracing::debug!(%previous, tenant_id = %tenant_id, "Tenant context overwritten");
            }
        }
    }

    /// Returns the stored tenant.
    ///
    /// # Errors
    ///
    /// `ErrorCode::TenantNotSet` if [`set_tenant`](Self::set_tenant) has
    /// never been called.
    pub fn current_tenant(&self) -> Result<TenantId, DomainError> {
        self.current.ok_or_else(DomainError::tenant_not_set)
    }

    /// Whether a tenant has been set.
    pub fn is_set(&self) -> bool {
        self.current.is_some()
    }
}
