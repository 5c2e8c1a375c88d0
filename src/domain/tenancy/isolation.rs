//! Tenant isolation predicates.
//!
//! [`IsolationPredicateFactory`] builds one [`TenantFilter`] per
//! tenant-scoped entity type. A filter never captures a tenant value: it
//! reads the [`TenantContext`] every time it is evaluated, so the same
//! filter can be reused by every unit of work in the process.
//!
//! ```ignore
//! let filter = IsolationPredicateFactory::build_filter::<Order>()
//!     .expect("Order is tenant scoped");
//!
//! let mut ctx = TenantContext::for_tenant(tenant_a);
//! assert!(filter.matches(&order_of_a, &ctx)?);
//!
//! ctx.set_tenant(tenant_b);
//! assert!(!filter.matches(&order_of_a, &ctx)?);
//! ```

use std::fmt;
use std::marker::PhantomData;

use super::context::TenantContext;
use super::entity::{Persisted, TenantAccessor, TenantScope};
use crate::domain::foundation::{DomainError, ErrorCode, TenantId};

/// Row-level restriction pushed down to a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    /// Only rows whose tenant column equals this tenant.
    Tenant(TenantId),
    /// No tenant restriction (tenant-exempt entity types).
    Unrestricted,
}

impl QueryScope {
    /// Whether a row owned by `owner` (or by nobody) passes this scope.
    pub fn admits(&self, owner: Option<&TenantId>) -> bool {
        match self {
            QueryScope::Unrestricted => true,
            QueryScope::Tenant(tenant) => owner == Some(tenant),
        }
    }
}

/// Predicate "entity.tenant_id == current tenant" for one entity type.
pub struct TenantFilter<T> {
    entity_name: &'static str,
    accessor: TenantAccessor<T>,
    _entity: PhantomData<fn(&T)>,
}

impl<T> TenantFilter<T> {
    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    /// The tenant the filter currently admits.
    ///
    /// # Errors
    ///
    /// `TenantNotSet` when the context has no tenant.
    pub fn current_tenant(&self, ctx: &TenantContext) -> Result<TenantId, DomainError> {
        ctx.current_tenant()
    }

    /// Evaluates the predicate for one entity against the tenant stored in
    /// `ctx` at this moment.
    pub fn matches(&self, entity: &T, ctx: &TenantContext) -> Result<bool, DomainError> {
        let current = ctx.current_tenant()?;
        Ok((self.accessor)(entity) == &current)
    }

    /// Rejects a write of an entity owned by another tenant.
    ///
    /// # Errors
    ///
    /// - `TenantNotSet` when the context has no tenant
    /// - `CrossTenantAccess` when the entity belongs to a different tenant
    pub fn ensure_owned(&self, entity: &T, ctx: &TenantContext) -> Result<(), DomainError> {
        let current = ctx.current_tenant()?;
        let owner = (self.accessor)(entity);
        if owner == &current {
            Ok(())
        } else {
            Err(DomainError::new(
                ErrorCode::CrossTenantAccess,
                format!("{} belongs to another tenant", self.entity_name),
            )
            .with_detail("owner_tenant", owner.to_string())
            .with_detail("current_tenant", current.to_string()))
        }
    }

    /// The owning tenant of `entity`.
    pub fn owner_of<'a>(&self, entity: &'a T) -> &'a TenantId {
        (self.accessor)(entity)
    }

    /// Backend pushdown form of this filter for the current tenant.
    pub fn query_scope(&self, ctx: &TenantContext) -> Result<QueryScope, DomainError> {
        Ok(QueryScope::Tenant(ctx.current_tenant()?))
    }
}

impl<T> Clone for TenantFilter<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TenantFilter<T> {}

impl<T> fmt::Debug for TenantFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantFilter")
            .field("entity_name", &self.entity_name)
            .finish()
    }
}

/// Builds tenant predicates from an entity type's design-time scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolationPredicateFactory;

impl IsolationPredicateFactory {
    /// The filter for `T`, or `None` if `T` is tenant exempt.
    pub fn build_filter<T: Persisted>() -> Option<TenantFilter<T>> {
        match T::tenant_scope() {
            TenantScope::Scoped(accessor) => Some(TenantFilter {
                entity_name: T::ENTITY_NAME,
                accessor,
                _entity: PhantomData,
            }),
            TenantScope::Exempt => None,
        }
    }

    /// Pushdown scope for reads of `T` in the given context.
    ///
    /// Tenant-exempt types are unrestricted and never consult the context.
    pub fn query_scope<T: Persisted>(ctx: &TenantContext) -> Result<QueryScope, DomainError> {
        match Self::build_filter::<T>() {
            Some(filter) => filter.query_scope(ctx),
            None => Ok(QueryScope::Unrestricted),
        }
    }

    /// Owner of `entity`, or `None` when `T` is tenant exempt.
    pub fn owner_of<T: Persisted>(entity: &T) -> Option<TenantId> {
        Self::build_filter::<T>().map(|filter| *filter.owner_of(entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tenancy::entity::HasTenantScope;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Invoice {
        number: String,
        tenant_id: TenantId,
    }

    impl HasTenantScope for Invoice {
        fn tenant_id(&self) -> &TenantId {
            &self.tenant_id
        }
    }

    impl Persisted for Invoice {
        const ENTITY_NAME: &'static str = "Invoice";

        fn entity_key(&self) -> String {
            self.number.clone()
        }

        fn tenant_scope() -> TenantScope<Self> {
            TenantScope::scoped()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Currency {
        code: String,
    }

    impl Persisted for Currency {
        const ENTITY_NAME: &'static str = "Currency";

        fn entity_key(&self) -> String {
            self.code.clone()
        }

        fn tenant_scope() -> TenantScope<Self> {
            TenantScope::Exempt
        }
    }

    fn invoice_for(tenant_id: TenantId) -> Invoice {
        Invoice {
            number: "INV-1".to_string(),
            tenant_id,
        }
    }

    #[test]
    fn exempt_types_get_no_filter() {
        assert!(IsolationPredicateFactory::build_filter::<Currency>().is_none());
    }

    #[test]
    fn scoped_types_get_a_filter() {
        let filter = IsolationPredicateFactory::build_filter::<Invoice>().unwrap();
        assert_eq!(filter.entity_name(), "Invoice");
    }

    #[test]
    fn filter_reads_context_at_evaluation_time() {
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let invoice = invoice_for(tenant_a);
        let filter = IsolationPredicateFactory::build_filter::<Invoice>().unwrap();

        let mut ctx = TenantContext::for_tenant(tenant_a);
        assert!(filter.matches(&invoice, &ctx).unwrap());

        ctx.set_tenant(tenant_b);
        assert!(!filter.matches(&invoice, &ctx).unwrap());
    }

    #[test]
    fn filter_without_tenant_fails() {
        let filter = IsolationPredicateFactory::build_filter::<Invoice>().unwrap();
        let err = filter
            .matches(&invoice_for(TenantId::new()), &TenantContext::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TenantNotSet);
    }

    #[test]
    fn ensure_owned_rejects_foreign_entities() {
        let filter = IsolationPredicateFactory::build_filter::<Invoice>().unwrap();
        let ctx = TenantContext::for_tenant(TenantId::new());
        let err = filter
            .ensure_owned(&invoice_for(TenantId::new()), &ctx)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CrossTenantAccess);
    }

    #[test]
    fn exempt_query_scope_ignores_missing_tenant() {
        let scope = IsolationPredicateFactory::query_scope::<Currency>(&TenantContext::new()).unwrap();
        assert_eq!(scope, QueryScope::Unrestricted);
    }

    #[test]
    fn query_scope_admits_only_matching_owner() {
        let tenant = TenantId::new();
        let scope = QueryScope::Tenant(tenant);
        assert!(scope.admits(Some(&tenant)));
        assert!(!scope.admits(Some(&TenantId::new())));
        assert!(!scope.admits(None));
        assert!(QueryScope::Unrestricted.admits(None));
    }
}
