//! Entity capabilities shared by every persisted record.
//!
//! Every persisted type implements [`Persisted`] and must state, at design
//! time, whether it is tenant scoped ([`TenantScope::Scoped`]) or exempt
//! ([`TenantScope::Exempt`]). There is no default, so a new entity type
//! cannot silently skip isolation.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Order {
//!     id: Uuid,
//!     #[serde(flatten)]
//!     core: EntityCore,
//! }
//!
//! impl HasTenantScope for Order {
//!     fn tenant_id(&self) -> &TenantId {
//!         self.core.tenant_id()
//!     }
//! }
//!
//! impl Persisted for Order {
//!     const ENTITY_NAME: &'static str = "Order";
//!     fn entity_key(&self) -> String { self.id.to_string() }
//!     fn tenant_scope() -> TenantScope<Self> { TenantScope::scoped() }
//!     fn pending_events(&self) -> &[PendingEvent] { self.core.pending_events() }
//!     fn clear_pending_events(&mut self) { self.core.clear_pending_events() }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::domain::foundation::{PendingEvent, PublishableEvent, TenantId, Timestamp};

/// Capability of an entity that belongs to exactly one tenant.
pub trait HasTenantScope {
    /// The owning tenant, assigned at creation and never mutated.
    fn tenant_id(&self) -> &TenantId;
}

/// Accessor from an entity to its tenant field.
pub type TenantAccessor<T> = for<'a> fn(&'a T) -> &'a TenantId;

/// Design-time declaration of how an entity type participates in isolation.
pub enum TenantScope<T> {
    /// Every read and write is restricted to the current tenant.
    Scoped(TenantAccessor<T>),
    /// The type carries no tenant field and is shared by all tenants.
    Exempt,
}

impl<T: HasTenantScope> TenantScope<T> {
    /// Scope derived from the type's [`HasTenantScope`] implementation.
    pub fn scoped() -> Self {
        TenantScope::Scoped(<T as HasTenantScope>::tenant_id)
    }
}

impl<T> TenantScope<T> {
    /// Whether the type is subject to tenant isolation.
    pub fn is_scoped(&self) -> bool {
        matches!(self, TenantScope::Scoped(_))
    }
}

impl<T> Clone for TenantScope<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TenantScope<T> {}

impl<T> fmt::Debug for TenantScope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantScope::Scoped(_) => f.write_str("Scoped"),
            TenantScope::Exempt => f.write_str("Exempt"),
        }
    }
}

/// A record the unit of work can track, persist, and harvest events from.
pub trait Persisted: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable storage name of the entity type (e.g. "Order").
    const ENTITY_NAME: &'static str;

    /// Primary key rendered as a string, unique within `ENTITY_NAME`.
    fn entity_key(&self) -> String;

    /// Whether this type is tenant scoped or exempt.
    fn tenant_scope() -> TenantScope<Self>;

    /// Events raised since the last successful commit, in raise order.
    fn pending_events(&self) -> &[PendingEvent] {
        &[]
    }

    /// Drops every pending event.
    fn clear_pending_events(&mut self) {}
}

/// State shared by tenant-scoped entities: owner, audit timestamps, and the
/// transient list of pending domain events.
///
/// Pending events are never serialized; they live only between a mutation
/// and the next successful commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCore {
    tenant_id: TenantId,
    created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<Timestamp>,
    #[serde(skip)]
    pending_events: Vec<PendingEvent>,
}

impl EntityCore {
    /// Creates the core for a new entity owned by `tenant_id`.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            created_at: Timestamp::now(),
            updated_at: None,
            pending_events: Vec::new(),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<Timestamp> {
        self.updated_at
    }

    /// Records that the entity was mutated.
    pub fn mark_updated(&mut self) {
        self.updated_at = Some(Timestamp::now());
    }

    /// Appends an event to the pending list.
    pub fn raise<E>(&mut self, event: E)
    where
        E: PublishableEvent + 'static,
    {
        self.pending_events.push(Arc::new(event));
    }

    pub fn pending_events(&self) -> &[PendingEvent] {
        &self.pending_events
    }

    pub fn clear_pending_events(&mut self) {
        self.pending_events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{DomainEvent, EventId};
    use crate::domain_event;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CartCleared {
        event_id: EventId,
        occurred_at: Timestamp,
    }

    domain_event!(CartCleared, occurred_at = occurred_at, event_id = event_id);

    fn cleared() -> CartCleared {
        CartCleared {
            event_id: EventId::new(),
            occurred_at: Timestamp::now(),
        }
    }

    #[test]
    fn new_core_has_no_pending_events() {
        let core = EntityCore::new(TenantId::new());
        assert!(core.pending_events().is_empty());
        assert!(core.updated_at().is_none());
    }

    #[test]
    fn raise_preserves_order() {
        let mut core = EntityCore::new(TenantId::new());
        let first = cleared();
        let second = cleared();
        core.raise(first.clone());
        core.raise(second.clone());

        let ids: Vec<_> = core.pending_events().iter().map(|e| e.event_id()).collect();
        assert_eq!(ids, vec![first.event_id, second.event_id]);
    }

    #[test]
    fn clear_drops_pending_events() {
        let mut core = EntityCore::new(TenantId::new());
        core.raise(cleared());
        core.clear_pending_events();
        assert!(core.pending_events().is_empty());
    }

    #[test]
    fn pending_events_are_not_serialized() {
        let tenant = TenantId::new();
        let mut core = EntityCore::new(tenant);
        core.raise(cleared());

        let json = serde_json::to_value(&core).unwrap();
        assert_eq!(json["tenantId"], tenant.to_string());
        assert!(json.get("pendingEvents").is_none());

        let restored: EntityCore = serde_json::from_value(json).unwrap();
        assert!(restored.pending_events().is_empty());
        assert_eq!(restored.tenant_id(), &tenant);
    }

    #[test]
    fn mark_updated_sets_timestamp() {
        let mut core = EntityCore::new(TenantId::new());
        core.mark_updated();
        assert!(core.updated_at().is_some());
    }
}
