//! UnitOfWork - Tracks entities for one logical unit of work.
//!
//! A unit of work owns its [`TenantContext`], an identity map of tracked
//! entities, and a handle to the storage backend. Every read of a
//! tenant-scoped type goes through the type's [`TenantFilter`]: the filter
//! is pushed to the backend as a tenant constraint and evaluated again on
//! each decoded entity. There is no unfiltered read path.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(store, pipeline);
//! uow.set_tenant(tenant_id);
//!
//! uow.add(Order::place(tenant_id, "SO-1"))?;      // raises OrderCreated
//! let outcome = uow.save_changes().await?;         // commit, then publish
//!
//! let orders = uow.query::<Order>().await?;        // only this tenant's orders
//! ```

use std::any::Any;
use std::sync::Arc;

use crate::application::event_pipeline::{SaveOutcome, TransactionalEventPipeline};
use crate::domain::foundation::{DomainError, ErrorCode, PendingEvent, TenantId};
use crate::domain::tenancy::{IsolationPredicateFactory, Persisted, TenantContext};
use crate::ports::{EntityChange, EntityRow, EntityStore, TransactionalStore};

/// Change state of a tracked entity relative to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// New, not yet written.
    Added,
    /// Loaded (or attached) and changed since.
    Modified,
    /// Marked for removal at the next commit.
    Deleted,
    /// Identical to what the backend holds.
    Unchanged,
}

/// Type-erased view of a tracked entity.
trait TrackedEntity: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn pending_events(&self) -> &[PendingEvent];
    fn clear_pending_events(&mut self);
    fn to_row(&self) -> Result<EntityRow, DomainError>;
    fn owner(&self) -> Option<TenantId>;
}

impl<T: Persisted> TrackedEntity for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn pending_events(&self) -> &[PendingEvent] {
        Persisted::pending_events(self)
    }

    fn clear_pending_events(&mut self) {
        Persisted::clear_pending_events(self)
    }

    fn to_row(&self) -> Result<EntityRow, DomainError> {
        Ok(EntityRow {
            entity_type: T::ENTITY_NAME.to_string(),
            key: self.entity_key(),
            tenant_id: IsolationPredicateFactory::owner_of(self),
            body: serde_json::to_value(self)?,
        })
    }

    fn owner(&self) -> Option<TenantId> {
        IsolationPredicateFactory::owner_of(self)
    }
}

struct Entry {
    entity_type: &'static str,
    key: String,
    state: EntryState,
    entity: Box<dyn TrackedEntity>,
}

impl Entry {
    fn is(&self, entity_type: &str, key: &str) -> bool {
        self.entity_type == entity_type && self.key == key
    }

    fn change(&self) -> Result<Option<EntityChange>, DomainError> {
        match self.state {
            EntryState::Unchanged => Ok(None),
            EntryState::Added | EntryState::Modified => {
                Ok(Some(EntityChange::Upsert(self.entity.to_row()?)))
            }
            EntryState::Deleted => Ok(Some(EntityChange::Delete {
                entity_type: self.entity_type.to_string(),
                key: self.key.clone(),
                tenant_id: self.entity.owner(),
            })),
        }
    }
}

/// Identity map plus change tracking over an [`EntityStore`].
pub struct UnitOfWork {
    tenant: TenantContext,
    store: Arc<dyn EntityStore>,
    pipeline: Arc<TransactionalEventPipeline>,
    entries: Vec<Entry>,
}

impl UnitOfWork {
    /// Creates a unit of work with no tenant set.
    pub fn new(store: Arc<dyn EntityStore>, pipeline: Arc<TransactionalEventPipeline>) -> Self {
        Self {
            tenant: TenantContext::new(),
            store,
            pipeline,
            entries: Vec::new(),
        }
    }

    /// Creates a unit of work bound to `tenant_id`.
    pub fn for_tenant(
        tenant_id: TenantId,
        store: Arc<dyn EntityStore>,
        pipeline: Arc<TransactionalEventPipeline>,
    ) -> Self {
        let mut uow = Self::new(store, pipeline);
        uow.set_tenant(tenant_id);
        uow
    }

    /// Sets the tenant for every subsequent operation.
    pub fn set_tenant(&mut self, tenant_id: TenantId) {
        self.tenant.set_tenant(tenant_id);
    }

    pub fn tenant_context(&self) -> &TenantContext {
        &self.tenant
    }

    /// Number of tracked entities in any state.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Tracking state of an entity, if tracked.
    pub fn entry_state<T: Persisted>(&self, key: &str) -> Option<EntryState> {
        self.position(T::ENTITY_NAME, key)
            .map(|index| self.entries[index].state)
    }

    /// Whether any tracked entity would be written by the next commit.
    pub fn has_changes(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.state != EntryState::Unchanged)
    }

    // ─────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────

    /// Starts tracking a new entity.
    ///
    /// # Errors
    ///
    /// - `TenantNotSet` / `CrossTenantAccess` for tenant-scoped types
    /// - `ValidationFailed` if an entity with the same key is already tracked
    pub fn add<T: Persisted>(&mut self, entity: T) -> Result<(), DomainError> {
        self.ensure_writable(&entity)?;
        let key = entity.entity_key();

        match self.position(T::ENTITY_NAME, &key) {
            Some(index) if self.entries[index].state == EntryState::Deleted => {
                let entry = &mut self.entries[index];
                entry.entity = Box::new(entity);
                entry.state = EntryState::Modified;
                Ok(())
            }
            Some(_) => Err(DomainError::validation(
                "key",
                format!("{} '{}' is already tracked", T::ENTITY_NAME, key),
            )),
            None => {
                self.track(key, EntryState::Added, entity);
                Ok(())
            }
        }
    }

    /// Attaches an entity as modified, replacing any tracked instance.
    pub fn update<T: Persisted>(&mut self, entity: T) -> Result<(), DomainError> {
        self.ensure_writable(&entity)?;
        let key = entity.entity_key();

        match self.position(T::ENTITY_NAME, &key) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.entity = Box::new(entity);
                if entry.state != EntryState::Added {
                    entry.state = EntryState::Modified;
                }
            }
            None => self.track(key, EntryState::Modified, entity),
        }
        Ok(())
    }

    /// Marks an entity for removal at the next commit.
    ///
    /// Removing an entity that was added in this unit of work and never
    /// committed simply stops tracking it.
    pub fn remove<T: Persisted>(&mut self, entity: T) -> Result<(), DomainError> {
        self.ensure_writable(&entity)?;
        let key = entity.entity_key();

        match self.position(T::ENTITY_NAME, &key) {
            Some(index) if self.entries[index].state == EntryState::Added => {
                self.entries.remove(index);
            }
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.entity = Box::new(entity);
                entry.state = EntryState::Deleted;
            }
            None => self.track(key, EntryState::Deleted, entity),
        }
        Ok(())
    }

    /// Mutable access to a tracked entity. The entry becomes `Modified`
    /// unless it is `Added`.
    ///
    /// Returns `Ok(None)` when the entity is not tracked, is marked
    /// deleted, or belongs to another tenant.
    pub fn tracked_mut<T: Persisted>(&mut self, key: &str) -> Result<Option<&mut T>, DomainError> {
        let filter = IsolationPredicateFactory::build_filter::<T>();
        let Some(index) = self.position(T::ENTITY_NAME, key) else {
            return Ok(None);
        };

        let entry = &self.entries[index];
        if entry.state == EntryState::Deleted {
            return Ok(None);
        }
        if let (Some(filter), Some(entity)) = (filter, entry.entity.as_any().downcast_ref::<T>()) {
            if !filter.matches(entity, &self.tenant)? {
                return Ok(None);
            }
        }

        let entry = &mut self.entries[index];
        if entry.state == EntryState::Unchanged {
            entry.state = EntryState::Modified;
        }
        Ok(entry.entity.as_any_mut().downcast_mut::<T>())
    }

    // ─────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────

    /// Finds one entity by key, visible to the current tenant.
    ///
    /// Tracked instances take precedence over the backend.
    ///
    /// # Errors
    ///
    /// `TenantNotSet` for tenant-scoped types when no tenant is set, even
    /// if the entity is already tracked.
    pub async fn find<T: Persisted>(&mut self, key: &str) -> Result<Option<&T>, DomainError> {
        let scope = IsolationPredicateFactory::query_scope::<T>(&self.tenant)?;

        match self.position(T::ENTITY_NAME, key) {
            Some(index) if self.entries[index].state == EntryState::Deleted => Ok(None),
            Some(index) => self.visible(index),
            None => {
                let Some(row) = self.store.load(T::ENTITY_NAME, key, scope).await? else {
                    return Ok(None);
                };
                match self.decode_visible::<T>(row)? {
                    Some(entity) => {
                        self.track(key.to_string(), EntryState::Unchanged, entity);
                        self.visible(self.entries.len() - 1)
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Every entity of type `T` visible to the current tenant, in backend
    /// key order.
    pub async fn query<T: Persisted>(&mut self) -> Result<Vec<&T>, DomainError> {
        self.query_where::<T, _>(|_| true).await
    }

    /// Entities of type `T` visible to the current tenant that satisfy
    /// `predicate`. The tenant predicate is always applied first.
    pub async fn query_where<T, P>(&mut self, predicate: P) -> Result<Vec<&T>, DomainError>
    where
        T: Persisted,
        P: Fn(&T) -> bool,
    {
        let scope = IsolationPredicateFactory::query_scope::<T>(&self.tenant)?;
        let rows = self.store.query(T::ENTITY_NAME, scope).await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.key.clone();
            match self.position(T::ENTITY_NAME, &key) {
                Some(index) if self.entries[index].state == EntryState::Deleted => continue,
                Some(_) => keys.push(key),
                None => {
                    if let Some(entity) = self.decode_visible::<T>(row)? {
                        self.track(key.clone(), EntryState::Unchanged, entity);
                        keys.push(key);
                    }
                }
            }
        }

        let filter = IsolationPredicateFactory::build_filter::<T>();
        let mut results = Vec::with_capacity(keys.len());
        for key in &keys {
            let Some(index) = self.position(T::ENTITY_NAME, key) else {
                continue;
            };
            let Some(entity) = self.entries[index].entity.as_any().downcast_ref::<T>() else {
                continue;
            };
            if let Some(filter) = &filter {
                if !filter.matches(entity, &self.tenant)? {
                    continue;
                }
            }
            if predicate(entity) {
                results.push(entity);
            }
        }
        Ok(results)
    }

    // ─────────────────────────────────────────────────────────────────
    // Save
    // ─────────────────────────────────────────────────────────────────

    /// Commits tracked changes and publishes the harvested events.
    pub async fn save_changes(&mut self) -> Result<SaveOutcome, DomainError> {
        let pipeline = Arc::clone(&self.pipeline);
        pipeline.save(self).await
    }

    // ─────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────

    fn position(&self, entity_type: &str, key: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.is(entity_type, key))
    }

    fn track<T: Persisted>(&mut self, key: String, state: EntryState, entity: T) {
        self.entries.push(Entry {
            entity_type: T::ENTITY_NAME,
            key,
            state,
            entity: Box::new(entity),
        });
    }

    fn ensure_writable<T: Persisted>(&self, entity: &T) -> Result<(), DomainError> {
        match IsolationPredicateFactory::build_filter::<T>() {
            Some(filter) => filter.ensure_owned(entity, &self.tenant).map_err(|err| {
                if err.code == ErrorCode::CrossTenantAccess {
                    tracing::warn!(
                        entity_type = T::ENTITY_NAME,
                        key = %entity.entity_key(),
                        "Rejected write of another tenant's entity"
                    );
                }
                err
            }),
            None => Ok(()),
        }
    }

    /// Tracked entity at `index` if it passes the tenant filter.
    fn visible<T: Persisted>(&self, index: usize) -> Result<Option<&T>, DomainError> {
        let Some(entity) = self.entries[index].entity.as_any().downcast_ref::<T>() else {
            return Ok(None);
        };
        match IsolationPredicateFactory::build_filter::<T>() {
            Some(filter) if !filter.matches(entity, &self.tenant)? => Ok(None),
            _ => Ok(Some(entity)),
        }
    }

    /// Decodes a backend row and re-checks the tenant predicate on it.
    fn decode_visible<T: Persisted>(&self, row: EntityRow) -> Result<Option<T>, DomainError> {
        let entity: T = serde_json::from_value(row.body).map_err(|err| {
            DomainError::new(
                ErrorCode::SerializationFailed,
                format!("Failed to decode {} '{}': {}", T::ENTITY_NAME, row.key, err),
            )
        })?;

        if let Some(filter) = IsolationPredicateFactory::build_filter::<T>() {
            if !filter.matches(&entity, &self.tenant)? {
                tracing::warn!(
                    entity_type = T::ENTITY_NAME,
                    key = %row.key,
                    "Backend returned a row outside the tenant scope"
                );
                return Ok(None);
            }
        }
        Ok(Some(entity))
    }
}

#[async_trait::async_trait]
impl TransactionalStore for UnitOfWork {
    fn harvest_pending_events(&self) -> Vec<PendingEvent> {
        self.entries
            .iter()
            .flat_map(|entry| entry.entity.pending_events().iter().cloned())
            .collect()
    }

    async fn commit(&mut self) -> Result<usize, DomainError> {
        let mut changes = Vec::new();
        for entry in &self.entries {
            if let Some(change) = entry.change()? {
                changes.push(change);
            }
        }

        if changes.is_empty() {
            tracing::debug!("Nothing to commit");
            return Ok(0);
        }

        let written = self.store.commit(changes).await?;

        self.entries.retain(|entry| entry.state != EntryState::Deleted);
        for entry in &mut self.entries {
            entry.state = EntryState::Unchanged;
        }
        Ok(written)
    }

    fn clear_pending_events(&mut self) {
        for entry in &mut self.entries {
            entry.entity.clear_pending_events();
        }
    }
}
