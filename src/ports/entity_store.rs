//! EntityStore port - Row storage backend for the unit of work.
//!
//! Entities are stored as JSON documents keyed by `(entity_type, key)`
//! with the owning tenant in its own column, so the tenant predicate can
//! be evaluated by the backend.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::domain::foundation::{DomainError, TenantId};
use crate::domain::tenancy::QueryScope;

/// One stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub entity_type: String,
    pub key: String,
    /// `None` for tenant-exempt entity types.
    pub tenant_id: Option<TenantId>,
    pub body: JsonValue,
}

/// A single write inside a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    /// Insert or replace the row.
    Upsert(EntityRow),
    /// Remove the row if present.
    Delete {
        entity_type: String,
        key: String,
        tenant_id: Option<TenantId>,
    },
}

impl EntityChange {
    pub fn entity_type(&self) -> &str {
        match self {
            EntityChange::Upsert(row) => &row.entity_type,
            EntityChange::Delete { entity_type, .. } => entity_type,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            EntityChange::Upsert(row) => &row.key,
            EntityChange::Delete { key, .. } => key,
        }
    }
}

/// Storage backend for tracked entities.
///
/// Every read takes a [`QueryScope`]; the backend must apply it as a
/// tenant column constraint. There is no unscoped read.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Load one row by key within the scope.
    async fn load(
        &self,
        entity_type: &str,
        key: &str,
        scope: QueryScope,
    ) -> Result<Option<EntityRow>, DomainError>;

    /// All rows of a type within the scope, ordered by key.
    async fn query(&self, entity_type: &str, scope: QueryScope) -> Result<Vec<EntityRow>, DomainError>;

    /// Apply all changes in one transaction. Either every change is
    /// written or none is.
    ///
    /// # Errors
    ///
    /// `CommitFailed` or `DatabaseError` when the transaction cannot be
    /// completed.
    async fn commit(&self, changes: Vec<EntityChange>) -> Result<usize, DomainError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), DomainError>;
}
