//! In-memory entity store for testing.
//!
//! Rows live in one ordered map behind a mutex. A commit is applied to a
//! copy of the map and swapped in only if every change succeeds, so a
//! failed commit leaves the store untouched.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::domain::foundation::{DomainError, ErrorCode};
use crate::domain::tenancy::QueryScope;
use crate::ports::{EntityChange, EntityRow, EntityStore};

type RowKey = (String, String);

/// In-memory [`EntityStore`].
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryEntityStore::new());
/// store.fail_next_commit();           // simulate a write failure
/// assert!(uow.save_changes().await.is_err());
/// ```
#[derive(Default)]
pub struct InMemoryEntityStore {
    rows: Mutex<BTreeMap<RowKey, EntityRow>>,
    fail_next_commit: AtomicBool,
    commits: Mutex<usize>,
}

impl InMemoryEntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // === Test Helpers ===

    /// Makes the next `commit` fail with `CommitFailed`.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Total number of stored rows across all tenants.
    pub fn row_count(&self) -> usize {
        self.lock_rows().len()
    }

    /// Every stored row, regardless of tenant.
    pub fn all_rows(&self) -> Vec<EntityRow> {
        self.lock_rows().values().cloned().collect()
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        *self.commits.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_rows(&self) -> MutexGuard<'_, BTreeMap<RowKey, EntityRow>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn load(
        &self,
        entity_type: &str,
        key: &str,
        scope: QueryScope,
    ) -> Result<Option<EntityRow>, DomainError> {
        let rows = self.lock_rows();
        Ok(rows
            .get(&(entity_type.to_string(), key.to_string()))
            .filter(|row| scope.admits(row.tenant_id.as_ref()))
            .cloned())
    }

    async fn query(&self, entity_type: &str, scope: QueryScope) -> Result<Vec<EntityRow>, DomainError> {
        let rows = self.lock_rows();
        Ok(rows
            .values()
            .filter(|row| row.entity_type == entity_type)
            .filter(|row| scope.admits(row.tenant_id.as_ref()))
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: Vec<EntityChange>) -> Result<usize, DomainError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DomainError::new(
                ErrorCode::CommitFailed,
                "Simulated commit failure",
            ));
        }

        let mut rows = self.lock_rows();
        let mut staged = rows.clone();
        let written = changes.len();

        for change in changes {
            let row_key = (change.entity_type().to_string(), change.key().to_string());
            match change {
                EntityChange::Upsert(row) => {
                    if let Some(existing) = staged.get(&row_key) {
                        if existing.tenant_id != row.tenant_id {
                            return Err(DomainError::key_conflict(&row.entity_type, &row.key));
                        }
                    }
                    staged.insert(row_key, row);
                }
                EntityChange::Delete { tenant_id, .. } => {
                    if staged.get(&row_key).is_some_and(|existing| existing.tenant_id == tenant_id) {
                        staged.remove(&row_key);
                    }
                }
            }
        }

        *rows = staged;
        *self.commits.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(written)
    }

    async fn ping(&self) -> Result<(), DomainError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::TenantId;
    use serde_json::json;

    fn row(key: &str, tenant_id: Option<TenantId>) -> EntityRow {
        EntityRow {
            entity_type: "Order".to_string(),
            key: key.to_string(),
            tenant_id,
            body: json!({ "id": key }),
        }
    }

    #[tokio::test]
    async fn query_applies_tenant_scope() {
        let store = InMemoryEntityStore::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        store
            .commit(vec![
                EntityChange::Upsert(row("o-1", Some(tenant_a))),
                EntityChange::Upsert(row("o-2", Some(tenant_b))),
            ])
            .await
            .unwrap();

        let rows = store.query("Order", QueryScope::Tenant(tenant_a)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "o-1");

        let all = store.query("Order", QueryScope::Unrestricted).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn load_hides_rows_of_other_tenants() {
        let store = InMemoryEntityStore::new();
        let tenant = TenantId::new();
        store
            .commit(vec![EntityChange::Upsert(row("o-1", Some(tenant)))])
            .await
            .unwrap();

        let hidden = store
            .load("Order", "o-1", QueryScope::Tenant(TenantId::new()))
            .await
            .unwrap();
        assert!(hidden.is_none());

        let visible = store.load("Order", "o-1", QueryScope::Tenant(tenant)).await.unwrap();
        assert!(visible.is_some());
    }

    #[tokio::test]
    async fn failed_commit_writes_nothing() {
        let store = InMemoryEntityStore::new();
        store.fail_next_commit();

        let result = store
            .commit(vec![EntityChange::Upsert(row("o-1", None))])
            .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::CommitFailed);
        assert_eq!(store.row_count(), 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn conflicting_owner_rolls_back_whole_commit() {
        let store = InMemoryEntityStore::new();
        let owner = TenantId::new();
        store
            .commit(vec![EntityChange::Upsert(row("o-1", Some(owner)))])
            .await
            .unwrap();

        let result = store
            .commit(vec![
                EntityChange::Upsert(row("o-2", Some(owner))),
                EntityChange::Upsert(row("o-1", Some(TenantId::new()))),
            ])
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::KeyConflict);
        assert!(!err.is_retryable());
        assert!(!err.message.contains("tenant"));
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_only_owned_rows() {
        let store = InMemoryEntityStore::new();
        let owner = TenantId::new();
        store
            .commit(vec![EntityChange::Upsert(row("o-1", Some(owner)))])
            .await
            .unwrap();

        store
            .commit(vec![EntityChange::Delete {
                entity_type: "Order".to_string(),
                key: "o-1".to_string(),
                tenant_id: Some(TenantId::new()),
            }])
            .await
            .unwrap();
        assert_eq!(store.row_count(), 1);

        store
            .commit(vec![EntityChange::Delete {
                entity_type: "Order".to_string(),
                key: "o-1".to_string(),
                tenant_id: Some(owner),
            }])
            .await
            .unwrap();
        assert_eq!(store.row_count(), 0);
    }
}
