//! PostgreSQL implementation of EntityStore.
//!
//! Every entity type shares one table. The tenant lives in its own column
//! so the isolation predicate is evaluated by the database:
//!
//! ```sql
//! CREATE TABLE tenant_entities (
//!     entity_type TEXT        NOT NULL,
//!     entity_key  TEXT        NOT NULL,
//!     tenant_id   UUID,
//!     body        JSONB       NOT NULL,
//!     updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (entity_type, entity_key)
//! );
//! ```

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::domain::foundation::{DomainError, ErrorCode, TenantId};
use crate::domain::tenancy::QueryScope;
use crate::ports::{EntityChange, EntityRow, EntityStore};

/// PostgreSQL implementation of [`EntityStore`].
#[derive(Clone)]
pub struct PostgresEntityStore {
    pool: PgPool,
}

impl PostgresEntityStore {
    /// Creates a new PostgresEntityStore over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DomainError> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .max_lifetime(config.max_lifetime())
            .connect(&config.url)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                DomainError::new(ErrorCode::DatabaseError, format!("Failed to connect: {}", e))
            })?;

        let store = Self::new(pool);
        if config.ensure_schema {
            store.ensure_schema().await?;
        }
        Ok(store)
    }

    /// Creates the entity table and its tenant index if missing.
    pub async fn ensure_schema(&self) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_entities (
                entity_type TEXT        NOT NULL,
                entity_key  TEXT        NOT NULL,
                tenant_id   UUID,
                body        JSONB       NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (entity_type, entity_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create tenant_entities", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tenant_entities_tenant
                ON tenant_entities (entity_type, tenant_id)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create tenant index", e))?;

        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    async fn load(
        &self,
        entity_type: &str,
        key: &str,
        scope: QueryScope,
    ) -> Result<Option<EntityRow>, DomainError> {
        let row = match scope {
            QueryScope::Tenant(tenant_id) => {
                sqlx::query(
                    r#"
                    SELECT entity_type, entity_key, tenant_id, body
                    FROM tenant_entities
                    WHERE entity_type = $1 AND entity_key = $2 AND tenant_id = $3
                    "#,
                )
                .bind(entity_type)
                .bind(key)
                .bind(tenant_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
            }
            QueryScope::Unrestricted => {
                sqlx::query(
                    r#"
                    SELECT entity_type, entity_key, tenant_id, body
                    FROM tenant_entities
                    WHERE entity_type = $1 AND entity_key = $2
                    "#,
                )
                .bind(entity_type)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| db_error("load entity", e))?;

        row.map(row_to_entity).transpose()
    }

    async fn query(&self, entity_type: &str, scope: QueryScope) -> Result<Vec<EntityRow>, DomainError> {
        let rows = match scope {
            QueryScope::Tenant(tenant_id) => {
                sqlx::query(
                    r#"
                    SELECT entity_type, entity_key, tenant_id, body
                    FROM tenant_entities
                    WHERE entity_type = $1 AND tenant_id = $2
                    ORDER BY entity_key
                    "#,
                )
                .bind(entity_type)
                .bind(tenant_id.as_uuid())
                .fetch_all(&self.pool)
                .await
            }
            QueryScope::Unrestricted => {
                sqlx::query(
                    r#"
                    SELECT entity_type, entity_key, tenant_id, body
                    FROM tenant_entities
                    WHERE entity_type = $1
                    ORDER BY entity_key
                    "#,
                )
                .bind(entity_type)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| db_error("query entities", e))?;

        rows.into_iter().map(row_to_entity).collect()
    }

    async fn commit(&self, changes: Vec<EntityChange>) -> Result<usize, DomainError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| commit_error("begin transaction", e))?;

        let written = changes.len();
        for change in &changes {
            match change {
                EntityChange::Upsert(row) => upsert_row(&mut tx, row).await?,
                EntityChange::Delete {
                    entity_type,
                    key,
                    tenant_id,
                } => {
                    sqlx::query(
                        r#"
                        DELETE FROM tenant_entities
                        WHERE entity_type = $1
                          AND entity_key = $2
                          AND tenant_id IS NOT DISTINCT FROM $3
                        "#,
                    )
                    .bind(entity_type)
                    .bind(key)
                    .bind(tenant_id.map(Uuid::from))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| commit_error("delete entity", e))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| commit_error("commit transaction", e))?;

        Ok(written)
    }

    async fn ping(&self) -> Result<(), DomainError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("ping", e))?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Helper functions
// ════════════════════════════════════════════════════════════════════════════

/// Inserts or replaces a row. A row with the same key owned by another
/// tenant is never overwritten: the conditional update matches nothing and
/// the whole transaction is rolled back.
async fn upsert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    row: &EntityRow,
) -> Result<(), DomainError> {
    let result = sqlx::query(
        r#"
        INSERT INTO tenant_entities (entity_type, entity_key, tenant_id, body, updated_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (entity_type, entity_key) DO UPDATE
            SET body = EXCLUDED.body,
                updated_at = now()
            WHERE tenant_entities.tenant_id IS NOT DISTINCT FROM EXCLUDED.tenant_id
        "#,
    )
    .bind(&row.entity_type)
    .bind(&row.key)
    .bind(row.tenant_id.map(Uuid::from))
    .bind(&row.body)
    .execute(&mut **tx)
    .await
    .map_err(|e| commit_error("upsert entity", e))?;

    if result.rows_affected() == 0 {
        tracing::warn!(
            entity_type = %row.entity_type,
            key = %row.key,
            "Upsert matched a row owned by another tenant"
        );
        return Err(DomainError::key_conflict(&row.entity_type, &row.key));
    }

    Ok(())
}

fn row_to_entity(row: PgRow) -> Result<EntityRow, DomainError> {
    let entity_type: String = row
        .try_get("entity_type")
        .map_err(|e| db_error("get entity_type", e))?;
    let key: String = row
        .try_get("entity_key")
        .map_err(|e| db_error("get entity_key", e))?;
    let tenant_uuid: Option<Uuid> = row
        .try_get("tenant_id")
        .map_err(|e| db_error("get tenant_id", e))?;
    let body: serde_json::Value = row.try_get("body").map_err(|e| db_error("get body", e))?;

    let tenant_id = tenant_uuid.map(TenantId::from_uuid).transpose()?;

    Ok(EntityRow {
        entity_type,
        key,
        tenant_id,
        body,
    })
}

fn db_error(action: &str, e: sqlx::Error) -> DomainError {
    tracing::error!(error = %e, "Failed to {}", action);
    DomainError::new(ErrorCode::DatabaseError, format!("Failed to {}: {}", action, e))
}

fn commit_error(action: &str, e: sqlx::Error) -> DomainError {
    tracing::error!(error = %e, "Failed to {}", action);
    DomainError::new(ErrorCode::CommitFailed, format!("Failed to {}: {}", action, e))
}
