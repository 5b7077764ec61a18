//! Postgres stores.
//!
//! Runtime-bound sqlx queries against the three engine tables (see
//! `migrations/0001_init.sql`). Chain slot uniqueness rides on the partial
//! unique index over (integration, tenant, chain kind, chain index); the
//! write-once response invariant is enforced by guarding on `response_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use remsync_core::error::{RemoteError, SyncError, SyncResult};
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::types::DocumentStatus;

use crate::binding::EntityBinding;
use crate::chain::ChainScope;
use crate::document::{NewDocument, SyncDocument};
use crate::store::{BindingStore, DedupStore, DocumentStore};

fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> SyncError + '_ {
    move |e| SyncError::database_with_source(context.to_string(), e)
}

/// Postgres binding store.
pub struct PgBindingStore {
    pool: PgPool,
}

impl PgBindingStore {
    /// Create a store over a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_binding(row: &sqlx::postgres::PgRow) -> SyncResult<EntityBinding> {
        let integration: String = row.get("integration");
        let state: Option<String> = row.get("last_known_remote_state");
        Ok(EntityBinding {
            entity_id: EntityId::from_uuid(row.get::<Uuid, _>("entity_id")),
            tenant_id: TenantId::from_uuid(row.get::<Uuid, _>("tenant_id")),
            integration: integration
                .parse()
                .map_err(|e| SyncError::internal(format!("corrupt integration id: {e}")))?,
            remote_id: row.get("remote_id"),
            sync_required: row.get("sync_required"),
            last_known_remote_state: state
                .map(|s| {
                    s.parse()
                        .map_err(|e| SyncError::internal(format!("corrupt remote state: {e}")))
                })
                .transpose()?,
            version_stamp: row.get("version_stamp"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl BindingStore for PgBindingStore {
    #[instrument(skip(self))]
    async fn get(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<EntityBinding>> {
        let row = sqlx::query(
            r"
            SELECT tenant_id, integration, entity_id, remote_id, sync_required,
                   last_known_remote_state, version_stamp, created_at, updated_at
            FROM sync_entity_bindings
            WHERE tenant_id = $1 AND integration = $2 AND entity_id = $3
            ",
        )
        .bind(tenant_id.as_uuid())
        .bind(integration.as_str())
        .bind(entity_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("fetch binding"))?;

        row.as_ref().map(Self::row_to_binding).transpose()
    }

    #[instrument(skip(self, binding))]
    async fn upsert(&self, binding: &EntityBinding) -> SyncResult<()> {
        sqlx::query(
            r"
            INSERT INTO sync_entity_bindings (
                tenant_id, integration, entity_id, remote_id, sync_required,
                last_known_remote_state, version_stamp, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, integration, entity_id) DO UPDATE SET
                remote_id = EXCLUDED.remote_id,
                sync_required = EXCLUDED.sync_required,
                last_known_remote_state = EXCLUDED.last_known_remote_state,
                version_stamp = EXCLUDED.version_stamp,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(binding.tenant_id.as_uuid())
        .bind(binding.integration.as_str())
        .bind(binding.entity_id.as_uuid())
        .bind(&binding.remote_id)
        .bind(binding.sync_required)
        .bind(binding.last_known_remote_state.map(|s| s.as_str()))
        .bind(binding.version_stamp)
        .bind(binding.created_at)
        .bind(binding.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert binding"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_remote_id(
        &self,
        integration: &IntegrationId,
        remote_id: &str,
    ) -> SyncResult<Option<EntityBinding>> {
        let row = sqlx::query(
            r"
            SELECT tenant_id, integration, entity_id, remote_id, sync_required,
                   last_known_remote_state, version_stamp, created_at, updated_at
            FROM sync_entity_bindings
            WHERE integration = $1 AND remote_id = $2
            ",
        )
        .bind(integration.as_str())
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find binding by remote id"))?;

        row.as_ref().map(Self::row_to_binding).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_entity(
        &self,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<EntityBinding>> {
        let row = sqlx::query(
            r"
            SELECT tenant_id, integration, entity_id, remote_id, sync_required,
                   last_known_remote_state, version_stamp, created_at, updated_at
            FROM sync_entity_bindings
            WHERE integration = $1 AND entity_id = $2
            ",
        )
        .bind(integration.as_str())
        .bind(entity_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find binding by entity"))?;

        row.as_ref().map(Self::row_to_binding).transpose()
    }
}

/// Postgres document store.
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    /// Create a store over a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_document(row: &sqlx::postgres::PgRow) -> SyncResult<SyncDocument> {
        let integration: String = row.get("integration");
        let operation: String = row.get("operation");
        let status: String = row.get("status");
        let errors: Value = row.get("errors");
        Ok(SyncDocument {
            id: row.get("id"),
            tenant_id: TenantId::from_uuid(row.get::<Uuid, _>("tenant_id")),
            integration: integration
                .parse()
                .map_err(|e| SyncError::internal(format!("corrupt integration id: {e}")))?,
            entity_id: EntityId::from_uuid(row.get::<Uuid, _>("entity_id")),
            operation: operation
                .parse()
                .map_err(|e| SyncError::internal(format!("corrupt operation: {e}")))?,
            payload: row.get("payload"),
            response: row.get("response"),
            status: status
                .parse()
                .map_err(|e| SyncError::internal(format!("corrupt status: {e}")))?,
            errors: serde_json::from_value(errors)?,
            idempotency_key: row.get("idempotency_key"),
            chain_kind: row.get("chain_kind"),
            chain_index: row.get("chain_index"),
            predecessor_fingerprint: row.get("predecessor_fingerprint"),
            fingerprint: row.get("fingerprint"),
            created_at: row.get("created_at"),
            response_at: row.get("response_at"),
        })
    }

    const SELECT: &'static str = r"
        SELECT id, tenant_id, integration, entity_id, operation, payload, response,
               status, errors, idempotency_key, chain_kind, chain_index,
               predecessor_fingerprint, fingerprint, created_at, response_at
        FROM sync_documents
    ";
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[instrument(skip(self, new), fields(entity_id = %new.entity_id, operation = %new.operation))]
    async fn create(&self, new: NewDocument) -> SyncResult<SyncDocument> {
        let (chain_kind, chain_index, predecessor_fingerprint, fingerprint) = match &new.chain {
            Some(stamp) => (
                Some(stamp.kind.clone()),
                Some(stamp.index),
                stamp.predecessor_fingerprint.clone(),
                Some(stamp.fingerprint.clone()),
            ),
            None => (None, None, None, None),
        };

        let result = sqlx::query(
            r"
            INSERT INTO sync_documents (
                tenant_id, integration, entity_id, operation, payload, status,
                errors, idempotency_key, chain_kind, chain_index,
                predecessor_fingerprint, fingerprint, created_at
            ) VALUES ($1, $2, $3, $4, $5, 'pending', '[]'::jsonb, $6, $7, $8, $9, $10, NOW())
            RETURNING id, created_at
            ",
        )
        .bind(new.tenant_id.as_uuid())
        .bind(new.integration.as_str())
        .bind(new.entity_id.as_uuid())
        .bind(new.operation.as_str())
        .bind(&new.payload)
        .bind(&new.idempotency_key)
        .bind(&chain_kind)
        .bind(chain_index)
        .bind(&predecessor_fingerprint)
        .bind(&fingerprint)
        .fetch_one(&self.pool)
        .await;

        let row = match result {
            Ok(row) => row,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let scope = ChainScope::new(
                    new.integration.clone(),
                    new.tenant_id,
                    chain_kind.unwrap_or_default(),
                );
                return Err(SyncError::ChainConflict {
                    scope: scope.to_string(),
                    index: chain_index.unwrap_or_default(),
                });
            }
            Err(e) => return Err(SyncError::database_with_source("create document", e)),
        };

        let mut doc = SyncDocument::from_new(row.get("id"), new);
        doc.created_at = row.get("created_at");
        Ok(doc)
    }

    #[instrument(skip(self, response, errors))]
    async fn record_response(
        &self,
        id: i64,
        status: DocumentStatus,
        response: Option<Value>,
        errors: Vec<RemoteError>,
        retain_chain: bool,
    ) -> SyncResult<SyncDocument> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| SyncError::internal(format!("document {id} not found")))?;
        if current.is_finalized() {
            return Err(SyncError::DocumentFinalized { document_id: id });
        }
        if !current.status.can_transition_to(status) {
            return Err(SyncError::InvalidTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let errors_json = serde_json::to_value(&errors)?;
        sqlx::query(
            r"
            UPDATE sync_documents
            SET status = $2, response = $3, errors = $4, response_at = NOW()
            WHERE id = $1 AND response_at IS NULL
            ",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&response)
        .bind(&errors_json)
        .execute(&self.pool)
        .await
        .map_err(db_err("record response"))?;

        if !retain_chain && current.chain_index.is_some() {
            // Free the chain slot only while no successor chained onto it.
            sqlx::query(
                r"
                UPDATE sync_documents
                SET chain_index = NULL
                WHERE id = $1
                  AND chain_index = (
                    SELECT MAX(chain_index) FROM sync_documents
                    WHERE integration = $2 AND tenant_id = $3 AND chain_kind = $4
                  )
                ",
            )
            .bind(id)
            .bind(current.integration.as_str())
            .bind(current.tenant_id.as_uuid())
            .bind(&current.chain_kind)
            .execute(&self.pool)
            .await
            .map_err(db_err("release chain slot"))?;
        }

        self.get(id).await?.ok_or_else(|| {
            SyncError::internal(format!("document {id} vanished during finalization"))
        })
    }

    #[instrument(skip(self))]
    async fn mark_cancelled(&self, id: i64) -> SyncResult<SyncDocument> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| SyncError::internal(format!("document {id} not found")))?;
        if !current.status.can_transition_to(DocumentStatus::Cancelled) {
            return Err(SyncError::InvalidTransition {
                from: current.status.to_string(),
                to: DocumentStatus::Cancelled.to_string(),
            });
        }

        sqlx::query("UPDATE sync_documents SET status = 'cancelled' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("mark cancelled"))?;

        self.get(id).await?.ok_or_else(|| {
            SyncError::internal(format!("document {id} vanished during cancellation"))
        })
    }

    #[instrument(skip(self))]
    async fn get(&self, id: i64) -> SyncResult<Option<SyncDocument>> {
        let row = sqlx::query(&format!("{} WHERE id = $1", Self::SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("fetch document"))?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    #[instrument(skip(self))]
    async fn history(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Vec<SyncDocument>> {
        let rows = sqlx::query(&format!(
            "{} WHERE tenant_id = $1 AND integration = $2 AND entity_id = $3 ORDER BY id",
            Self::SELECT
        ))
        .bind(tenant_id.as_uuid())
        .bind(integration.as_str())
        .bind(entity_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("fetch history"))?;

        rows.iter().map(Self::row_to_document).collect()
    }

    #[instrument(skip(self))]
    async fn latest_for_entity(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<SyncDocument>> {
        let row = sqlx::query(&format!(
            "{} WHERE tenant_id = $1 AND integration = $2 AND entity_id = $3 ORDER BY id DESC LIMIT 1",
            Self::SELECT
        ))
        .bind(tenant_id.as_uuid())
        .bind(integration.as_str())
        .bind(entity_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("fetch latest document"))?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    #[instrument(skip(self))]
    async fn latest_per_entity(
        &self,
        integration: &IntegrationId,
    ) -> SyncResult<Vec<SyncDocument>> {
        let rows = sqlx::query(&format!(
            r"{} WHERE id IN (
                SELECT MAX(id) FROM sync_documents
                WHERE integration = $1
                GROUP BY tenant_id, entity_id
            ) ORDER BY id",
            Self::SELECT
        ))
        .bind(integration.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("fetch latest documents"))?;

        rows.iter().map(Self::row_to_document).collect()
    }

    #[instrument(skip(self, key))]
    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> SyncResult<Option<SyncDocument>> {
        let row = sqlx::query(&format!(
            "{} WHERE tenant_id = $1 AND idempotency_key = $2 ORDER BY id DESC LIMIT 1",
            Self::SELECT
        ))
        .bind(tenant_id.as_uuid())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find by idempotency key"))?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    #[instrument(skip(self))]
    async fn chain_head(&self, scope: &ChainScope) -> SyncResult<Option<SyncDocument>> {
        let row = sqlx::query(&format!(
            r"{} WHERE integration = $1 AND tenant_id = $2 AND chain_kind = $3
                 AND chain_index IS NOT NULL
              ORDER BY chain_index DESC LIMIT 1",
            Self::SELECT
        ))
        .bind(scope.integration.as_str())
        .bind(scope.tenant_id.as_uuid())
        .bind(&scope.kind)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("fetch chain head"))?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    #[instrument(skip(self))]
    async fn status_counts(
        &self,
        integration: &IntegrationId,
    ) -> SyncResult<BTreeMap<String, u64>> {
        let rows = sqlx::query(
            r"
            SELECT status, COUNT(*) AS count
            FROM sync_documents
            WHERE integration = $1
            GROUP BY status
            ",
        )
        .bind(integration.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("count documents"))?;

        Ok(rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                let count: i64 = row.get("count");
                (status, count.max(0) as u64)
            })
            .collect())
    }
}

/// Postgres webhook dedup window.
pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    /// Create a store over a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    #[instrument(skip(self))]
    async fn check_and_insert(
        &self,
        integration: &IntegrationId,
        reference: &str,
        event_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> SyncResult<bool> {
        let window_secs = i64::try_from(window.as_secs())
            .map_err(|_| SyncError::internal("dedup window overflow"))?;

        sqlx::query(
            r"
            DELETE FROM sync_webhook_events
            WHERE received_at < $1 - ($2 * INTERVAL '1 second')
            ",
        )
        .bind(now)
        .bind(window_secs)
        .execute(&self.pool)
        .await
        .map_err(db_err("prune webhook events"))?;

        let result = sqlx::query(
            r"
            INSERT INTO sync_webhook_events (integration, reference, event_id, received_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (integration, reference, event_id) DO NOTHING
            ",
        )
        .bind(integration.as_str())
        .bind(reference)
        .bind(event_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert webhook event"))?;

        Ok(result.rows_affected() == 1)
    }
}
