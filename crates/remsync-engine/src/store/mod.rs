//! Persistence contracts and implementations.
//!
//! Three stores back the engine: bindings, documents, and the webhook
//! dedup window. Each has a Postgres implementation for production and an
//! in-memory implementation for demo mode and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use remsync_core::error::{RemoteError, SyncResult};
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::types::DocumentStatus;

use crate::binding::EntityBinding;
use crate::chain::ChainScope;
use crate::document::{NewDocument, SyncDocument};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryBindingStore, MemoryDedupStore, MemoryDocumentStore};
pub use postgres::{PgBindingStore, PgDedupStore, PgDocumentStore};

/// Store of entity bindings.
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Fetch a binding.
    async fn get(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<EntityBinding>>;

    /// Insert or update a binding.
    async fn upsert(&self, binding: &EntityBinding) -> SyncResult<()>;

    /// Locate a binding by the remote identifier.
    async fn find_by_remote_id(
        &self,
        integration: &IntegrationId,
        remote_id: &str,
    ) -> SyncResult<Option<EntityBinding>>;

    /// Locate a binding by entity handle across tenants, for ingress
    /// references that echo the locally-embedded marker.
    async fn find_by_entity(
        &self,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<EntityBinding>>;
}

/// Append-only store of sync documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a new pending document, assigning its monotonic id.
    ///
    /// Rejects a chain stamp whose (scope, index) slot is already taken.
    async fn create(&self, new: NewDocument) -> SyncResult<SyncDocument>;

    /// Record the response and final status, once.
    ///
    /// `retain_chain` keeps the chain slot; a failed or non-chainable
    /// document frees its slot again, provided it is still the head of its
    /// scope.
    async fn record_response(
        &self,
        id: i64,
        status: DocumentStatus,
        response: Option<Value>,
        errors: Vec<RemoteError>,
        retain_chain: bool,
    ) -> SyncResult<SyncDocument>;

    /// Move an accepted registration to cancelled.
    async fn mark_cancelled(&self, id: i64) -> SyncResult<SyncDocument>;

    /// Fetch one document.
    async fn get(&self, id: i64) -> SyncResult<Option<SyncDocument>>;

    /// Full submission history of an entity, in creation order.
    async fn history(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Vec<SyncDocument>>;

    /// The most recent document of an entity.
    async fn latest_for_entity(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<SyncDocument>>;

    /// The most recent document per entity under an integration.
    async fn latest_per_entity(
        &self,
        integration: &IntegrationId,
    ) -> SyncResult<Vec<SyncDocument>>;

    /// Find a document by its idempotency key.
    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> SyncResult<Option<SyncDocument>>;

    /// The document currently holding the highest chain index of a scope.
    async fn chain_head(&self, scope: &ChainScope) -> SyncResult<Option<SyncDocument>>;

    /// Document counts by status for an integration.
    async fn status_counts(
        &self,
        integration: &IntegrationId,
    ) -> SyncResult<BTreeMap<String, u64>>;
}

/// Webhook delivery deduplication over a bounded window.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Record a delivery; returns `false` when the same
    /// (integration, reference, event id) was already seen inside the
    /// window.
    async fn check_and_insert(
        &self,
        integration: &IntegrationId,
        reference: &str,
        event_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> SyncResult<bool>;
}
