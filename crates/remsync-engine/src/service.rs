//! Collaborator facade.
//!
//! The surface the host application talks to: submit syncs, force queries,
//! read history, install credentials, read per-integration stats. The
//! facade owns nothing; it routes to the orchestrator and stores.

use std::collections::BTreeMap;
use std::sync::Arc;

use remsync_core::credentials::{Credential, CredentialStore};
use remsync_core::error::SyncResult;
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::snapshot::Snapshot;
use remsync_core::types::{Mode, SyncOperation};

use crate::document::SyncDocument;
use crate::orchestrator::Orchestrator;
use crate::store::DocumentStore;

/// The collaborator-facing API of the sync engine.
pub struct SyncService {
    orchestrator: Arc<Orchestrator>,
    documents: Arc<dyn DocumentStore>,
    credentials: Arc<dyn CredentialStore>,
}

impl SyncService {
    /// Create a service.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        documents: Arc<dyn DocumentStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            orchestrator,
            documents,
            credentials,
        }
    }

    /// Enqueue a push, update or cancellation.
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
        snapshot: &Snapshot,
        operation: SyncOperation,
    ) -> SyncResult<SyncDocument> {
        self.orchestrator
            .submit(tenant_id, integration, entity_id, snapshot, operation)
            .await
    }

    /// Force a status query.
    pub async fn query(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<SyncDocument> {
        self.orchestrator.query(tenant_id, integration, entity_id).await
    }

    /// Read the submission history of an entity.
    pub async fn history(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Vec<SyncDocument>> {
        self.documents.history(tenant_id, integration, entity_id).await
    }

    /// Install secrets for an integration and mode.
    pub async fn set_credentials(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        credential: Credential,
    ) -> SyncResult<()> {
        self.credentials.set(integration, mode, credential).await
    }

    /// Flag an entity as modified so the next push is due.
    pub async fn mark_modified(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<()> {
        self.orchestrator
            .mark_modified(tenant_id, integration, entity_id)
            .await
    }

    /// Deactivate remotely and drop the binding.
    pub async fn unbind(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
        snapshot: &Snapshot,
    ) -> SyncResult<()> {
        self.orchestrator
            .unbind(tenant_id, integration, entity_id, snapshot)
            .await
    }

    /// Document counts by status for an integration.
    pub async fn stats(&self, integration: &IntegrationId) -> SyncResult<BTreeMap<String, u64>> {
        self.documents.status_counts(integration).await
    }
}
