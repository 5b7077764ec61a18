//! In-memory stores.
//!
//! Back demo mode and tests. Same contracts and invariant enforcement as
//! the Postgres stores, including chain slot uniqueness and write-once
//! responses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use remsync_core::error::{RemoteError, SyncError, SyncResult};
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::types::DocumentStatus;

use crate::binding::EntityBinding;
use crate::chain::ChainScope;
use crate::document::{NewDocument, SyncDocument};
use crate::store::{BindingStore, DedupStore, DocumentStore};

/// In-memory binding store.
#[derive(Debug, Default)]
pub struct MemoryBindingStore {
    bindings: RwLock<HashMap<(TenantId, IntegrationId, EntityId), EntityBinding>>,
}

impl MemoryBindingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingStore for MemoryBindingStore {
    async fn get(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<EntityBinding>> {
        let bindings = self.bindings.read().await;
        Ok(bindings
            .get(&(tenant_id, integration.clone(), entity_id))
            .cloned())
    }

    async fn upsert(&self, binding: &EntityBinding) -> SyncResult<()> {
        let mut bindings = self.bindings.write().await;
        bindings.insert(
            (
                binding.tenant_id,
                binding.integration.clone(),
                binding.entity_id,
            ),
            binding.clone(),
        );
        Ok(())
    }

    async fn find_by_remote_id(
        &self,
        integration: &IntegrationId,
        remote_id: &str,
    ) -> SyncResult<Option<EntityBinding>> {
        let bindings = self.bindings.read().await;
        Ok(bindings
            .values()
            .find(|b| b.integration == *integration && b.remote_id.as_deref() == Some(remote_id))
            .cloned())
    }

    async fn find_by_entity(
        &self,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<EntityBinding>> {
        let bindings = self.bindings.read().await;
        Ok(bindings
            .values()
            .find(|b| b.integration == *integration && b.entity_id == entity_id)
            .cloned())
    }
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<Vec<SyncDocument>>,
    next_id: AtomicI64,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn scope_of(doc: &SyncDocument) -> Option<ChainScope> {
        doc.chain_kind.as_ref().map(|kind| {
            ChainScope::new(doc.integration.clone(), doc.tenant_id, kind.clone())
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, new: NewDocument) -> SyncResult<SyncDocument> {
        let mut documents = self.documents.write().await;

        if let Some(stamp) = &new.chain {
            let scope = ChainScope::new(new.integration.clone(), new.tenant_id, stamp.kind.clone());
            let taken = documents.iter().any(|d| {
                d.chain_index == Some(stamp.index)
                    && Self::scope_of(d).as_ref() == Some(&scope)
            });
            if taken {
                return Err(SyncError::ChainConflict {
                    scope: scope.to_string(),
                    index: stamp.index,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let doc = SyncDocument::from_new(id, new);
        documents.push(doc.clone());
        Ok(doc)
    }

    async fn record_response(
        &self,
        id: i64,
        status: DocumentStatus,
        response: Option<Value>,
        errors: Vec<RemoteError>,
        retain_chain: bool,
    ) -> SyncResult<SyncDocument> {
        let mut documents = self.documents.write().await;

        // The head check needs an immutable pass before the mutable borrow.
        let free_slot = {
            let doc = documents
                .iter()
                .find(|d| d.id == id)
                .ok_or_else(|| SyncError::internal(format!("document {id} not found")))?;
            match (&doc.chain_index, retain_chain) {
                (Some(index), false) => {
                    let scope = Self::scope_of(doc);
                    let max_index = documents
                        .iter()
                        .filter(|d| Self::scope_of(d) == scope)
                        .filter_map(|d| d.chain_index)
                        .max();
                    // Free the slot only while no successor chained onto it.
                    max_index == Some(*index)
                }
                _ => false,
            }
        };

        let doc = documents
            .iter_mut()
            .find(|d| d.id == id)
            .expect("checked above");
        doc.finalize(status, response, errors)?;
        if free_slot {
            doc.chain_index = None;
        }
        Ok(doc.clone())
    }

    async fn mark_cancelled(&self, id: i64) -> SyncResult<SyncDocument> {
        let mut documents = self.documents.write().await;
        let doc = documents
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| SyncError::internal(format!("document {id} not found")))?;
        doc.cancel()?;
        Ok(doc.clone())
    }

    async fn get(&self, id: i64) -> SyncResult<Option<SyncDocument>> {
        let documents = self.documents.read().await;
        Ok(documents.iter().find(|d| d.id == id).cloned())
    }

    async fn history(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Vec<SyncDocument>> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter(|d| {
                d.tenant_id == tenant_id
                    && d.integration == *integration
                    && d.entity_id == entity_id
            })
            .cloned()
            .collect())
    }

    async fn latest_for_entity(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<Option<SyncDocument>> {
        Ok(self
            .history(tenant_id, integration, entity_id)
            .await?
            .into_iter()
            .last())
    }

    async fn latest_per_entity(
        &self,
        integration: &IntegrationId,
    ) -> SyncResult<Vec<SyncDocument>> {
        let documents = self.documents.read().await;
        let mut latest: BTreeMap<(TenantId, EntityId), SyncDocument> = BTreeMap::new();
        for doc in documents.iter().filter(|d| d.integration == *integration) {
            latest.insert((doc.tenant_id, doc.entity_id), doc.clone());
        }
        Ok(latest.into_values().collect())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> SyncResult<Option<SyncDocument>> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.idempotency_key.as_deref() == Some(key))
            .last()
            .cloned())
    }

    async fn chain_head(&self, scope: &ChainScope) -> SyncResult<Option<SyncDocument>> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter(|d| Self::scope_of(d).as_ref() == Some(scope) && d.chain_index.is_some())
            .max_by_key(|d| d.chain_index)
            .cloned())
    }

    async fn status_counts(
        &self,
        integration: &IntegrationId,
    ) -> SyncResult<BTreeMap<String, u64>> {
        let documents = self.documents.read().await;
        let mut counts = BTreeMap::new();
        for doc in documents.iter().filter(|d| d.integration == *integration) {
            *counts.entry(doc.status.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// In-memory webhook dedup window.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    seen: RwLock<HashMap<(IntegrationId, String, String), DateTime<Utc>>>,
}

impl MemoryDedupStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_insert(
        &self,
        integration: &IntegrationId,
        reference: &str,
        event_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> SyncResult<bool> {
        let mut seen = self.seen.write().await;
        let window = chrono::Duration::from_std(window)
            .map_err(|e| SyncError::internal(format!("invalid dedup window: {e}")))?;

        seen.retain(|_, received_at| now.signed_duration_since(*received_at) <= window);

        let key = (integration.clone(), reference.to_string(), event_id.to_string());
        if seen.contains_key(&key) {
            return Ok(false);
        }
        seen.insert(key, now);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ChainStamp;
    use remsync_core::types::SyncOperation;
    use serde_json::json;

    fn new_doc(tenant: TenantId, entity: EntityId, chain: Option<ChainStamp>) -> NewDocument {
        NewDocument {
            tenant_id: tenant,
            integration: IntegrationId::new("es-verifactu").unwrap(),
            entity_id: entity,
            operation: SyncOperation::Register,
            payload: json!({"serial": "INV-001"}),
            idempotency_key: None,
            chain,
        }
    }

    fn stamp(index: i64) -> ChainStamp {
        ChainStamp {
            kind: "sale".to_string(),
            index,
            predecessor_fingerprint: None,
            fingerprint: format!("F{index}"),
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = MemoryDocumentStore::new();
        let tenant = TenantId::new();
        let a = store.create(new_doc(tenant, EntityId::new(), None)).await.unwrap();
        let b = store.create(new_doc(tenant, EntityId::new(), None)).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_chain_slot_uniqueness() {
        let store = MemoryDocumentStore::new();
        let tenant = TenantId::new();
        store
            .create(new_doc(tenant, EntityId::new(), Some(stamp(0))))
            .await
            .unwrap();
        let err = store
            .create(new_doc(tenant, EntityId::new(), Some(stamp(0))))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ChainConflict { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_record_response_write_once() {
        let store = MemoryDocumentStore::new();
        let tenant = TenantId::new();
        let doc = store.create(new_doc(tenant, EntityId::new(), None)).await.unwrap();

        store
            .record_response(doc.id, DocumentStatus::Accepted, None, vec![], true)
            .await
            .unwrap();
        let err = store
            .record_response(doc.id, DocumentStatus::Rejected, None, vec![], false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DocumentFinalized { .. }));
    }

    #[tokio::test]
    async fn test_failed_head_frees_its_slot() {
        let store = MemoryDocumentStore::new();
        let tenant = TenantId::new();
        let scope = ChainScope::new(IntegrationId::new("es-verifactu").unwrap(), tenant, "sale");

        let doc = store
            .create(new_doc(tenant, EntityId::new(), Some(stamp(0))))
            .await
            .unwrap();
        store
            .record_response(doc.id, DocumentStatus::SendingFailed, None, vec![], false)
            .await
            .unwrap();

        // The slot is free again and the chain has no head.
        assert!(store.chain_head(&scope).await.unwrap().is_none());
        store
            .create(new_doc(tenant, EntityId::new(), Some(stamp(0))))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_chain_head_is_max_index() {
        let store = MemoryDocumentStore::new();
        let tenant = TenantId::new();
        let scope = ChainScope::new(IntegrationId::new("es-verifactu").unwrap(), tenant, "sale");

        for i in 0..3 {
            let doc = store
                .create(new_doc(tenant, EntityId::new(), Some(stamp(i))))
                .await
                .unwrap();
            store
                .record_response(doc.id, DocumentStatus::Accepted, None, vec![], true)
                .await
                .unwrap();
        }

        let head = store.chain_head(&scope).await.unwrap().unwrap();
        assert_eq!(head.chain_index, Some(2));
    }

    #[tokio::test]
    async fn test_latest_per_entity() {
        let store = MemoryDocumentStore::new();
        let tenant = TenantId::new();
        let entity = EntityId::new();
        let integration = IntegrationId::new("es-verifactu").unwrap();

        store.create(new_doc(tenant, entity, None)).await.unwrap();
        let second = store.create(new_doc(tenant, entity, None)).await.unwrap();

        let latest = store.latest_per_entity(&integration).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, second.id);
    }

    #[tokio::test]
    async fn test_dedup_window() {
        let store = MemoryDedupStore::new();
        let integration = IntegrationId::new("mx-ecpay").unwrap();
        let now = Utc::now();
        let window = Duration::from_secs(600);

        assert!(store
            .check_and_insert(&integration, "REF-1", "evt-1", now, window)
            .await
            .unwrap());
        // Same delivery inside the window is a duplicate.
        assert!(!store
            .check_and_insert(&integration, "REF-1", "evt-1", now + chrono::Duration::milliseconds(500), window)
            .await
            .unwrap());
        // A different event id is fresh.
        assert!(store
            .check_and_insert(&integration, "REF-1", "evt-2", now, window)
            .await
            .unwrap());
        // Outside the window the key is forgotten.
        assert!(store
            .check_and_insert(&integration, "REF-1", "evt-1", now + chrono::Duration::seconds(601), window)
            .await
            .unwrap());
    }
}
