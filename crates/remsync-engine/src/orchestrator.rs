//! Sync orchestrator.
//!
//! The per-entity state machine: unsynced -> pushing -> bound -> updating,
//! with cancellation out of bound and rejection leaving the entity in its
//! prior state. Each transition produces exactly one sync document.
//!
//! Transactional discipline: the pending document is persisted before the
//! transport call and the response is recorded after it, so a crash in
//! between is recoverable by the poller finding a stale pending document.
//! The entity lock is held across the transport call; the chain scope lock
//! spans document creation only.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use remsync_core::capability::{IntegrationRegistry, RegisteredIntegration};
use remsync_core::codec::{ChainContext, DecodedResponse};
use remsync_core::error::{RemoteError, SyncError, SyncResult};
use remsync_core::fingerprint;
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::snapshot::Snapshot;
use remsync_core::types::{DocumentStatus, HttpMethod, RemoteState, SyncOperation, WireResponse};
use remsync_transport::{EndpointResolver, Transport};

use crate::binder::IdentityBinder;
use crate::binding::EntityBinding;
use crate::chain::{ChainScope, EntityKey, LockRegistry};
use crate::document::{ChainStamp, NewDocument, SyncDocument};
use crate::store::{BindingStore, DocumentStore};

/// The integration-agnostic sync state machine.
pub struct Orchestrator {
    registry: Arc<IntegrationRegistry>,
    bindings: Arc<dyn BindingStore>,
    documents: Arc<dyn DocumentStore>,
    resolver: Arc<EndpointResolver>,
    transport: Arc<dyn Transport>,
    binder: IdentityBinder,
    entity_locks: Arc<LockRegistry<EntityKey>>,
    scope_locks: LockRegistry<ChainScope>,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        registry: Arc<IntegrationRegistry>,
        bindings: Arc<dyn BindingStore>,
        documents: Arc<dyn DocumentStore>,
        resolver: Arc<EndpointResolver>,
        transport: Arc<dyn Transport>,
        entity_locks: Arc<LockRegistry<EntityKey>>,
    ) -> Self {
        let binder = IdentityBinder::new(resolver.clone(), transport.clone());
        Self {
            registry,
            bindings,
            documents,
            resolver,
            transport,
            binder,
            entity_locks,
            scope_locks: LockRegistry::new(),
        }
    }

    /// Submit a push, update or cancellation for an entity.
    #[instrument(skip(self, snapshot), fields(tenant_id = %tenant_id, entity_id = %entity_id, integration = %integration))]
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
        snapshot: &Snapshot,
        operation: SyncOperation,
    ) -> SyncResult<SyncDocument> {
        let registered = self.registry.get(integration)?;
        match operation {
            SyncOperation::Register | SyncOperation::Update => {
                self.push(tenant_id, &registered, entity_id, snapshot, operation)
                    .await
            }
            SyncOperation::Cancel => self.cancel(tenant_id, &registered, entity_id, snapshot).await,
            SyncOperation::Query => self.query(tenant_id, integration, entity_id).await,
        }
    }

    /// Force a status query for a bound entity.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, entity_id = %entity_id, integration = %integration))]
    pub async fn query(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<SyncDocument> {
        let registered = self.registry.get(integration)?;
        let _guard = self
            .entity_locks
            .acquire((tenant_id, integration.clone(), entity_id))
            .await;

        let mut binding = self
            .bindings
            .get(tenant_id, integration, entity_id)
            .await?
            .ok_or(SyncError::NotBound { entity_id })?;
        let remote_id = binding
            .remote_id
            .clone()
            .ok_or(SyncError::NotBound { entity_id })?;

        let snapshot = Snapshot::new().with("remote_id", remote_id);
        let payload = registered
            .capability
            .codec
            .encode(&snapshot, SyncOperation::Query, None)?;

        let doc = self
            .documents
            .create(NewDocument {
                tenant_id,
                integration: integration.clone(),
                entity_id,
                operation: SyncOperation::Query,
                payload: payload.clone(),
                idempotency_key: None,
                chain: None,
            })
            .await?;

        match self
            .send(&registered, SyncOperation::Query, payload, None)
            .await
        {
            Ok(response) => {
                self.complete(&registered, &mut binding, doc, SyncOperation::Query, &response)
                    .await
            }
            Err(e) => self.record_failure(doc, e).await,
        }
    }

    /// Retry a non-chained sending-failed document with its original
    /// payload.
    #[instrument(skip(self, original), fields(document_id = original.id))]
    pub async fn resubmit(&self, original: &SyncDocument) -> SyncResult<SyncDocument> {
        let registered = self.registry.get(&original.integration)?;
        if registered.capability.chain_kind.is_some() {
            return Err(SyncError::internal(
                "chained submissions are re-encoded by the collaborator, not replayed",
            ));
        }

        let _guard = self
            .entity_locks
            .acquire((
                original.tenant_id,
                original.integration.clone(),
                original.entity_id,
            ))
            .await;

        let mut binding = self
            .bindings
            .get(original.tenant_id, &original.integration, original.entity_id)
            .await?
            .unwrap_or_else(|| {
                EntityBinding::new(
                    original.tenant_id,
                    original.integration.clone(),
                    original.entity_id,
                )
            });

        let doc = self
            .documents
            .create(NewDocument {
                tenant_id: original.tenant_id,
                integration: original.integration.clone(),
                entity_id: original.entity_id,
                operation: original.operation,
                payload: original.payload.clone(),
                idempotency_key: original.idempotency_key.clone(),
                chain: None,
            })
            .await?;

        match self
            .send(
                &registered,
                original.operation,
                original.payload.clone(),
                original.idempotency_key.as_deref(),
            )
            .await
        {
            Ok(response) => {
                self.complete(&registered, &mut binding, doc, original.operation, &response)
                    .await
            }
            Err(e) => self.record_failure(doc, e).await,
        }
    }

    /// Flag an entity as locally modified since its last successful push.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, entity_id = %entity_id, integration = %integration))]
    pub async fn mark_modified(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
    ) -> SyncResult<()> {
        self.registry.get(integration)?;
        let _guard = self
            .entity_locks
            .acquire((tenant_id, integration.clone(), entity_id))
            .await;
        let mut binding = self
            .bindings
            .get(tenant_id, integration, entity_id)
            .await?
            .unwrap_or_else(|| EntityBinding::new(tenant_id, integration.clone(), entity_id));
        binding.require_sync();
        self.bindings.upsert(&binding).await
    }

    /// Unbind an entity after issuing a remote deactivation.
    #[instrument(skip(self, snapshot), fields(tenant_id = %tenant_id, entity_id = %entity_id, integration = %integration))]
    pub async fn unbind(
        &self,
        tenant_id: TenantId,
        integration: &IntegrationId,
        entity_id: EntityId,
        snapshot: &Snapshot,
    ) -> SyncResult<()> {
        let cancellable = self
            .bindings
            .get(tenant_id, integration, entity_id)
            .await?
            .and_then(|b| b.last_known_remote_state)
            .is_some_and(|s| s.is_cancellable());
        if cancellable {
            self.submit(tenant_id, integration, entity_id, snapshot, SyncOperation::Cancel)
                .await?;
        }

        let _guard = self
            .entity_locks
            .acquire((tenant_id, integration.clone(), entity_id))
            .await;
        let mut binding = self
            .bindings
            .get(tenant_id, integration, entity_id)
            .await?
            .ok_or(SyncError::NotBound { entity_id })?;
        binding.unbind();
        self.bindings.upsert(&binding).await
    }

    // ------------------------------------------------------------------
    // Push (register / update)
    // ------------------------------------------------------------------

    async fn push(
        &self,
        tenant_id: TenantId,
        registered: &RegisteredIntegration,
        entity_id: EntityId,
        snapshot: &Snapshot,
        operation: SyncOperation,
    ) -> SyncResult<SyncDocument> {
        let capability = &registered.capability;
        let integration = capability.id.clone();
        let _guard = self
            .entity_locks
            .acquire((tenant_id, integration.clone(), entity_id))
            .await;

        let mut binding = self
            .bindings
            .get(tenant_id, &integration, entity_id)
            .await?
            .unwrap_or_else(|| EntityBinding::new(tenant_id, integration.clone(), entity_id));

        if operation == SyncOperation::Update && !binding.is_bound() {
            return Err(SyncError::NotBound { entity_id });
        }

        // Identity binding: look the entity up by metadata before creating
        // a remote duplicate.
        if operation == SyncOperation::Register && !binding.is_bound() {
            if let Some(remote_id) = self.binder.lookup(registered, snapshot, entity_id).await? {
                debug!(remote_id = %remote_id, "bound entity via remote search");
                binding.bind(remote_id)?;
            }
        }

        let base_payload = capability.codec.encode(snapshot, operation, None)?;
        let idempotency_key = fingerprint::idempotency_key(
            tenant_id,
            &integration,
            entity_id,
            operation,
            &base_payload,
        );

        // Idempotent push: an identical submission that is pending or
        // already acknowledged produces no second document.
        if let Some(existing) = self
            .documents
            .find_by_idempotency_key(tenant_id, &idempotency_key)
            .await?
        {
            if matches!(
                existing.status,
                DocumentStatus::Pending
                    | DocumentStatus::Sent
                    | DocumentStatus::Accepted
                    | DocumentStatus::RegisteredWithErrors
            ) {
                debug!(document_id = existing.id, "duplicate submission, reusing document");
                return Ok(existing);
            }
        }

        // Fail fast before any transport activity.
        let missing = capability.codec.validate(&base_payload, operation);
        if !missing.is_empty() {
            let doc = self
                .documents
                .create(NewDocument {
                    tenant_id,
                    integration: integration.clone(),
                    entity_id,
                    operation,
                    payload: base_payload,
                    idempotency_key: Some(idempotency_key),
                    chain: None,
                })
                .await?;
            self.documents
                .record_response(
                    doc.id,
                    DocumentStatus::SendingFailed,
                    None,
                    vec![RemoteError::new("payload-incomplete", missing.join(", "))],
                    false,
                )
                .await?;
            return Err(SyncError::PayloadIncomplete { missing });
        }

        // Pre-flight the endpoint so a configuration gap surfaces without
        // leaving a dangling pending document behind.
        self.resolver.url(registered, operation)?;

        binding.bump_version();
        self.bindings.upsert(&binding).await?;

        // Chain stamping under the scope lock; the lock spans document
        // creation but never the transport call.
        let (payload, chain) = match &capability.chain_kind {
            Some(kind) => {
                let scope = ChainScope::new(integration.clone(), tenant_id, kind.clone());
                let scope_guard = self.scope_locks.acquire(scope.clone()).await;
                let head = self.documents.chain_head(&scope).await?;
                let (index, predecessor_fingerprint, reference) = match &head {
                    Some(h) => (
                        h.chain_index.unwrap_or(0) + 1,
                        h.fingerprint.clone(),
                        Some(h.payload.clone()),
                    ),
                    None => (0, None, None),
                };
                let ctx = ChainContext {
                    chain_index: index,
                    predecessor_fingerprint: predecessor_fingerprint.clone(),
                    reference,
                };
                let payload = capability.codec.encode(snapshot, operation, Some(&ctx))?;
                let own = fingerprint::fingerprint(&payload, predecessor_fingerprint.as_deref());
                let stamp = ChainStamp {
                    kind: kind.clone(),
                    index,
                    predecessor_fingerprint,
                    fingerprint: own,
                };

                let doc = self
                    .documents
                    .create(NewDocument {
                        tenant_id,
                        integration: integration.clone(),
                        entity_id,
                        operation,
                        payload: payload.clone(),
                        idempotency_key: Some(idempotency_key.clone()),
                        chain: Some(stamp),
                    })
                    .await?;
                drop(scope_guard);
                return self
                    .dispatch(registered, &mut binding, doc, operation, payload, &idempotency_key)
                    .await;
            }
            None => (base_payload, None),
        };

        let doc = self
            .documents
            .create(NewDocument {
                tenant_id,
                integration: integration.clone(),
                entity_id,
                operation,
                payload: payload.clone(),
                idempotency_key: Some(idempotency_key.clone()),
                chain,
            })
            .await?;
        self.dispatch(registered, &mut binding, doc, operation, payload, &idempotency_key)
            .await
    }

    async fn dispatch(
        &self,
        registered: &RegisteredIntegration,
        binding: &mut EntityBinding,
        doc: SyncDocument,
        operation: SyncOperation,
        payload: Value,
        idempotency_key: &str,
    ) -> SyncResult<SyncDocument> {
        match self
            .send(registered, operation, payload, Some(idempotency_key))
            .await
        {
            Ok(response) => {
                self.complete(registered, binding, doc, operation, &response)
                    .await
            }
            Err(e) => self.record_failure(doc, e).await,
        }
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    async fn cancel(
        &self,
        tenant_id: TenantId,
        registered: &RegisteredIntegration,
        entity_id: EntityId,
        snapshot: &Snapshot,
    ) -> SyncResult<SyncDocument> {
        let capability = &registered.capability;
        let integration = capability.id.clone();
        let _guard = self
            .entity_locks
            .acquire((tenant_id, integration.clone(), entity_id))
            .await;

        let mut binding = self
            .bindings
            .get(tenant_id, &integration, entity_id)
            .await?
            .ok_or(SyncError::NotBound { entity_id })?;
        if !binding.is_bound() {
            return Err(SyncError::NotBound { entity_id });
        }
        let state = binding.last_known_remote_state;
        if !state.is_some_and(|s| s.is_cancellable()) {
            return Err(SyncError::CancelNotAllowed { state });
        }

        // The cancel payload references the most recent acknowledged
        // registration.
        let history = self
            .documents
            .history(tenant_id, &integration, entity_id)
            .await?;
        let registration = history
            .iter()
            .rev()
            .find(|d| {
                matches!(d.operation, SyncOperation::Register | SyncOperation::Update)
                    && d.status.is_remote_success()
            })
            .cloned()
            .ok_or(SyncError::CancelNotAllowed { state })?;

        let base_ctx = ChainContext {
            chain_index: 0,
            predecessor_fingerprint: registration.fingerprint.clone(),
            reference: Some(registration.payload.clone()),
        };
        let base_payload =
            capability
                .codec
                .encode(snapshot, SyncOperation::Cancel, Some(&base_ctx))?;
        let idempotency_key = fingerprint::idempotency_key(
            tenant_id,
            &integration,
            entity_id,
            SyncOperation::Cancel,
            &base_payload,
        );

        let missing = capability.codec.validate(&base_payload, SyncOperation::Cancel);
        if !missing.is_empty() {
            return Err(SyncError::PayloadIncomplete { missing });
        }
        self.resolver.url(registered, SyncOperation::Cancel)?;

        binding.bump_version();
        self.bindings.upsert(&binding).await?;

        // Cancellations of chained integrations are chain entries
        // themselves.
        let (payload, chain) = match &capability.chain_kind {
            Some(kind) => {
                let scope = ChainScope::new(integration.clone(), tenant_id, kind.clone());
                let scope_guard = self.scope_locks.acquire(scope.clone()).await;
                let head = self.documents.chain_head(&scope).await?;
                let (index, predecessor_fingerprint) = match &head {
                    Some(h) => (h.chain_index.unwrap_or(0) + 1, h.fingerprint.clone()),
                    None => (0, None),
                };
                let ctx = ChainContext {
                    chain_index: index,
                    predecessor_fingerprint: predecessor_fingerprint.clone(),
                    reference: Some(registration.payload.clone()),
                };
                let payload =
                    capability
                        .codec
                        .encode(snapshot, SyncOperation::Cancel, Some(&ctx))?;
                let own = fingerprint::fingerprint(&payload, predecessor_fingerprint.as_deref());
                let stamp = ChainStamp {
                    kind: kind.clone(),
                    index,
                    predecessor_fingerprint,
                    fingerprint: own,
                };
                let doc = self
                    .documents
                    .create(NewDocument {
                        tenant_id,
                        integration: integration.clone(),
                        entity_id,
                        operation: SyncOperation::Cancel,
                        payload: payload.clone(),
                        idempotency_key: Some(idempotency_key.clone()),
                        chain: Some(stamp),
                    })
                    .await?;
                drop(scope_guard);

                let doc = self
                    .dispatch(
                        registered,
                        &mut binding,
                        doc,
                        SyncOperation::Cancel,
                        payload,
                        &idempotency_key,
                    )
                    .await?;
                return self
                    .finish_cancel(&mut binding, doc, registration.id)
                    .await;
            }
            None => (base_payload, None),
        };

        let doc = self
            .documents
            .create(NewDocument {
                tenant_id,
                integration: integration.clone(),
                entity_id,
                operation: SyncOperation::Cancel,
                payload: payload.clone(),
                idempotency_key: Some(idempotency_key.clone()),
                chain,
            })
            .await?;
        let doc = self
            .dispatch(
                registered,
                &mut binding,
                doc,
                SyncOperation::Cancel,
                payload,
                &idempotency_key,
            )
            .await?;
        self.finish_cancel(&mut binding, doc, registration.id).await
    }

    async fn finish_cancel(
        &self,
        binding: &mut EntityBinding,
        doc: SyncDocument,
        registration_id: i64,
    ) -> SyncResult<SyncDocument> {
        if doc.status.is_remote_success() {
            self.documents.mark_cancelled(registration_id).await?;
            binding.mark_synced(Some(RemoteState::Cancelled));
            self.bindings.upsert(binding).await?;
        }
        Ok(doc)
    }

    // ------------------------------------------------------------------
    // Shared completion paths
    // ------------------------------------------------------------------

    async fn send(
        &self,
        registered: &RegisteredIntegration,
        operation: SyncOperation,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> SyncResult<WireResponse> {
        let method = registered.capability.method(operation);
        let (body, query) = if method == HttpMethod::Get {
            (None, payload_to_query(&payload))
        } else {
            (Some(payload), Vec::new())
        };
        let request = self
            .resolver
            .build_request(registered, operation, body, query, idempotency_key)
            .await?;
        self.transport.execute(&request).await
    }

    async fn complete(
        &self,
        registered: &RegisteredIntegration,
        binding: &mut EntityBinding,
        doc: SyncDocument,
        operation: SyncOperation,
        response: &WireResponse,
    ) -> SyncResult<SyncDocument> {
        let capability = &registered.capability;
        let classification = capability.classifier.classify(response);
        let decoded = capability.codec.decode(response, operation);

        let mut errors = classification.errors;
        for error in decoded.errors.iter() {
            if !errors.contains(error) {
                errors.push(error.clone());
            }
        }

        let retain_chain = classification.status == DocumentStatus::Accepted
            || (classification.status == DocumentStatus::RegisteredWithErrors
                && registered.config.chain_accepts_registered_with_errors);
        let response_blob = response
            .as_json()
            .or_else(|| response.text().map(|t| json!({ "raw": t })));

        let doc = self
            .documents
            .record_response(doc.id, classification.status, response_blob, errors, retain_chain)
            .await?;

        apply_remote_outcome(binding, classification.status, &decoded)?;
        self.bindings.upsert(binding).await?;

        // A remote create that acknowledges without an identifier leaves
        // the entity unbindable; that is an error the collaborator sees.
        if operation == SyncOperation::Register
            && doc.status.is_remote_success()
            && !binding.is_bound()
        {
            return Err(SyncError::binding_failed(
                "create response carried no remote identifier",
            ));
        }

        Ok(doc)
    }

    async fn record_failure(
        &self,
        doc: SyncDocument,
        error: SyncError,
    ) -> SyncResult<SyncDocument> {
        let code = match &error {
            SyncError::Transport { kind, .. } => kind.as_str().to_string(),
            SyncError::AuthExpired { .. } => "auth".to_string(),
            other => other.error_code().to_string(),
        };
        warn!(document_id = doc.id, code = %code, "submission failed before a remote outcome");

        let doc = self
            .documents
            .record_response(
                doc.id,
                DocumentStatus::SendingFailed,
                None,
                vec![RemoteError::new(code, error.to_string())],
                false,
            )
            .await?;

        // Transport-level failures are recovered by the poller; anything
        // else propagates to the collaborator.
        match error {
            SyncError::Transport { .. } | SyncError::AuthExpired { .. } => Ok(doc),
            other => Err(other),
        }
    }
}

/// Apply a classified remote outcome to a binding.
///
/// Rejection leaves the entity in its prior state; acknowledgements bind
/// the remote identifier (when one arrived) and clear sync-required.
pub(crate) fn apply_remote_outcome(
    binding: &mut EntityBinding,
    status: DocumentStatus,
    decoded: &DecodedResponse,
) -> SyncResult<()> {
    match status {
        DocumentStatus::Accepted | DocumentStatus::RegisteredWithErrors | DocumentStatus::Sent => {
            if !binding.is_bound() {
                if let Some(remote_id) = &decoded.remote_id {
                    binding.bind(remote_id.clone())?;
                }
            }
            let state = decoded.remote_state.or(match status {
                DocumentStatus::Accepted => Some(RemoteState::Accepted),
                DocumentStatus::RegisteredWithErrors => Some(RemoteState::RegisteredWithErrors),
                _ => None,
            });
            binding.mark_synced(state);
        }
        _ => {}
    }
    Ok(())
}

/// Flatten a JSON object into query parameters for GET endpoints.
fn payload_to_query(payload: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = payload else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), rendered))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_to_query_scalars_only() {
        let payload = json!({"serial": "INV-1", "count": 3, "flag": true, "nested": {"x": 1}});
        let query = payload_to_query(&payload);
        assert!(query.contains(&("serial".to_string(), "INV-1".to_string())));
        assert!(query.contains(&("count".to_string(), "3".to_string())));
        assert!(query.contains(&("flag".to_string(), "true".to_string())));
        assert_eq!(query.len(), 3);
    }

    #[test]
    fn test_apply_remote_outcome_binds_and_syncs() {
        let mut binding = EntityBinding::new(
            TenantId::new(),
            IntegrationId::new("card-issuing").unwrap(),
            EntityId::new(),
        );
        let decoded = DecodedResponse {
            remote_id: Some("ic_001".to_string()),
            ..Default::default()
        };
        apply_remote_outcome(&mut binding, DocumentStatus::Accepted, &decoded).unwrap();
        assert_eq!(binding.remote_id.as_deref(), Some("ic_001"));
        assert!(!binding.sync_required);
        assert_eq!(binding.last_known_remote_state, Some(RemoteState::Accepted));
    }

    #[test]
    fn test_apply_remote_outcome_rejection_is_inert() {
        let mut binding = EntityBinding::new(
            TenantId::new(),
            IntegrationId::new("card-issuing").unwrap(),
            EntityId::new(),
        );
        binding.bind("ic_001").unwrap();
        binding.mark_synced(Some(RemoteState::Accepted));

        apply_remote_outcome(&mut binding, DocumentStatus::Rejected, &DecodedResponse::default())
            .unwrap();
        assert_eq!(binding.remote_id.as_deref(), Some("ic_001"));
        assert_eq!(binding.last_known_remote_state, Some(RemoteState::Accepted));
    }

    #[test]
    fn test_apply_remote_outcome_sent_keeps_state_unknown() {
        let mut binding = EntityBinding::new(
            TenantId::new(),
            IntegrationId::new("be-peppol").unwrap(),
            EntityId::new(),
        );
        let decoded = DecodedResponse {
            remote_id: Some("msg-uuid-1".to_string()),
            ..Default::default()
        };
        apply_remote_outcome(&mut binding, DocumentStatus::Sent, &decoded).unwrap();
        assert_eq!(binding.remote_id.as_deref(), Some("msg-uuid-1"));
        assert!(!binding.sync_required);
        assert!(binding.last_known_remote_state.is_none());
    }
}
