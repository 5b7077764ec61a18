//! Webhook ingress dispatcher.
//!
//! Authenticates the caller per the integration's scheme, extracts the
//! reference field the codec designates as the entity discriminator,
//! deduplicates deliveries over a bounded window, and appends a sync
//! document as if produced by a status query.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use remsync_core::capability::IntegrationRegistry;
use remsync_core::config::WebhookAuth;
use remsync_core::crypto::{verify_shared_secret, verify_signature};
use remsync_core::error::{SyncError, SyncResult};
use remsync_core::fingerprint::derived_event_id;
use remsync_core::ids::IntegrationId;
use remsync_core::types::{SyncOperation, WireResponse};

use crate::binding::EntityBinding;
use crate::chain::{EntityKey, LockRegistry};
use crate::document::{NewDocument, SyncDocument};
use crate::orchestrator::apply_remote_outcome;
use crate::store::{BindingStore, DedupStore, DocumentStore};

/// Webhook receiver feeding the document registry and bindings.
pub struct IngressDispatcher {
    registry: Arc<IntegrationRegistry>,
    bindings: Arc<dyn BindingStore>,
    documents: Arc<dyn DocumentStore>,
    dedup: Arc<dyn DedupStore>,
    entity_locks: Arc<LockRegistry<EntityKey>>,
}

impl IngressDispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<IntegrationRegistry>,
        bindings: Arc<dyn BindingStore>,
        documents: Arc<dyn DocumentStore>,
        dedup: Arc<dyn DedupStore>,
        entity_locks: Arc<LockRegistry<EntityKey>>,
    ) -> Self {
        Self {
            registry,
            bindings,
            documents,
            dedup,
            entity_locks,
        }
    }

    /// Process one webhook delivery.
    ///
    /// Returns the appended document, or `None` for a duplicate delivery
    /// (which is acknowledged without effect).
    #[instrument(skip(self, headers, body), fields(integration = %integration))]
    pub async fn handle(
        &self,
        integration: &IntegrationId,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> SyncResult<Option<SyncDocument>> {
        let registered = self.registry.get(integration)?;
        let capability = &registered.capability;
        let config = &registered.config;

        authenticate(integration, config, headers, body)?;

        let parsed: Value = serde_json::from_slice(body)
            .map_err(|_| SyncError::webhook_rejected("body is not valid JSON"))?;

        let reference_pointer = capability
            .webhook_reference_pointer
            .as_deref()
            .ok_or_else(|| SyncError::webhook_rejected("integration accepts no webhooks"))?;
        let reference = parsed
            .pointer(reference_pointer)
            .and_then(scalar_string)
            .ok_or_else(|| SyncError::webhook_rejected("missing reference field"))?;

        let event_id = capability
            .webhook_event_id_pointer
            .as_deref()
            .and_then(|p| parsed.pointer(p))
            .and_then(scalar_string)
            .unwrap_or_else(|| derived_event_id(body));

        let fresh = self
            .dedup
            .check_and_insert(
                integration,
                &reference,
                &event_id,
                Utc::now(),
                Duration::from_secs(config.webhook_dedup_window_secs),
            )
            .await?;
        if !fresh {
            debug!(reference = %reference, event_id = %event_id, "duplicate delivery ignored");
            return Ok(None);
        }

        let binding = self
            .locate_entity(integration, &reference)
            .await?
            .ok_or_else(|| {
                SyncError::webhook_rejected(format!("unknown reference '{reference}'"))
            })?;

        let _guard = self
            .entity_locks
            .acquire((binding.tenant_id, integration.clone(), binding.entity_id))
            .await;
        // Reload under the lock; a concurrent poll may have advanced it.
        let mut binding = self
            .bindings
            .get(binding.tenant_id, integration, binding.entity_id)
            .await?
            .unwrap_or(binding);

        let response = WireResponse::new(200, BTreeMap::new(), body.to_vec());
        let classification = capability.classifier.classify(&response);
        let decoded = capability.codec.decode(&response, SyncOperation::Query);

        let doc = self
            .documents
            .create(NewDocument {
                tenant_id: binding.tenant_id,
                integration: integration.clone(),
                entity_id: binding.entity_id,
                operation: SyncOperation::Query,
                payload: json!({ "webhook_reference": reference, "event_id": event_id }),
                idempotency_key: None,
                chain: None,
            })
            .await?;
        let doc = self
            .documents
            .record_response(
                doc.id,
                classification.status,
                Some(parsed),
                classification.errors,
                false,
            )
            .await?;

        apply_remote_outcome(&mut binding, classification.status, &decoded)?;
        self.bindings.upsert(&binding).await?;

        Ok(Some(doc))
    }

    /// Match a reference to an entity, by remote id first and then by the
    /// locally-embedded marker.
    async fn locate_entity(
        &self,
        integration: &IntegrationId,
        reference: &str,
    ) -> SyncResult<Option<EntityBinding>> {
        if let Some(binding) = self.bindings.find_by_remote_id(integration, reference).await? {
            return Ok(Some(binding));
        }
        if let Some(entity_id) = remsync_core::fingerprint::parse_entity_marker(reference) {
            return self.bindings.find_by_entity(integration, entity_id).await;
        }
        Ok(None)
    }
}

/// Authenticate a delivery per the integration's webhook scheme.
fn authenticate(
    integration: &IntegrationId,
    config: &remsync_core::config::IntegrationConfig,
    headers: &BTreeMap<String, String>,
    body: &[u8],
) -> SyncResult<()> {
    match &config.webhook_auth {
        // mTLS or a trusted network path terminates upstream.
        WebhookAuth::None => Ok(()),
        WebhookAuth::SharedSecret { header } => {
            let secret = config.webhook_secret.as_deref().ok_or_else(|| {
                SyncError::config_missing(integration.clone(), config.mode, "webhook secret")
            })?;
            let presented = headers
                .get(&header.to_lowercase())
                .ok_or_else(|| SyncError::webhook_rejected("authentication header missing"))?;
            if verify_shared_secret(presented, secret) {
                Ok(())
            } else {
                Err(SyncError::webhook_rejected("authentication failed"))
            }
        }
        WebhookAuth::Signature {
            signature_header,
            timestamp_header,
            tolerance_secs,
        } => {
            let secret = config.webhook_secret.as_deref().ok_or_else(|| {
                SyncError::config_missing(integration.clone(), config.mode, "webhook secret")
            })?;
            let signature = headers
                .get(&signature_header.to_lowercase())
                .ok_or_else(|| SyncError::webhook_rejected("authentication header missing"))?;
            let timestamp = headers
                .get(&timestamp_header.to_lowercase())
                .ok_or_else(|| SyncError::webhook_rejected("authentication header missing"))?;

            let ts: i64 = timestamp
                .parse()
                .map_err(|_| SyncError::webhook_rejected("authentication failed"))?;
            let skew = (Utc::now().timestamp() - ts).unsigned_abs();
            if skew > *tolerance_secs {
                return Err(SyncError::webhook_rejected("authentication failed"));
            }

            if verify_signature(signature, secret, timestamp, body) {
                Ok(())
            } else {
                Err(SyncError::webhook_rejected("authentication failed"))
            }
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
