//! Sync documents.
//!
//! One record per outbound submission: the payload that went out, the
//! response that came back, the classified status, and the chain stamp for
//! integrations that hash-chain their registrations.
//!
//! Payload, chain index and predecessor fingerprint are fixed at creation.
//! The response and final status are written once; a second write is an
//! invariant violation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use remsync_core::error::{RemoteError, SyncError, SyncResult};
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::types::{DocumentStatus, SyncOperation};

/// Chain stamp computed before the document is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStamp {
    /// Chain kind within the scope (e.g. `sale`, `purchase`).
    pub kind: String,
    /// Index within (integration, tenant, kind); gap-free and strictly
    /// increasing.
    pub index: i64,
    /// Fingerprint of the document at index − 1, `None` at index 0.
    pub predecessor_fingerprint: Option<String>,
    /// This document's own fingerprint over (payload, predecessor).
    pub fingerprint: String,
}

/// A document about to be persisted.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub tenant_id: TenantId,
    pub integration: IntegrationId,
    pub entity_id: EntityId,
    pub operation: SyncOperation,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub chain: Option<ChainStamp>,
}

/// One persisted submission record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDocument {
    /// Monotonic identifier; creation order equals id order per entity.
    pub id: i64,

    /// Tenant.
    pub tenant_id: TenantId,

    /// Integration.
    pub integration: IntegrationId,

    /// Entity this submission belongs to.
    pub entity_id: EntityId,

    /// Operation kind.
    pub operation: SyncOperation,

    /// Outbound payload blob. Immutable.
    pub payload: Value,

    /// Response blob, written once.
    pub response: Option<Value>,

    /// Classified status.
    pub status: DocumentStatus,

    /// Error lines collected from the response.
    pub errors: Vec<RemoteError>,

    /// Deterministic submission key for duplicate detection.
    pub idempotency_key: Option<String>,

    /// Chain kind, for chained integrations.
    pub chain_kind: Option<String>,

    /// Chain index; freed again if the submission fails while it is still
    /// the head of its scope.
    pub chain_index: Option<i64>,

    /// Predecessor fingerprint. Immutable.
    pub predecessor_fingerprint: Option<String>,

    /// Own fingerprint over (payload, predecessor). Immutable.
    pub fingerprint: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// When the response was recorded.
    pub response_at: Option<DateTime<Utc>>,
}

impl SyncDocument {
    /// Materialize a new pending document with an assigned id.
    #[must_use]
    pub fn from_new(id: i64, new: NewDocument) -> Self {
        let (chain_kind, chain_index, predecessor_fingerprint, fingerprint) = match new.chain {
            Some(stamp) => (
                Some(stamp.kind),
                Some(stamp.index),
                stamp.predecessor_fingerprint,
                Some(stamp.fingerprint),
            ),
            None => (None, None, None, None),
        };
        Self {
            id,
            tenant_id: new.tenant_id,
            integration: new.integration,
            entity_id: new.entity_id,
            operation: new.operation,
            payload: new.payload,
            response: None,
            status: DocumentStatus::Pending,
            errors: Vec::new(),
            idempotency_key: new.idempotency_key,
            chain_kind,
            chain_index,
            predecessor_fingerprint,
            fingerprint,
            created_at: Utc::now(),
            response_at: None,
        }
    }

    /// Whether the response has been recorded.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.response_at.is_some()
    }

    /// Record the response, once.
    ///
    /// Enforces the status lattice and the write-once response invariant.
    pub fn finalize(
        &mut self,
        status: DocumentStatus,
        response: Option<Value>,
        errors: Vec<RemoteError>,
    ) -> SyncResult<()> {
        if self.is_finalized() {
            return Err(SyncError::DocumentFinalized {
                document_id: self.id,
            });
        }
        if !self.status.can_transition_to(status) {
            return Err(SyncError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.response = response;
        self.errors = errors;
        self.response_at = Some(Utc::now());
        Ok(())
    }

    /// Move an accepted registration to cancelled, the one lattice edge out
    /// of a finalized document.
    pub fn cancel(&mut self) -> SyncResult<()> {
        if !self.status.can_transition_to(DocumentStatus::Cancelled) {
            return Err(SyncError::InvalidTransition {
                from: self.status.to_string(),
                to: DocumentStatus::Cancelled.to_string(),
            });
        }
        self.status = DocumentStatus::Cancelled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_document() -> NewDocument {
        NewDocument {
            tenant_id: TenantId::new(),
            integration: IntegrationId::new("es-verifactu").unwrap(),
            entity_id: EntityId::new(),
            operation: SyncOperation::Register,
            payload: json!({"serial": "INV-001"}),
            idempotency_key: Some("k".to_string()),
            chain: None,
        }
    }

    #[test]
    fn test_from_new_is_pending() {
        let doc = SyncDocument::from_new(1, new_document());
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert!(!doc.is_finalized());
        assert!(doc.chain_index.is_none());
    }

    #[test]
    fn test_chain_stamp_carried() {
        let mut new = new_document();
        new.chain = Some(ChainStamp {
            kind: "sale".to_string(),
            index: 3,
            predecessor_fingerprint: Some("AA".to_string()),
            fingerprint: "BB".to_string(),
        });
        let doc = SyncDocument::from_new(7, new);
        assert_eq!(doc.chain_kind.as_deref(), Some("sale"));
        assert_eq!(doc.chain_index, Some(3));
        assert_eq!(doc.predecessor_fingerprint.as_deref(), Some("AA"));
        assert_eq!(doc.fingerprint.as_deref(), Some("BB"));
    }

    #[test]
    fn test_finalize_once() {
        let mut doc = SyncDocument::from_new(1, new_document());
        doc.finalize(DocumentStatus::Accepted, Some(json!({"ok": true})), vec![])
            .unwrap();
        assert!(doc.is_finalized());
        assert_eq!(doc.status, DocumentStatus::Accepted);

        let err = doc
            .finalize(DocumentStatus::Rejected, None, vec![])
            .unwrap_err();
        assert!(matches!(err, SyncError::DocumentFinalized { document_id: 1 }));
    }

    #[test]
    fn test_finalize_respects_lattice() {
        let mut doc = SyncDocument::from_new(1, new_document());
        // Pending -> Cancelled is not an edge.
        let err = doc
            .finalize(DocumentStatus::Cancelled, None, vec![])
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
    }

    #[test]
    fn test_cancel_only_from_accepted() {
        let mut doc = SyncDocument::from_new(1, new_document());
        doc.finalize(DocumentStatus::Accepted, None, vec![]).unwrap();
        doc.cancel().unwrap();
        assert_eq!(doc.status, DocumentStatus::Cancelled);

        let mut rejected = SyncDocument::from_new(2, new_document());
        rejected
            .finalize(DocumentStatus::Rejected, None, vec![])
            .unwrap();
        assert!(rejected.cancel().is_err());
    }

    #[test]
    fn test_sending_failed_from_pending() {
        let mut doc = SyncDocument::from_new(1, new_document());
        doc.finalize(
            DocumentStatus::SendingFailed,
            None,
            vec![RemoteError::new("timeout", "deadline exceeded")],
        )
        .unwrap();
        assert_eq!(doc.status, DocumentStatus::SendingFailed);
        assert_eq!(doc.errors.len(), 1);
    }
}
