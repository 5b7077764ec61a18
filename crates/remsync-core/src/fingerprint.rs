//! Canonical serialization and fingerprints.
//!
//! Chain fingerprints are SHA-256 over the canonical JSON of a payload plus
//! the predecessor's fingerprint, rendered as uppercase hex. The canonical
//! form (sorted keys, no whitespace) is byte-stable across implementations,
//! which the chained e-invoice integrations require.
//!
//! The same canonicalization backs idempotency keys for submissions.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ids::{EntityId, IntegrationId, TenantId};
use crate::types::SyncOperation;

/// Recursively sort JSON object keys for canonical representation.
fn sort_json_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

/// Canonicalize a JSON value: sorted keys, no whitespace.
///
/// Identical values produce identical strings regardless of the key order
/// they were built with.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    sort_json_keys(value).to_string()
}

/// Compute the chain fingerprint of a payload.
///
/// SHA-256 over the canonical serialization of the payload followed by the
/// predecessor fingerprint (when present), as uppercase hex. The first
/// document of a chain passes `None`.
#[must_use]
pub fn fingerprint(payload: &serde_json::Value, predecessor: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    if let Some(prev) = predecessor {
        hasher.update(prev.as_bytes());
    }
    hex::encode_upper(hasher.finalize())
}

/// Generate a deterministic idempotency key for a submission.
///
/// SHA-256 over (tenant, integration, entity, operation, canonical payload)
/// as lowercase hex. Identical submissions produce identical keys, letting
/// the orchestrator detect duplicate pushes without a remote round-trip.
#[must_use]
pub fn idempotency_key(
    tenant_id: TenantId,
    integration: &IntegrationId,
    entity_id: EntityId,
    operation: SyncOperation,
    payload: &serde_json::Value,
) -> String {
    let composite = format!(
        "{}:{}:{}:{}:{}",
        tenant_id,
        integration,
        entity_id,
        operation,
        canonical_json(payload)
    );
    let mut hasher = Sha256::new();
    hasher.update(composite.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive a stable event identifier from a webhook body when the upstream
/// supplies none.
#[must_use]
pub fn derived_event_id(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Parse an entity handle out of a string reference, used by ingress when a
/// remote echoes back the locally-embedded marker.
#[must_use]
pub fn parse_entity_marker(marker: &str) -> Option<EntityId> {
    Uuid::parse_str(marker).ok().map(EntityId::from_uuid)
}
