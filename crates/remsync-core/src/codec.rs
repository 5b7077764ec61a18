//! Payload codecs.
//!
//! A codec converts a local entity snapshot into one integration's wire form
//! and parses responses back. The trait is the per-integration capability
//! surface; [`MappedCodec`] is the declarative implementation driven by a
//! [`FieldMap`] and a set of decode rules, which covers every integration
//! whose wire form is JSON-shaped.
//!
//! Decoding is total over known response shapes: business errors come back
//! as data, never as `Err`. Transport-level failures are the transport's
//! concern.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RemoteError, SyncResult};
use crate::fieldmap::{ExtractRule, FieldMap};
use crate::snapshot::Snapshot;
use crate::types::{RemoteState, SyncOperation, WireResponse};

/// Chain and reference context handed to the codec when encoding.
///
/// Present only for integrations that chain their registrations or that
/// reference a prior document on cancellation.
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    /// Index this document will occupy within its chain scope.
    pub chain_index: i64,
    /// Fingerprint of the predecessor document, `None` at index 0.
    pub predecessor_fingerprint: Option<String>,
    /// Identifier payload of the referenced document (the predecessor for a
    /// chained registration, the accepted registration for a cancel).
    pub reference: Option<Value>,
}

/// Decoded remote response.
#[derive(Debug, Clone, Default)]
pub struct DecodedResponse {
    /// Remote identifier, when the response carries one.
    pub remote_id: Option<String>,
    /// Remote state, when the response carries one the codec understands.
    pub remote_state: Option<RemoteState>,
    /// Derived local fields extracted from the response.
    pub extracted: Map<String, Value>,
    /// Business error lines reported inline.
    pub errors: Vec<RemoteError>,
}

/// One metadata filter for a remote search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Remote field name.
    pub field: String,
    /// Value to match.
    pub value: String,
}

impl SearchFilter {
    /// Create a new filter.
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Per-integration payload codec.
pub trait PayloadCodec: Send + Sync {
    /// Convert a snapshot into the remote payload for an operation.
    ///
    /// Deterministic: equal snapshots (and equal chain context) produce
    /// equal payloads.
    fn encode(
        &self,
        snapshot: &Snapshot,
        operation: SyncOperation,
        chain: Option<&ChainContext>,
    ) -> SyncResult<Value>;

    /// Remote fields the remote will reject as missing, per operation.
    fn required_fields(&self, operation: SyncOperation) -> Vec<String>;

    /// Required remote fields absent from an already-built payload.
    fn validate(&self, payload: &Value, operation: SyncOperation) -> Vec<String> {
        self.required_fields(operation)
            .into_iter()
            .filter(|f| {
                payload
                    .get(f)
                    .map_or(true, |v| v.is_null() || matches!(v, Value::String(s) if s.is_empty()))
            })
            .collect()
    }

    /// Parse a remote response into its structured result.
    fn decode(&self, response: &WireResponse, operation: SyncOperation) -> DecodedResponse;

    /// Metadata filters identifying this entity on the remote side.
    fn search_filters(&self, snapshot: &Snapshot) -> Vec<SearchFilter>;
}

/// Vocabulary mapping a remote state field onto [`RemoteState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateVocabulary {
    /// JSON pointer to the state field.
    pub pointer: String,
    /// Vendor vocabulary, matched case-sensitively.
    pub vocabulary: std::collections::BTreeMap<String, RemoteState>,
}

/// Declarative decode rules for [`MappedCodec`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeRules {
    /// JSON pointer to the remote identifier, e.g. `/id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id_pointer: Option<String>,

    /// Remote state field and vocabulary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateVocabulary>,

    /// Derived local fields to extract.
    #[serde(default)]
    pub extract: Vec<ExtractRule>,

    /// JSON pointer to an inline error array of `{code, message}` objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors_pointer: Option<String>,
}

/// How chain context is embedded into an encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEmbed {
    /// Payload field carrying the predecessor fingerprint.
    pub fingerprint_field: String,
    /// Payload field carrying the referenced document's identifier payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_field: Option<String>,
}

/// Field-map driven codec.
///
/// Covers the JSON-shaped integrations; anything with a bespoke wire format
/// implements [`PayloadCodec`] directly.
#[derive(Debug, Clone, Default)]
pub struct MappedCodec {
    /// Outbound field mapping.
    pub field_map: FieldMap,
    /// Inbound decode rules.
    pub decode_rules: DecodeRules,
    /// Chain embedding, for integrations that chain registrations.
    pub chain_embed: Option<ChainEmbed>,
    /// Local snapshot fields used as remote search filters, as
    /// (snapshot field, remote field) pairs.
    pub search_fields: Vec<(String, String)>,
}

impl MappedCodec {
    /// Create a codec from a field map.
    #[must_use]
    pub fn new(field_map: FieldMap) -> Self {
        Self {
            field_map,
            ..Self::default()
        }
    }

    /// Set the decode rules.
    #[must_use]
    pub fn with_decode_rules(mut self, rules: DecodeRules) -> Self {
        self.decode_rules = rules;
        self
    }

    /// Set the chain embedding.
    #[must_use]
    pub fn with_chain_embed(mut self, embed: ChainEmbed) -> Self {
        self.chain_embed = Some(embed);
        self
    }

    /// Add a search field pair.
    #[must_use]
    pub fn with_search_field(
        mut self,
        snapshot_field: impl Into<String>,
        remote_field: impl Into<String>,
    ) -> Self {
        self.search_fields
            .push((snapshot_field.into(), remote_field.into()));
        self
    }
}

impl PayloadCodec for MappedCodec {
    fn encode(
        &self,
        snapshot: &Snapshot,
        operation: SyncOperation,
        chain: Option<&ChainContext>,
    ) -> SyncResult<Value> {
        let (mut payload, _missing) = self.field_map.build(snapshot, operation);

        if let (Some(embed), Some(ctx)) = (&self.chain_embed, chain) {
            if let Some(prev) = &ctx.predecessor_fingerprint {
                payload.insert(embed.fingerprint_field.clone(), Value::String(prev.clone()));
            }
            if let (Some(field), Some(reference)) = (&embed.reference_field, &ctx.reference) {
                payload.insert(field.clone(), reference.clone());
            }
        }

        Ok(Value::Object(payload))
    }

    fn required_fields(&self, operation: SyncOperation) -> Vec<String> {
        self.field_map.required_fields(operation)
    }

    fn decode(&self, response: &WireResponse, _operation: SyncOperation) -> DecodedResponse {
        let Some(body) = response.as_json() else {
            return DecodedResponse::default();
        };

        let remote_id = self
            .decode_rules
            .remote_id_pointer
            .as_deref()
            .and_then(|p| body.pointer(p))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        let remote_state = self.decode_rules.state.as_ref().and_then(|rule| {
            body.pointer(&rule.pointer)
                .and_then(Value::as_str)
                .and_then(|s| rule.vocabulary.get(s).copied())
        });

        let mut extracted = Map::new();
        for rule in &self.decode_rules.extract {
            if let Some(value) = rule.resolve(&body) {
                extracted.insert(rule.local_name.clone(), value);
            }
        }

        let mut errors = Vec::new();
        if let Some(pointer) = self.decode_rules.errors_pointer.as_deref() {
            if let Some(Value::Array(items)) = body.pointer(pointer) {
                for item in items {
                    let code = item
                        .pointer("/code")
                        .map(render_scalar)
                        .unwrap_or_else(|| "unknown".to_string());
                    let message = item
                        .pointer("/message")
                        .map(render_scalar)
                        .unwrap_or_default();
                    errors.push(RemoteError::new(code, message));
                }
            }
        }

        DecodedResponse {
            remote_id,
            remote_state,
            extracted,
            errors,
        }
    }

    fn search_filters(&self, snapshot: &Snapshot) -> Vec<SearchFilter> {
        self.search_fields
            .iter()
            .filter_map(|(local, remote)| {
                snapshot
                    .get(local)
                    .map(|v| SearchFilter::new(remote.clone(), v.render()))
            })
            .collect()
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldmap::FieldRule;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn codec() -> MappedCodec {
        let mut vocabulary = BTreeMap::new();
        vocabulary.insert("Correcto".to_string(), RemoteState::Accepted);
        vocabulary.insert("ParcialmenteCorrecto".to_string(), RemoteState::RegisteredWithErrors);
        vocabulary.insert("Incorrecto".to_string(), RemoteState::Rejected);

        MappedCodec::new(
            FieldMap::new()
                .with(FieldRule::field("serial", "serial").required())
                .with(FieldRule::field("total", "total").required()),
        )
        .with_decode_rules(DecodeRules {
            remote_id_pointer: Some("/csv".to_string()),
            state: Some(StateVocabulary {
                pointer: "/estado".to_string(),
                vocabulary,
            }),
            extract: vec![ExtractRule::pointer("csv", "/csv")],
            errors_pointer: Some("/errores".to_string()),
        })
        .with_chain_embed(ChainEmbed {
            fingerprint_field: "previous_fingerprint".to_string(),
            reference_field: Some("previous_record".to_string()),
        })
        .with_search_field("serial", "NumSerie")
    }

    #[test]
    fn test_encode_deterministic() {
        let snap = Snapshot::new().with("serial", "INV-001").with("total", "121.00");
        let c = codec();
        let a = c.encode(&snap, SyncOperation::Register, None).unwrap();
        let b = c.encode(&snap.clone(), SyncOperation::Register, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encode_embeds_chain_context() {
        let snap = Snapshot::new().with("serial", "INV-002").with("total", "50.00");
        let ctx = ChainContext {
            chain_index: 1,
            predecessor_fingerprint: Some("ABCD".to_string()),
            reference: Some(json!({"serial": "INV-001"})),
        };
        let payload = codec().encode(&snap, SyncOperation::Register, Some(&ctx)).unwrap();
        assert_eq!(payload.pointer("/previous_fingerprint"), Some(&json!("ABCD")));
        assert_eq!(
            payload.pointer("/previous_record/serial"),
            Some(&json!("INV-001"))
        );
    }

    #[test]
    fn test_encode_first_of_chain_elides_fingerprint() {
        let snap = Snapshot::new().with("serial", "INV-001").with("total", "10.00");
        let ctx = ChainContext::default();
        let payload = codec().encode(&snap, SyncOperation::Register, Some(&ctx)).unwrap();
        assert!(payload.pointer("/previous_fingerprint").is_none());
    }

    #[test]
    fn test_validate_reports_missing() {
        let c = codec();
        let payload = json!({"serial": "INV-001"});
        assert_eq!(
            c.validate(&payload, SyncOperation::Register),
            vec!["total".to_string()]
        );

        let payload = json!({"serial": "INV-001", "total": ""});
        assert_eq!(
            c.validate(&payload, SyncOperation::Register),
            vec!["total".to_string()]
        );
    }

    #[test]
    fn test_decode_full_response() {
        let resp = WireResponse::json(
            200,
            &json!({
                "csv": "CSV-7781",
                "estado": "ParcialmenteCorrecto",
                "errores": [{"code": "4102", "message": "NIF not registered"}]
            }),
        );
        let decoded = codec().decode(&resp, SyncOperation::Register);
        assert_eq!(decoded.remote_id.as_deref(), Some("CSV-7781"));
        assert_eq!(decoded.remote_state, Some(RemoteState::RegisteredWithErrors));
        assert_eq!(decoded.extracted.get("csv"), Some(&json!("CSV-7781")));
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.errors[0].code, "4102");
    }

    #[test]
    fn test_decode_total_over_garbage() {
        let resp = WireResponse::new(200, Default::default(), b"not json at all".to_vec());
        let decoded = codec().decode(&resp, SyncOperation::Register);
        assert!(decoded.remote_id.is_none());
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn test_decode_numeric_remote_id() {
        let c = MappedCodec::new(FieldMap::new()).with_decode_rules(DecodeRules {
            remote_id_pointer: Some("/id".to_string()),
            ..Default::default()
        });
        let resp = WireResponse::json(200, &json!({"id": 9913}));
        assert_eq!(
            c.decode(&resp, SyncOperation::Register).remote_id.as_deref(),
            Some("9913")
        );
    }

    #[test]
    fn test_search_filters() {
        let snap = Snapshot::new().with("serial", "INV-001").with("total", "10.00");
        let filters = codec().search_filters(&snap);
        assert_eq!(filters, vec![SearchFilter::new("NumSerie", "INV-001")]);
    }
}
