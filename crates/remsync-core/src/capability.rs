//! Integration capability records and the startup registry.
//!
//! Each integration contributes one capability record: its codec, its
//! classifier rules, its endpoint tables, and the handful of wire-level
//! quirks (auth header shape, auth-expired code table, token rotation
//! header, webhook reference field). The engine is integration-agnostic;
//! everything integration-specific lives here as data or as a trait object.
//!
//! The registry is built once at startup. There are no string-indirected
//! lookups on the hot path beyond the single registry fetch.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::classify::ClassifierSpec;
use crate::codec::PayloadCodec;
use crate::config::IntegrationConfig;
use crate::error::{SyncError, SyncResult};
use crate::ids::IntegrationId;
use crate::types::{HttpMethod, Mode, SyncOperation};

/// How the integration's auth credential is sent on each request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthHeaderSpec {
    /// Header name, e.g. `Authorization`.
    pub header: String,
    /// Value prefix, e.g. `Bearer`. Joined with a single space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

/// How to re-authenticate when the remote signals token expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReauthSpec {
    /// Token endpoint per mode.
    pub endpoints: BTreeMap<Mode, String>,
    /// JSON pointer to the token in the auth response.
    pub token_pointer: String,
}

/// How remote search results are interpreted by the identity binder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSpec {
    /// JSON pointer to the candidate array in the search response.
    pub results_pointer: String,
    /// Pointer to the remote identifier within one candidate.
    pub id_pointer: String,
    /// Pointer to the locally-embedded entity marker within one candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_pointer: Option<String>,
    /// Pointer to the candidate's status field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_pointer: Option<String>,
    /// Status values considered "active" when disambiguating.
    #[serde(default)]
    pub active_values: Vec<String>,
}

/// Capability record for one integration.
pub struct IntegrationCapability {
    /// Integration identifier; the registry key.
    pub id: IntegrationId,

    /// Payload codec.
    pub codec: Arc<dyn PayloadCodec>,

    /// Response classification rules.
    pub classifier: ClassifierSpec,

    /// Default endpoint tables, per mode then per operation. Demo mode
    /// needs no endpoints.
    pub endpoints: BTreeMap<Mode, BTreeMap<SyncOperation, String>>,

    /// HTTP method per operation; operations not listed default to POST
    /// (GET for queries).
    pub methods: BTreeMap<SyncOperation, HttpMethod>,

    /// How the auth credential travels, when the integration uses one.
    pub auth_header: Option<AuthHeaderSpec>,

    /// Remote error codes that mean "authentication expired" and warrant
    /// one re-auth plus one retry (e.g. `1005`).
    pub auth_expired_codes: Vec<String>,

    /// How to re-authenticate, for integrations with rotating tokens.
    pub reauth: Option<ReauthSpec>,

    /// Response header carrying a rotated communication token.
    pub token_rotation_header: Option<String>,

    /// Request header for a caller-supplied idempotency key, where the
    /// remote supports one.
    pub idempotency_header: Option<String>,

    /// Chain kind for integrations whose registrations form a hash chain.
    /// `None` disables chaining.
    pub chain_kind: Option<String>,

    /// Search interpretation for the identity binder.
    pub search: Option<SearchSpec>,

    /// JSON pointer to the entity discriminator within a webhook body
    /// (e.g. `/CompanyRef`, `/RelateNumber`, `/message_uuid`).
    pub webhook_reference_pointer: Option<String>,

    /// JSON pointer to the upstream event id within a webhook body.
    pub webhook_event_id_pointer: Option<String>,
}

impl std::fmt::Debug for IntegrationCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationCapability")
            .field("id", &self.id)
            .field("chain_kind", &self.chain_kind)
            .field("auth_expired_codes", &self.auth_expired_codes)
            .finish()
    }
}

impl IntegrationCapability {
    /// Create a capability record with a codec and otherwise empty tables.
    pub fn new(id: IntegrationId, codec: Arc<dyn PayloadCodec>) -> Self {
        Self {
            id,
            codec,
            classifier: ClassifierSpec::default(),
            endpoints: BTreeMap::new(),
            methods: BTreeMap::new(),
            auth_header: None,
            auth_expired_codes: Vec::new(),
            reauth: None,
            token_rotation_header: None,
            idempotency_header: None,
            chain_kind: None,
            search: None,
            webhook_reference_pointer: None,
            webhook_event_id_pointer: None,
        }
    }

    /// Set the classifier spec.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ClassifierSpec) -> Self {
        self.classifier = classifier;
        self
    }

    /// Add one endpoint.
    #[must_use]
    pub fn with_endpoint(
        mut self,
        mode: Mode,
        operation: SyncOperation,
        url: impl Into<String>,
    ) -> Self {
        self.endpoints
            .entry(mode)
            .or_default()
            .insert(operation, url.into());
        self
    }

    /// Enable chaining under the given chain kind.
    #[must_use]
    pub fn with_chain_kind(mut self, kind: impl Into<String>) -> Self {
        self.chain_kind = Some(kind.into());
        self
    }

    /// Set the webhook reference pointer.
    #[must_use]
    pub fn with_webhook_reference(mut self, pointer: impl Into<String>) -> Self {
        self.webhook_reference_pointer = Some(pointer.into());
        self
    }

    /// Set the webhook event id pointer.
    #[must_use]
    pub fn with_webhook_event_id(mut self, pointer: impl Into<String>) -> Self {
        self.webhook_event_id_pointer = Some(pointer.into());
        self
    }

    /// HTTP method for an operation.
    #[must_use]
    pub fn method(&self, operation: SyncOperation) -> HttpMethod {
        self.methods.get(&operation).copied().unwrap_or(match operation {
            SyncOperation::Query => HttpMethod::Get,
            _ => HttpMethod::Post,
        })
    }

    /// Default endpoint for a mode and operation.
    #[must_use]
    pub fn endpoint(&self, mode: Mode, operation: SyncOperation) -> Option<&str> {
        self.endpoints
            .get(&mode)
            .and_then(|ops| ops.get(&operation))
            .map(String::as_str)
    }
}

/// One registered integration: capability plus active configuration.
#[derive(Debug, Clone)]
pub struct RegisteredIntegration {
    /// Capability record.
    pub capability: Arc<IntegrationCapability>,
    /// Active configuration.
    pub config: Arc<IntegrationConfig>,
}

/// Registry of integrations, built at startup and immutable afterwards.
#[derive(Debug, Default)]
pub struct IntegrationRegistry {
    integrations: HashMap<IntegrationId, RegisteredIntegration>,
}

impl IntegrationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration. Replaces any previous registration with the
    /// same id.
    pub fn register(&mut self, capability: IntegrationCapability, config: IntegrationConfig) {
        self.integrations.insert(
            capability.id.clone(),
            RegisteredIntegration {
                capability: Arc::new(capability),
                config: Arc::new(config),
            },
        );
    }

    /// Look up an integration.
    pub fn get(&self, id: &IntegrationId) -> SyncResult<RegisteredIntegration> {
        self.integrations
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownIntegration {
                integration: id.clone(),
            })
    }

    /// Iterate over registered integrations.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredIntegration> {
        self.integrations.values()
    }

    /// Number of registered integrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MappedCodec;
    use crate::fieldmap::FieldMap;

    fn capability(id: &str) -> IntegrationCapability {
        IntegrationCapability::new(
            IntegrationId::new(id).unwrap(),
            Arc::new(MappedCodec::new(FieldMap::new())),
        )
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = IntegrationRegistry::new();
        registry.register(capability("card-issuing"), IntegrationConfig::new());

        let id = IntegrationId::new("card-issuing").unwrap();
        let registered = registry.get(&id).unwrap();
        assert_eq!(registered.capability.id, id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_integration() {
        let registry = IntegrationRegistry::new();
        let id = IntegrationId::new("nope").unwrap();
        match registry.get(&id) {
            Err(SyncError::UnknownIntegration { integration }) => assert_eq!(integration, id),
            other => panic!("expected UnknownIntegration, got {other:?}"),
        }
    }

    #[test]
    fn test_default_methods() {
        let cap = capability("card-issuing");
        assert_eq!(cap.method(SyncOperation::Register), HttpMethod::Post);
        assert_eq!(cap.method(SyncOperation::Query), HttpMethod::Get);
    }

    #[test]
    fn test_endpoint_lookup() {
        let cap = capability("card-issuing").with_endpoint(
            Mode::Test,
            SyncOperation::Register,
            "https://sandbox.example.com/v1/cards",
        );
        assert_eq!(
            cap.endpoint(Mode::Test, SyncOperation::Register),
            Some("https://sandbox.example.com/v1/cards")
        );
        assert_eq!(cap.endpoint(Mode::Live, SyncOperation::Register), None);
    }
}
