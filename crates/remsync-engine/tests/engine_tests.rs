//! End-to-end engine scenarios over the in-memory stores and the demo
//! transport, plus one full round through the HTTP transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use remsync_core::capability::{
    AuthHeaderSpec, IntegrationCapability, IntegrationRegistry, ReauthSpec,
};
use remsync_core::classify::{ClassifierSpec, LineVerdict};
use remsync_core::codec::{ChainEmbed, DecodeRules, MappedCodec, StateVocabulary};
use remsync_core::config::{IntegrationConfig, WebhookAuth};
use remsync_core::credentials::{Credential, CredentialStore, MemoryCredentialStore};
use remsync_core::error::{SyncError, TransportErrorKind};
use remsync_core::fieldmap::{ExtractRule, ExtractSource, FieldMap, FieldRule, Transform};
use remsync_core::fingerprint::fingerprint;
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::snapshot::Snapshot;
use remsync_core::types::{DocumentStatus, Mode, RemoteState, SyncOperation, WireResponse};
use remsync_engine::chain::LockRegistry;
use remsync_engine::ingress::IngressDispatcher;
use remsync_engine::store::{
    BindingStore, DocumentStore, MemoryBindingStore, MemoryDedupStore, MemoryDocumentStore,
};
use remsync_engine::{EntityBinding, Orchestrator, Poller, PollerConfig};
use remsync_transport::{DemoTransport, EndpointResolver, HttpTransport, Transport};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    registry: Arc<IntegrationRegistry>,
    bindings: Arc<MemoryBindingStore>,
    documents: Arc<MemoryDocumentStore>,
    credentials: Arc<MemoryCredentialStore>,
    demo: Arc<DemoTransport>,
    orchestrator: Arc<Orchestrator>,
    entity_locks: Arc<LockRegistry<remsync_engine::chain::EntityKey>>,
    tenant: TenantId,
}

impl Harness {
    fn new(registry: IntegrationRegistry) -> Self {
        Self::with_transport(registry, |_| None)
    }

    fn with_transport(
        registry: IntegrationRegistry,
        alt: impl Fn(&Arc<MemoryCredentialStore>) -> Option<Arc<dyn Transport>>,
    ) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let registry = Arc::new(registry);
        let bindings = Arc::new(MemoryBindingStore::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let demo = Arc::new(DemoTransport::new());
        let transport: Arc<dyn Transport> =
            alt(&credentials).unwrap_or_else(|| demo.clone() as Arc<dyn Transport>);
        let resolver = Arc::new(EndpointResolver::new(credentials.clone()));
        let entity_locks = Arc::new(LockRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            bindings.clone(),
            documents.clone(),
            resolver,
            transport,
            entity_locks.clone(),
        ));
        Self {
            registry,
            bindings,
            documents,
            credentials,
            demo,
            orchestrator,
            entity_locks,
            tenant: TenantId::new(),
        }
    }

    fn dispatcher(&self) -> IngressDispatcher {
        IngressDispatcher::new(
            self.registry.clone(),
            self.bindings.clone(),
            self.documents.clone(),
            Arc::new(MemoryDedupStore::new()),
            self.entity_locks.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Integration fixtures
// ---------------------------------------------------------------------------

fn card_issuing() -> IntegrationCapability {
    let codec = MappedCodec::new(
        FieldMap::new()
            .with(FieldRule::field("cardholder_ref", "cardholder").required())
            .with(FieldRule::field("card_type", "type").required())
            .with(FieldRule::field("currency", "currency").required())
            .with(FieldRule::field("nickname", "nickname")),
    )
    .with_decode_rules(DecodeRules {
        remote_id_pointer: Some("/id".to_string()),
        state: None,
        extract: vec![
            ExtractRule::pointer("last4", "/last4"),
            ExtractRule {
                local_name: "expiration".to_string(),
                source: ExtractSource::Concat {
                    parts: vec![
                        ExtractSource::Pointer {
                            pointer: "/exp_month".to_string(),
                            transform: Some(Transform::ZeroPad { width: 2 }),
                        },
                        ExtractSource::Pointer {
                            pointer: "/exp_year".to_string(),
                            transform: None,
                        },
                    ],
                    separator: "/".to_string(),
                },
                transform: None,
            },
        ],
        errors_pointer: None,
    });

    IntegrationCapability::new(IntegrationId::new("card-issuing").unwrap(), Arc::new(codec))
}

fn verifactu(chain_accepts_rwe: bool) -> (IntegrationCapability, IntegrationConfig) {
    let mut state_vocab = BTreeMap::new();
    state_vocab.insert("Correcto".to_string(), RemoteState::Accepted);
    state_vocab.insert(
        "ParcialmenteCorrecto".to_string(),
        RemoteState::RegisteredWithErrors,
    );

    let codec = MappedCodec::new(
        FieldMap::new()
            .with(FieldRule::field("serial", "serial").required())
            .with(FieldRule::field("total", "total").required()),
    )
    .with_decode_rules(DecodeRules {
        remote_id_pointer: Some("/csv".to_string()),
        state: Some(StateVocabulary {
            pointer: "/estado".to_string(),
            vocabulary: state_vocab,
        }),
        extract: vec![],
        errors_pointer: Some("/errores".to_string()),
    })
    .with_chain_embed(ChainEmbed {
        fingerprint_field: "previous_fingerprint".to_string(),
        reference_field: None,
    });

    let mut vocabulary = BTreeMap::new();
    vocabulary.insert("Correcto".to_string(), LineVerdict::Accepted);
    vocabulary.insert(
        "ParcialmenteCorrecto".to_string(),
        LineVerdict::AcceptedWithErrors,
    );
    vocabulary.insert("Incorrecto".to_string(), LineVerdict::Rejected);

    let capability = IntegrationCapability::new(
        IntegrationId::new("es-verifactu").unwrap(),
        Arc::new(codec),
    )
    .with_classifier(ClassifierSpec {
        batch_status_pointer: Some("/estado".to_string()),
        vocabulary,
        ..Default::default()
    })
    .with_chain_kind("sale");

    let mut config = IntegrationConfig::new().with_mode(Mode::Demo);
    config.chain_accepts_registered_with_errors = chain_accepts_rwe;
    (capability, config)
}

fn peppol() -> IntegrationCapability {
    let codec = MappedCodec::new(
        FieldMap::new().with(FieldRule::field("document_ref", "document_ref").required()),
    )
    .with_decode_rules(DecodeRules {
        remote_id_pointer: Some("/message_uuid".to_string()),
        ..Default::default()
    });

    let mut vocabulary = BTreeMap::new();
    vocabulary.insert("Queued".to_string(), LineVerdict::Pending);
    vocabulary.insert("Delivered".to_string(), LineVerdict::Accepted);
    vocabulary.insert("Refused".to_string(), LineVerdict::Rejected);

    IntegrationCapability::new(IntegrationId::new("be-peppol").unwrap(), Arc::new(codec))
        .with_classifier(ClassifierSpec {
            batch_status_pointer: Some("/status".to_string()),
            vocabulary,
            ..Default::default()
        })
}

fn ecpay() -> IntegrationCapability {
    card_like("mx-ecpay")
        .with_webhook_reference("/RelateNumber")
        .with_webhook_event_id("/event_id")
}

fn card_like(id: &str) -> IntegrationCapability {
    let codec = MappedCodec::new(
        FieldMap::new().with(FieldRule::field("reference", "reference").required()),
    )
    .with_decode_rules(DecodeRules {
        remote_id_pointer: Some("/id".to_string()),
        ..Default::default()
    });
    IntegrationCapability::new(IntegrationId::new(id).unwrap(), Arc::new(codec))
}

fn demo_config() -> IntegrationConfig {
    IntegrationConfig::new().with_mode(Mode::Demo)
}

fn card_snapshot() -> Snapshot {
    Snapshot::new()
        .with("cardholder_ref", "CH_42")
        .with("card_type", "virtual")
        .with("currency", "EUR")
}

// ---------------------------------------------------------------------------
// Scenario A: card creation happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_card_creation_happy_path() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(
            200,
            &json!({"id": "ic_001", "last4": "4242", "exp_month": 6, "exp_year": 27}),
        ),
    );

    let doc = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            entity,
            &card_snapshot(),
            SyncOperation::Register,
        )
        .await
        .unwrap();

    assert_eq!(doc.status, DocumentStatus::Accepted);

    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.remote_id.as_deref(), Some("ic_001"));
    assert!(!binding.sync_required);
    assert_eq!(binding.last_known_remote_state, Some(RemoteState::Accepted));
    assert_eq!(binding.version_stamp, 1);

    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    // The derived fields come out of the stored response via the codec.
    let registered = harness.registry.get(&integration).unwrap();
    let response = WireResponse::json(200, history[0].response.as_ref().unwrap());
    let decoded = registered.capability.codec.decode(&response, SyncOperation::Register);
    assert_eq!(decoded.extracted.get("last4"), Some(&json!("4242")));
    assert_eq!(decoded.extracted.get("expiration"), Some(&json!("06/27")));
}

// ---------------------------------------------------------------------------
// Property 1: idempotent push
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idempotent_push_reuses_document_and_remote_id() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "ic_001", "last4": "4242"})),
    );

    let first = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &card_snapshot(), SyncOperation::Register)
        .await
        .unwrap();
    let second = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &card_snapshot(), SyncOperation::Register)
        .await
        .unwrap();

    // No intervening local change: the submission is deduplicated.
    assert_eq!(first.id, second.id);
    assert_eq!(harness.demo.request_count(), 1);

    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.remote_id.as_deref(), Some("ic_001"));
}

// ---------------------------------------------------------------------------
// Scenario B + properties 3/4: chained registrations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_b_chained_registrations() {
    let mut registry = IntegrationRegistry::new();
    let (capability, config) = verifactu(false);
    registry.register(capability, config);
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("es-verifactu").unwrap();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"csv": "CSV-1", "estado": "Correcto"})),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"csv": "CSV-2", "estado": "Correcto"})),
    );

    let r1 = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            EntityId::new(),
            &Snapshot::new().with("serial", "INV-001").with("total", "121.00"),
            SyncOperation::Register,
        )
        .await
        .unwrap();
    let r2 = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            EntityId::new(),
            &Snapshot::new().with("serial", "INV-002").with("total", "50.00"),
            SyncOperation::Register,
        )
        .await
        .unwrap();

    // Chain shape.
    assert_eq!(r1.chain_index, Some(0));
    assert_eq!(r2.chain_index, Some(1));
    assert!(r1.predecessor_fingerprint.is_none());
    assert_eq!(r2.predecessor_fingerprint, r1.fingerprint);

    // The second payload embeds the first fingerprint.
    assert_eq!(
        r2.payload.pointer("/previous_fingerprint").and_then(|v| v.as_str()),
        r1.fingerprint.as_deref()
    );

    // Fingerprints are recomputable, 64-char uppercase hex, and distinct.
    let f1 = r1.fingerprint.clone().unwrap();
    let f2 = r2.fingerprint.clone().unwrap();
    assert_eq!(fingerprint(&r1.payload, None), f1);
    assert_eq!(fingerprint(&r2.payload, Some(&f1)), f2);
    assert_ne!(f1, f2);
    for fp in [&f1, &f2] {
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}

#[tokio::test]
async fn chain_skips_failed_documents() {
    let mut registry = IntegrationRegistry::new();
    let (capability, config) = verifactu(false);
    registry.register(capability, config);
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("es-verifactu").unwrap();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"csv": "CSV-1", "estado": "Correcto"})),
    );
    harness.demo.stub_failure(
        &integration,
        SyncOperation::Register,
        TransportErrorKind::Timeout,
        "read timeout",
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"csv": "CSV-3", "estado": "Correcto"})),
    );

    let snapshot = |serial: &str| Snapshot::new().with("serial", serial).with("total", "10.00");

    let r1 = harness
        .orchestrator
        .submit(harness.tenant, &integration, EntityId::new(), &snapshot("INV-001"), SyncOperation::Register)
        .await
        .unwrap();
    let failed = harness
        .orchestrator
        .submit(harness.tenant, &integration, EntityId::new(), &snapshot("INV-002"), SyncOperation::Register)
        .await
        .unwrap();
    let r3 = harness
        .orchestrator
        .submit(harness.tenant, &integration, EntityId::new(), &snapshot("INV-003"), SyncOperation::Register)
        .await
        .unwrap();

    assert_eq!(failed.status, DocumentStatus::SendingFailed);
    // The failed document freed its slot and never became a predecessor.
    assert!(failed.chain_index.is_none());
    assert_eq!(r3.chain_index, Some(1));
    assert_eq!(r3.predecessor_fingerprint, r1.fingerprint);
}

// ---------------------------------------------------------------------------
// Scenario D: registered with errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_d_registered_with_errors_is_not_a_predecessor_by_default() {
    let mut registry = IntegrationRegistry::new();
    let (capability, config) = verifactu(false);
    registry.register(capability, config);
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("es-verifactu").unwrap();
    let entity = EntityId::new();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(
            200,
            &json!({"csv": "CSV-1", "estado": "ParcialmenteCorrecto",
                    "errores": [{"code": "4102", "message": "NIF not registered"}]}),
        ),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"csv": "CSV-2", "estado": "Correcto"})),
    );

    let rwe = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            entity,
            &Snapshot::new().with("serial", "INV-001").with("total", "121.00"),
            SyncOperation::Register,
        )
        .await
        .unwrap();

    assert_eq!(rwe.status, DocumentStatus::RegisteredWithErrors);
    assert_eq!(rwe.errors.len(), 1);
    assert_eq!(rwe.errors[0].code, "4102");

    // Registration with errors still binds and surfaces the state.
    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.remote_id.as_deref(), Some("CSV-1"));
    assert_eq!(
        binding.last_known_remote_state,
        Some(RemoteState::RegisteredWithErrors)
    );

    // Without the config flag it does not hold a chain slot.
    let next = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            EntityId::new(),
            &Snapshot::new().with("serial", "INV-002").with("total", "10.00"),
            SyncOperation::Register,
        )
        .await
        .unwrap();
    assert_eq!(next.chain_index, Some(0));
    assert!(next.predecessor_fingerprint.is_none());
}

#[tokio::test]
async fn registered_with_errors_chains_when_integration_permits() {
    let mut registry = IntegrationRegistry::new();
    let (capability, config) = verifactu(true);
    registry.register(capability, config);
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("es-verifactu").unwrap();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"csv": "CSV-1", "estado": "ParcialmenteCorrecto"})),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"csv": "CSV-2", "estado": "Correcto"})),
    );

    let rwe = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            EntityId::new(),
            &Snapshot::new().with("serial", "INV-001").with("total", "121.00"),
            SyncOperation::Register,
        )
        .await
        .unwrap();
    let next = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            EntityId::new(),
            &Snapshot::new().with("serial", "INV-002").with("total", "10.00"),
            SyncOperation::Register,
        )
        .await
        .unwrap();

    assert_eq!(rwe.chain_index, Some(0));
    assert_eq!(next.chain_index, Some(1));
    assert_eq!(next.predecessor_fingerprint, rwe.fingerprint);
}

// ---------------------------------------------------------------------------
// Scenario C: rejected submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_c_soap_fault_rejection_allows_resubmit() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_like("eg-eta"), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("eg-eta").unwrap();
    let entity = EntityId::new();

    let fault = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
        <soapenv:Body><soapenv:Fault>
            <faultcode>soapenv:Client</faultcode>
            <faultstring>Validation constraint violation</faultstring>
        </soapenv:Fault></soapenv:Body></soapenv:Envelope>"#;
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::new(200, BTreeMap::new(), fault.as_bytes().to_vec()),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "doc-77"})),
    );

    let snapshot = Snapshot::new().with("reference", "D-1");
    let rejected = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &snapshot, SyncOperation::Register)
        .await
        .unwrap();

    assert_eq!(rejected.status, DocumentStatus::Rejected);
    assert_eq!(rejected.errors[0].code, "soapenv:Client");
    assert_eq!(rejected.errors[0].message, "Validation constraint violation");

    // The entity is untouched by the rejection.
    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert!(binding.remote_id.is_none());

    // A subsequent submit goes through.
    let accepted = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &snapshot, SyncOperation::Register)
        .await
        .unwrap();
    assert_eq!(accepted.status, DocumentStatus::Accepted);
    assert_ne!(accepted.id, rejected.id);
}

// ---------------------------------------------------------------------------
// Payload validation fails fast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn incomplete_payload_never_reaches_transport() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    let incomplete = Snapshot::new().with("cardholder_ref", "CH_42");
    let err = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &incomplete, SyncOperation::Register)
        .await
        .unwrap_err();

    match err {
        SyncError::PayloadIncomplete { missing } => {
            assert_eq!(missing, vec!["type".to_string(), "currency".to_string()]);
        }
        other => panic!("expected PayloadIncomplete, got {other:?}"),
    }

    // The attempt is on record, but no transport call happened.
    assert_eq!(harness.demo.request_count(), 0);
    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DocumentStatus::SendingFailed);
    assert_eq!(history[0].errors[0].code, "payload-incomplete");
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_produces_new_document_and_cancels_original() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "ic_001"})),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Cancel,
        WireResponse::json(200, &json!({"status": "canceled"})),
    );

    let registered = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &card_snapshot(), SyncOperation::Register)
        .await
        .unwrap();

    let cancel = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &card_snapshot(), SyncOperation::Cancel)
        .await
        .unwrap();

    assert_ne!(cancel.id, registered.id);
    assert_eq!(cancel.operation, SyncOperation::Cancel);
    assert_eq!(cancel.status, DocumentStatus::Accepted);

    // The original registration moved accepted -> cancelled.
    let original = harness.documents.get(registered.id).await.unwrap().unwrap();
    assert_eq!(original.status, DocumentStatus::Cancelled);

    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.last_known_remote_state, Some(RemoteState::Cancelled));
    // The entity stays bound.
    assert_eq!(binding.remote_id.as_deref(), Some("ic_001"));
}

#[tokio::test]
async fn cancellation_requires_acknowledged_state() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    // Unknown entity: nothing to cancel.
    let err = harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &card_snapshot(), SyncOperation::Cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotBound { .. }));
}

// ---------------------------------------------------------------------------
// Property 5: at-most-one in-flight per entity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_submits_serialize_per_entity() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "ic_001"})),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "ic_001"})),
    );

    let a = {
        let orchestrator = harness.orchestrator.clone();
        let integration = integration.clone();
        let tenant = harness.tenant;
        tokio::spawn(async move {
            orchestrator
                .submit(
                    tenant,
                    &integration,
                    entity,
                    &card_snapshot().with("nickname", "a"),
                    SyncOperation::Register,
                )
                .await
        })
    };
    let b = {
        let orchestrator = harness.orchestrator.clone();
        let integration = integration.clone();
        let tenant = harness.tenant;
        tokio::spawn(async move {
            orchestrator
                .submit(
                    tenant,
                    &integration,
                    entity,
                    &card_snapshot().with("nickname", "b"),
                    SyncOperation::Register,
                )
                .await
        })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);

    // Serialized: the first document finished before the second started.
    let first = &history[0];
    let second = &history[1];
    assert!(first.response_at.unwrap() <= second.created_at);

    // Remote id is stable across both.
    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.remote_id.as_deref(), Some("ic_001"));
}

// ---------------------------------------------------------------------------
// Scenario F: webhook dedup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_f_duplicate_webhook_yields_one_document() {
    let mut registry = IntegrationRegistry::new();
    registry.register(
        ecpay(),
        demo_config().with_webhook_auth(WebhookAuth::None),
    );
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("mx-ecpay").unwrap();
    let entity = EntityId::new();

    // The entity is already bound to the remote reference.
    let mut binding = EntityBinding::new(harness.tenant, integration.clone(), entity);
    binding.bind("REF-1").unwrap();
    harness.bindings.upsert(&binding).await.unwrap();

    let dispatcher = harness.dispatcher();
    let body = json!({"RelateNumber": "REF-1", "event_id": "evt-9", "ok": true}).to_string();

    let first = dispatcher
        .handle(&integration, &BTreeMap::new(), body.as_bytes())
        .await
        .unwrap();
    assert!(first.is_some());

    tokio::time::sleep(Duration::from_millis(500)).await;

    let second = dispatcher
        .handle(&integration, &BTreeMap::new(), body.as_bytes())
        .await
        .unwrap();
    assert!(second.is_none());

    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation, SyncOperation::Query);
    assert_eq!(history[0].status, DocumentStatus::Accepted);
}

#[tokio::test]
async fn webhook_with_unknown_reference_is_rejected() {
    let mut registry = IntegrationRegistry::new();
    registry.register(ecpay(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("mx-ecpay").unwrap();

    let dispatcher = harness.dispatcher();
    let body = json!({"RelateNumber": "NOBODY", "event_id": "evt-1"}).to_string();
    let err = dispatcher
        .handle(&integration, &BTreeMap::new(), body.as_bytes())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::WebhookRejected { .. }));
}

// ---------------------------------------------------------------------------
// Poller: async acknowledgement driven to a terminal state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poller_drives_sent_document_to_accepted() {
    let mut registry = IntegrationRegistry::new();
    let mut config = demo_config();
    config.poll_interval_secs = 0;
    registry.register(peppol(), config);
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("be-peppol").unwrap();
    let entity = EntityId::new();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"message_uuid": "msg-1", "status": "Queued"})),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Query,
        WireResponse::json(200, &json!({"status": "Delivered"})),
    );

    let doc = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            entity,
            &Snapshot::new().with("document_ref", "INV-9"),
            SyncOperation::Register,
        )
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Sent);

    let poller = Poller::new(
        harness.orchestrator.clone(),
        harness.registry.clone(),
        harness.bindings.clone(),
        harness.documents.clone(),
        PollerConfig::default(),
    );
    poller.sweep().await;

    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].operation, SyncOperation::Query);
    assert_eq!(history[1].status, DocumentStatus::Accepted);

    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.remote_id.as_deref(), Some("msg-1"));
    assert_eq!(binding.last_known_remote_state, Some(RemoteState::Accepted));
}

#[tokio::test]
async fn poller_redrives_sending_failed_submission() {
    let mut registry = IntegrationRegistry::new();
    let mut config = demo_config();
    config.initial_backoff_secs = 0;
    registry.register(card_like("dk-nemhandel"), config);
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("dk-nemhandel").unwrap();
    let entity = EntityId::new();

    harness.demo.stub_failure(
        &integration,
        SyncOperation::Register,
        TransportErrorKind::Connection,
        "connection reset",
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "doc-1"})),
    );

    let failed = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            entity,
            &Snapshot::new().with("reference", "R-1"),
            SyncOperation::Register,
        )
        .await
        .unwrap();
    assert_eq!(failed.status, DocumentStatus::SendingFailed);

    let poller = Poller::new(
        harness.orchestrator.clone(),
        harness.registry.clone(),
        harness.bindings.clone(),
        harness.documents.clone(),
        PollerConfig::default(),
    );
    poller.sweep().await;

    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].status, DocumentStatus::Accepted);

    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.remote_id.as_deref(), Some("doc-1"));
}

// ---------------------------------------------------------------------------
// Scenario E: auth expiry through the real HTTP transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_e_auth_expiry_retry_produces_single_accepted_document() {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/einvoice"))
        .and(header("authorization", "Bearer stale-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"error": {"code": "1005", "message": "token expired"}})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "fresh-token"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/einvoice"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "e-77"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut capability = card_like("tr-nilvera");
    capability.auth_header = Some(AuthHeaderSpec {
        header: "Authorization".to_string(),
        scheme: Some("Bearer".to_string()),
    });
    capability.auth_expired_codes = vec!["1005".to_string()];
    capability.reauth = Some(ReauthSpec {
        endpoints: BTreeMap::from([(Mode::Test, format!("{}/token", server.uri()))]),
        token_pointer: "/token".to_string(),
    });
    let capability = capability.with_endpoint(
        Mode::Test,
        SyncOperation::Register,
        format!("{}/einvoice", server.uri()),
    );

    let mut registry = IntegrationRegistry::new();
    registry.register(capability, IntegrationConfig::new().with_mode(Mode::Test));

    let harness = Harness::with_transport(registry, |credentials| {
        Some(Arc::new(HttpTransport::new(credentials.clone())) as Arc<dyn Transport>)
    });
    let integration = IntegrationId::new("tr-nilvera").unwrap();
    harness
        .credentials
        .set(
            &integration,
            Mode::Test,
            Credential::new()
                .with_api_key("api-key-1")
                .with_secret("secret-1")
                .with_cmc_token("stale-token"),
        )
        .await
        .unwrap();

    let entity = EntityId::new();
    let doc = harness
        .orchestrator
        .submit(
            harness.tenant,
            &integration,
            entity,
            &Snapshot::new().with("reference", "INV-1"),
            SyncOperation::Register,
        )
        .await
        .unwrap();

    // Exactly one document, accepted, after the single re-auth retry.
    assert_eq!(doc.status, DocumentStatus::Accepted);
    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    // The fresh token is persisted.
    let credential = harness
        .credentials
        .get(&integration, Mode::Test)
        .await
        .unwrap();
    assert_eq!(credential.cmc_token.as_deref(), Some("fresh-token"));
}

// ---------------------------------------------------------------------------
// Collaborator facade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn service_facade_round_trip() {
    use remsync_engine::SyncService;

    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    let service = SyncService::new(
        harness.orchestrator.clone(),
        harness.documents.clone(),
        harness.credentials.clone(),
    );

    service
        .set_credentials(&integration, Mode::Demo, Credential::new().with_api_key("k"))
        .await
        .unwrap();
    assert_eq!(
        harness
            .credentials
            .get(&integration, Mode::Demo)
            .await
            .unwrap()
            .api_key
            .as_deref(),
        Some("k")
    );

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "ic_001"})),
    );
    let doc = service
        .submit(harness.tenant, &integration, entity, &card_snapshot(), SyncOperation::Register)
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Accepted);

    let history = service.history(harness.tenant, &integration, entity).await.unwrap();
    assert_eq!(history.len(), 1);

    let stats = service.stats(&integration).await.unwrap();
    assert_eq!(stats.get("accepted"), Some(&1));

    // A local edit flags the entity for the next push.
    service.mark_modified(harness.tenant, &integration, entity).await.unwrap();
    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert!(binding.sync_required);
}

// ---------------------------------------------------------------------------
// Unbind
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unbind_deactivates_then_clears_identity() {
    let mut registry = IntegrationRegistry::new();
    registry.register(card_issuing(), demo_config());
    let harness = Harness::new(registry);
    let integration = IntegrationId::new("card-issuing").unwrap();
    let entity = EntityId::new();

    harness.demo.stub(
        &integration,
        SyncOperation::Register,
        WireResponse::json(200, &json!({"id": "ic_001"})),
    );
    harness.demo.stub(
        &integration,
        SyncOperation::Cancel,
        WireResponse::json(200, &json!({"status": "canceled"})),
    );

    harness
        .orchestrator
        .submit(harness.tenant, &integration, entity, &card_snapshot(), SyncOperation::Register)
        .await
        .unwrap();
    harness
        .orchestrator
        .unbind(harness.tenant, &integration, entity, &card_snapshot())
        .await
        .unwrap();

    let binding = harness
        .bindings
        .get(harness.tenant, &integration, entity)
        .await
        .unwrap()
        .unwrap();
    assert!(binding.remote_id.is_none());
    assert!(binding.sync_required);

    // The deactivation went out before the unbind.
    let history = harness
        .documents
        .history(harness.tenant, &integration, entity)
        .await
        .unwrap();
    assert_eq!(history.last().unwrap().operation, SyncOperation::Cancel);
}
