//! # Synchronization Core
//!
//! Core abstractions for reconciling locally-modeled business entities with
//! remote third-party services (card issuers, e-invoice clearance platforms,
//! fiscal registries).
//!
//! Every integration implements the same pattern: derive a remote payload
//! from local state, push it, reconcile the remote identifier back, poll and
//! interpret asynchronous status, and keep an auditable, hash-chained log of
//! every submission. This crate provides the integration-agnostic pieces:
//!
//! - [`capability::IntegrationCapability`] - per-integration capability record
//! - [`codec::PayloadCodec`] - snapshot-to-wire conversion, driven by a
//!   declarative [`fieldmap::FieldMap`]
//! - [`classify`] - remote response classification onto a common status set
//! - [`fingerprint`] - canonical serialization and chain fingerprints
//! - [`credentials`] - per-tenant secrets with mandatory token rotation
//! - [`error`] - the typed failure taxonomy with transient/permanent split
//!
//! ## Crate Organization
//!
//! - [`ids`] - type-safe identifiers (`EntityId`, `IntegrationId`, ...)
//! - [`types`] - modes, operations, status lattices, MIME hints
//! - [`error`] - error types with transient/permanent classification
//! - [`snapshot`] - the local entity snapshot handed to codecs
//! - [`fieldmap`] - declarative field mapping and extraction rules
//! - [`fingerprint`] - canonical JSON, chain fingerprints, idempotency keys
//! - [`codec`] - codec trait and the field-map driven implementation
//! - [`classify`] - response classifier
//! - [`credentials`] - credential record and store contract
//! - [`crypto`] - secret encryption at rest, webhook signatures
//! - [`config`] - per-integration configuration
//! - [`capability`] - capability records and the startup registry

pub mod capability;
pub mod classify;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod fieldmap;
pub mod fingerprint;
pub mod ids;
pub mod snapshot;
pub mod types;

/// Prelude module for convenient imports.
///
/// ```
/// use remsync_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::ids::{EntityId, EventId, IntegrationId, TenantId};

    pub use crate::types::{
        DocumentStatus, HttpMethod, MimeHint, Mode, RemoteState, SyncOperation, WireResponse,
    };

    pub use crate::error::{RemoteError, SyncError, SyncResult, TransportErrorKind};

    pub use crate::snapshot::{FieldValue, Snapshot};

    pub use crate::fieldmap::{ExtractRule, ExtractSource, FieldMap, FieldRule, FieldSource, Transform};

    pub use crate::codec::{ChainContext, DecodeRules, DecodedResponse, MappedCodec, PayloadCodec, SearchFilter};

    pub use crate::classify::{Classification, ClassifierSpec, LineVerdict};

    pub use crate::credentials::{Credential, CredentialStore, MemoryCredentialStore};

    pub use crate::config::{IntegrationConfig, WebhookAuth};

    pub use crate::capability::{IntegrationCapability, IntegrationRegistry, RegisteredIntegration};
}

// Re-export async_trait for store and transport implementors
pub use async_trait::async_trait;
