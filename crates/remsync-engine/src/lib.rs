//! # Sync Engine
//!
//! The orchestration layer over [`remsync_core`] and [`remsync_transport`]:
//! entity bindings, the append-only document registry with hash chaining,
//! the per-entity state machine, the status poller, and the webhook ingress
//! dispatcher.
//!
//! ## Ownership
//!
//! - The [`orchestrator::Orchestrator`] exclusively owns writes to binding
//!   state (remote id, sync-required, last known remote state).
//! - The document stores own [`document::SyncDocument`] rows; payloads and
//!   chain fingerprints are immutable after creation, responses are
//!   write-once.
//! - Credential stores own credential rows; token rotation is serialized
//!   per (integration, mode).
//!
//! ## Concurrency
//!
//! Single-threaded cooperative per entity, parallel across entities. The
//! per-(tenant, integration, entity) advisory lock is held across the
//! transport call; the chain scope lock spans document creation only.

pub mod binder;
pub mod binding;
pub mod chain;
pub mod credentials;
pub mod document;
pub mod ingress;
pub mod orchestrator;
pub mod poller;
pub mod router;
pub mod service;
pub mod store;

pub use binding::EntityBinding;
pub use chain::ChainScope;
pub use document::{NewDocument, SyncDocument};
pub use orchestrator::Orchestrator;
pub use poller::{Poller, PollerConfig};
pub use service::SyncService;
