//! # Transport
//!
//! Endpoint resolution and HTTP execution for the sync engine.
//!
//! The [`Transport`](request::Transport) trait performs one round-trip with
//! the integration's auth. [`HttpTransport`](client::HttpTransport) is the
//! real executor on reqwest; [`DemoTransport`](demo::DemoTransport)
//! short-circuits with canned responses so the rest of the pipeline can be
//! exercised deterministically.
//!
//! ## Behavior
//!
//! - Connect/read timeouts are bounded, with per-operation overrides.
//! - Integrations requiring client-certificate auth get their identity
//!   loaded from the credential store and installed on the connection.
//! - HTTP-level failures come back as typed transport errors with subkind
//!   timeout/connection/http-error/tls.
//! - On a remote authentication-expired indicator (per-integration code
//!   table), the executor re-authenticates once and retries exactly once.
//! - A response header carrying a rotated communication token is persisted
//!   before anything else happens.

pub mod client;
pub mod demo;
pub mod endpoint;
pub mod request;

pub use client::HttpTransport;
pub use demo::DemoTransport;
pub use endpoint::EndpointResolver;
pub use request::{ResolvedReauth, Transport, TransportRequest};
