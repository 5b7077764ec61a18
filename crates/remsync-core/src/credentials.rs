//! Credential records and the store contract.
//!
//! Credentials are keyed by (integration, mode). The `cmc_token` field is
//! opaque and rotated by the remote service; storing the value from any
//! response that carries one is mandatory, which is why `rotate_token` is a
//! first-class operation with serialized writes per key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncResult;
use crate::ids::IntegrationId;
use crate::types::Mode;

/// Secrets for one (integration, mode) pair.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    /// API key, sent per the integration's auth header spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Shared secret (webhook signatures, basic auth passwords).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// PEM bundle with client certificate and private key, for integrations
    /// requiring mutual TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_pem: Option<String>,

    /// Opaque communication token rotated by the remote service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmc_token: Option<String>,
}

impl Credential {
    /// Create an empty credential record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API key using builder pattern.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the shared secret using builder pattern.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Set the client certificate PEM using builder pattern.
    #[must_use]
    pub fn with_client_cert_pem(mut self, pem: impl Into<String>) -> Self {
        self.client_cert_pem = Some(pem.into());
        self
    }

    /// Set the communication token using builder pattern.
    #[must_use]
    pub fn with_cmc_token(mut self, token: impl Into<String>) -> Self {
        self.cmc_token = Some(token.into());
        self
    }

    /// Whether any secret material is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.api_key.is_none()
            && self.secret.is_none()
            && self.client_cert_pem.is_none()
            && self.cmc_token.is_none()
    }
}

// Credentials never leak into logs; Debug shows presence only.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field(
                "client_cert_pem",
                &self.client_cert_pem.as_ref().map(|_| "<redacted>"),
            )
            .field("cmc_token", &self.cmc_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Store of per-tenant integration secrets.
///
/// Implementations serialize writes per (integration, mode): token rotation
/// must not race with a concurrent `set`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the credential for an integration and mode.
    ///
    /// Fails with `ConfigMissing` when nothing is installed.
    async fn get(&self, integration: &IntegrationId, mode: Mode) -> SyncResult<Credential>;

    /// Install or replace the credential for an integration and mode.
    async fn set(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        credential: Credential,
    ) -> SyncResult<()>;

    /// Store a freshly rotated communication token.
    ///
    /// Leaves every other field untouched.
    async fn rotate_token(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        token: String,
    ) -> SyncResult<()>;
}

/// In-memory credential store.
///
/// Backs demo mode and tests. Writes are serialized by the inner lock,
/// which covers the per-(integration, mode) serialization contract.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: std::sync::Mutex<std::collections::HashMap<(IntegrationId, Mode), Credential>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, integration: &IntegrationId, mode: Mode) -> SyncResult<Credential> {
        let inner = self.inner.lock().expect("credential store lock poisoned");
        inner
            .get(&(integration.clone(), mode))
            .cloned()
            .ok_or_else(|| {
                crate::error::SyncError::config_missing(integration.clone(), mode, "credential")
            })
    }

    async fn set(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        credential: Credential,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().expect("credential store lock poisoned");
        inner.insert((integration.clone(), mode), credential);
        Ok(())
    }

    async fn rotate_token(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        token: String,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().expect("credential store lock poisoned");
        let entry = inner.entry((integration.clone(), mode)).or_default();
        entry.cmc_token = Some(token);
        Ok(())
    }
}
