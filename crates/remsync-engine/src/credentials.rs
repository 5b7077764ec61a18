//! Postgres credential store.
//!
//! Credential records are encrypted with AES-256-GCM before they touch the
//! database; the row stores only the base64 blob. Writes are serialized per
//! (integration, mode) so token rotation never races an operator `set`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::instrument;

use remsync_core::credentials::{Credential, CredentialStore};
use remsync_core::crypto::{decrypt_secret, encrypt_secret};
use remsync_core::error::{SyncError, SyncResult};
use remsync_core::ids::IntegrationId;
use remsync_core::types::Mode;

use crate::chain::LockRegistry;

/// Credential store over Postgres with encryption at rest.
pub struct PgCredentialStore {
    pool: PgPool,
    key: [u8; 32],
    write_locks: LockRegistry<(IntegrationId, Mode)>,
}

impl PgCredentialStore {
    /// Create a store over a pool with the given encryption key.
    #[must_use]
    pub fn new(pool: PgPool, key: [u8; 32]) -> Self {
        Self {
            pool,
            key,
            write_locks: LockRegistry::new(),
        }
    }

    async fn fetch(&self, integration: &IntegrationId, mode: Mode) -> SyncResult<Option<Credential>> {
        let row = sqlx::query(
            r"
            SELECT encrypted FROM sync_credentials
            WHERE integration = $1 AND mode = $2
            ",
        )
        .bind(integration.as_str())
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::database_with_source("fetch credential", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let encrypted: String = row.get("encrypted");
        let plaintext = decrypt_secret(&encrypted, &self.key)?;
        Ok(Some(serde_json::from_str(&plaintext)?))
    }

    async fn persist(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        credential: &Credential,
    ) -> SyncResult<()> {
        let plaintext = serde_json::to_string(credential)?;
        let encrypted = encrypt_secret(&plaintext, &self.key)?;

        sqlx::query(
            r"
            INSERT INTO sync_credentials (integration, mode, encrypted, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (integration, mode) DO UPDATE SET
                encrypted = EXCLUDED.encrypted,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(integration.as_str())
        .bind(mode.as_str())
        .bind(&encrypted)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::database_with_source("persist credential", e))?;

        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    #[instrument(skip(self))]
    async fn get(&self, integration: &IntegrationId, mode: Mode) -> SyncResult<Credential> {
        self.fetch(integration, mode).await?.ok_or_else(|| {
            SyncError::config_missing(integration.clone(), mode, "credential")
        })
    }

    #[instrument(skip(self, credential))]
    async fn set(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        credential: Credential,
    ) -> SyncResult<()> {
        let _guard = self
            .write_locks
            .acquire((integration.clone(), mode))
            .await;
        self.persist(integration, mode, &credential).await
    }

    #[instrument(skip(self, token))]
    async fn rotate_token(
        &self,
        integration: &IntegrationId,
        mode: Mode,
        token: String,
    ) -> SyncResult<()> {
        let _guard = self
            .write_locks
            .acquire((integration.clone(), mode))
            .await;
        let mut credential = self.fetch(integration, mode).await?.unwrap_or_default();
        credential.cmc_token = Some(token);
        self.persist(integration, mode, &credential).await
    }
}
