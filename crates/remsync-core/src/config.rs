//! Per-integration configuration.
//!
//! All configuration is persisted data handed in by the collaborator; no
//! environment variables. Defaults match the common case so a config record
//! can be `{}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::{Mode, SyncOperation};

/// Configuration record for one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Operating mode.
    #[serde(default)]
    pub mode: Mode,

    /// Endpoint URL overrides per operation, taking precedence over the
    /// capability's defaults for the active mode.
    #[serde(default)]
    pub endpoint_overrides: BTreeMap<SyncOperation, String>,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Per-operation read timeout overrides in seconds.
    #[serde(default)]
    pub operation_timeout_secs: BTreeMap<SyncOperation, u64>,

    /// Poll cadence in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Initial retry backoff in seconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    /// Retry backoff cap in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Webhook authentication scheme.
    #[serde(default)]
    pub webhook_auth: WebhookAuth,

    /// Webhook shared secret / signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,

    /// Webhook deduplication window in seconds.
    #[serde(default = "default_dedup_window")]
    pub webhook_dedup_window_secs: u64,

    /// Whether a `registered_with_errors` document may serve as a chain
    /// predecessor. The integrations disagree on this; it is config, not a
    /// constant.
    #[serde(default)]
    pub chain_accepts_registered_with_errors: bool,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    300
}

fn default_initial_backoff() -> u64 {
    60
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_dedup_window() -> u64 {
    600
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            endpoint_overrides: BTreeMap::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            operation_timeout_secs: BTreeMap::new(),
            poll_interval_secs: default_poll_interval(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            webhook_auth: WebhookAuth::default(),
            webhook_secret: None,
            webhook_dedup_window_secs: default_dedup_window(),
            chain_accepts_registered_with_errors: false,
        }
    }
}

impl IntegrationConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mode.
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the webhook auth scheme.
    #[must_use]
    pub fn with_webhook_auth(mut self, auth: WebhookAuth) -> Self {
        self.webhook_auth = auth;
        self
    }

    /// Set the webhook secret.
    #[must_use]
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Override one operation's endpoint.
    #[must_use]
    pub fn with_endpoint_override(
        mut self,
        operation: SyncOperation,
        url: impl Into<String>,
    ) -> Self {
        self.endpoint_overrides.insert(operation, url.into());
        self
    }

    /// Connect timeout as a `Duration`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout for an operation, honoring the per-operation override.
    #[must_use]
    pub fn read_timeout(&self, operation: SyncOperation) -> Duration {
        let secs = self
            .operation_timeout_secs
            .get(&operation)
            .copied()
            .unwrap_or(self.read_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Retry backoff after `attempt` consecutive failures, exponential and
    /// clamped to the configured cap.
    #[must_use]
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff_secs
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_secs(exp.min(self.max_backoff_secs))
    }
}

/// How a webhook caller is authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    /// No application-level authentication (mTLS terminated upstream, or a
    /// trusted network path).
    #[default]
    None,
    /// A shared secret presented verbatim in a header.
    SharedSecret {
        /// Header carrying the secret.
        header: String,
    },
    /// HMAC-SHA256 signature over `{timestamp}.{body}`.
    Signature {
        /// Header carrying the hex signature.
        signature_header: String,
        /// Header carrying the unix timestamp.
        timestamp_header: String,
        /// Maximum accepted clock skew in seconds.
        tolerance_secs: u64,
    },
}
