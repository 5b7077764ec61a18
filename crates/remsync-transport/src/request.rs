//! Transport contract.
//!
//! A [`TransportRequest`] is fully resolved before execution: URL, method,
//! headers, timeouts, and the wire-level quirks the executor needs (auth
//! header shape, auth-expired code table, re-auth endpoint, token rotation
//! header). The executor never consults the capability registry.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use remsync_core::capability::AuthHeaderSpec;
use remsync_core::error::SyncResult;
use remsync_core::ids::IntegrationId;
use remsync_core::types::{HttpMethod, Mode, SyncOperation, WireResponse};

/// Resolved re-authentication instructions.
#[derive(Debug, Clone)]
pub struct ResolvedReauth {
    /// Token endpoint for the active mode.
    pub url: String,
    /// JSON pointer to the token in the auth response.
    pub token_pointer: String,
}

/// One fully-resolved outbound request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Integration this request belongs to.
    pub integration: IntegrationId,
    /// Active mode.
    pub mode: Mode,
    /// Operation being performed.
    pub operation: SyncOperation,
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Request headers, auth included.
    pub headers: Vec<(String, String)>,
    /// Query string parameters (search filters).
    pub query: Vec<(String, String)>,
    /// JSON body, absent for GETs.
    pub body: Option<Value>,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Read timeout for this operation.
    pub read_timeout: Duration,
    /// How the auth credential travels, for the re-auth retry.
    pub auth_header: Option<AuthHeaderSpec>,
    /// Remote codes meaning "authentication expired".
    pub auth_expired_codes: Vec<String>,
    /// Re-authentication instructions, when the integration rotates tokens.
    pub reauth: Option<ResolvedReauth>,
    /// Response header carrying a rotated communication token.
    pub token_rotation_header: Option<String>,
}

impl TransportRequest {
    /// Minimal request for tests and demo mode.
    #[must_use]
    pub fn demo(integration: IntegrationId, operation: SyncOperation) -> Self {
        Self {
            url: format!("demo://{integration}/{operation}"),
            integration,
            mode: Mode::Demo,
            operation,
            method: HttpMethod::Post,
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            auth_header: None,
            auth_expired_codes: Vec::new(),
            reauth: None,
            token_rotation_header: None,
        }
    }
}

/// Executes one HTTP(S) round-trip with the integration's auth.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request.
    ///
    /// Business-level failures come back inside the [`WireResponse`];
    /// `Err` means the transport itself failed and no remote effect may be
    /// assumed.
    async fn execute(&self, request: &TransportRequest) -> SyncResult<WireResponse>;
}
