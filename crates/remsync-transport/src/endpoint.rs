//! Endpoint resolution.
//!
//! Maps (integration, mode, operation) to a URL and auth headers. Override
//! precedence: per-integration config overrides beat the capability's
//! default endpoint table. A gap in live or test mode is a configuration
//! error; demo mode needs no endpoints because transport is
//! short-circuited.

use std::sync::Arc;

use remsync_core::capability::RegisteredIntegration;
use remsync_core::credentials::{Credential, CredentialStore};
use remsync_core::error::{SyncError, SyncResult};
use remsync_core::types::{Mode, SyncOperation};
use serde_json::Value;

use crate::request::{ResolvedReauth, TransportRequest};

/// Resolves endpoints and assembles [`TransportRequest`]s.
pub struct EndpointResolver {
    credentials: Arc<dyn CredentialStore>,
}

impl EndpointResolver {
    /// Create a resolver over a credential store.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Resolve the URL for an operation.
    pub fn url(
        &self,
        registered: &RegisteredIntegration,
        operation: SyncOperation,
    ) -> SyncResult<String> {
        let capability = &registered.capability;
        let config = &registered.config;

        if let Some(url) = config.endpoint_overrides.get(&operation) {
            return Ok(url.clone());
        }
        if let Some(url) = capability.endpoint(config.mode, operation) {
            return Ok(url.to_string());
        }
        if config.mode == Mode::Demo {
            return Ok(format!("demo://{}/{}", capability.id, operation));
        }
        Err(SyncError::config_missing(
            capability.id.clone(),
            config.mode,
            format!("endpoint for operation '{operation}'"),
        ))
    }

    /// Resolve the request headers for an operation, auth included.
    pub async fn headers(
        &self,
        registered: &RegisteredIntegration,
        operation: SyncOperation,
    ) -> SyncResult<Vec<(String, String)>> {
        let capability = &registered.capability;
        let config = &registered.config;

        let mut headers = vec![("accept".to_string(), "application/json".to_string())];
        if operation.is_mutating() {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }

        if let Some(spec) = &capability.auth_header {
            let credential = self.credential_for(registered).await?;
            let token = credential
                .cmc_token
                .as_deref()
                .or(credential.api_key.as_deref());
            match token {
                Some(token) => {
                    let value = match &spec.scheme {
                        Some(scheme) => format!("{scheme} {token}"),
                        None => token.to_string(),
                    };
                    headers.push((spec.header.to_lowercase(), value));
                }
                None if config.mode == Mode::Demo => {}
                None => {
                    return Err(SyncError::config_missing(
                        capability.id.clone(),
                        config.mode,
                        "credential",
                    ));
                }
            }
        }

        Ok(headers)
    }

    /// Assemble a complete transport request.
    pub async fn build_request(
        &self,
        registered: &RegisteredIntegration,
        operation: SyncOperation,
        body: Option<Value>,
        query: Vec<(String, String)>,
        idempotency_key: Option<&str>,
    ) -> SyncResult<TransportRequest> {
        let capability = &registered.capability;
        let config = &registered.config;

        let url = self.url(registered, operation)?;
        let mut headers = self.headers(registered, operation).await?;

        if let (Some(header), Some(key)) = (&capability.idempotency_header, idempotency_key) {
            headers.push((header.to_lowercase(), key.to_string()));
        }

        let reauth = capability.reauth.as_ref().and_then(|spec| {
            spec.endpoints.get(&config.mode).map(|url| ResolvedReauth {
                url: url.clone(),
                token_pointer: spec.token_pointer.clone(),
            })
        });

        Ok(TransportRequest {
            integration: capability.id.clone(),
            mode: config.mode,
            operation,
            method: capability.method(operation),
            url,
            headers,
            query,
            body,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(operation),
            auth_header: capability.auth_header.clone(),
            auth_expired_codes: capability.auth_expired_codes.clone(),
            reauth,
            token_rotation_header: capability.token_rotation_header.clone(),
        })
    }

    async fn credential_for(&self, registered: &RegisteredIntegration) -> SyncResult<Credential> {
        let config = &registered.config;
        match self
            .credentials
            .get(&registered.capability.id, config.mode)
            .await
        {
            Ok(credential) => Ok(credential),
            // Demo mode runs fine without installed secrets.
            Err(SyncError::ConfigMissing { .. }) if config.mode == Mode::Demo => {
                Ok(Credential::new())
            }
            Err(e) => Err(e),
        }
    }
}
