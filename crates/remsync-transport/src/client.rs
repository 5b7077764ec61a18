//! HTTP transport executor.
//!
//! One reqwest client per (integration, mode), built with the configured
//! timeouts and, when the integration requires mutual TLS, the client
//! identity loaded from the credential store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use remsync_core::credentials::CredentialStore;
use remsync_core::error::{SyncError, SyncResult, TransportErrorKind};
use remsync_core::ids::IntegrationId;
use remsync_core::types::{HttpMethod, Mode, WireResponse};

use crate::request::{Transport, TransportRequest};

/// HTTP executor on reqwest.
pub struct HttpTransport {
    credentials: Arc<dyn CredentialStore>,
    clients: RwLock<HashMap<(IntegrationId, Mode), Arc<Client>>>,
}

impl HttpTransport {
    /// Create an executor over a credential store.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Get or build the client for a request's integration and mode.
    async fn client_for(&self, request: &TransportRequest) -> SyncResult<Arc<Client>> {
        let key = (request.integration.clone(), request.mode);
        {
            let clients = self.clients.read().expect("client cache lock poisoned");
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }

        let mut builder = Client::builder()
            .use_rustls_tls()
            .connect_timeout(request.connect_timeout);

        // Client-certificate auth where the integration requires it.
        let credential = match self.credentials.get(&request.integration, request.mode).await {
            Ok(credential) => Some(credential),
            Err(SyncError::ConfigMissing { .. }) => None,
            Err(e) => return Err(e),
        };
        if let Some(pem) = credential.as_ref().and_then(|c| c.client_cert_pem.as_deref()) {
            let identity = reqwest::Identity::from_pem(pem.as_bytes()).map_err(|e| {
                SyncError::transport_with_source(
                    TransportErrorKind::Tls,
                    "invalid client certificate PEM",
                    e,
                )
            })?;
            builder = builder.identity(identity);
        }

        let client = Arc::new(builder.build().map_err(|e| {
            SyncError::transport_with_source(
                TransportErrorKind::Connection,
                "failed to build HTTP client",
                e,
            )
        })?);

        let mut clients = self.clients.write().expect("client cache lock poisoned");
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Send the request once, optionally overriding the auth header value
    /// after a re-authentication.
    async fn send_once(
        &self,
        client: &Client,
        request: &TransportRequest,
        auth_override: Option<&str>,
    ) -> SyncResult<WireResponse> {
        let method = to_reqwest_method(request.method);
        let mut builder = client
            .request(method, &request.url)
            .timeout(request.read_timeout);

        let auth_header_name = request
            .auth_header
            .as_ref()
            .map(|spec| spec.header.to_lowercase());
        for (name, value) in &request.headers {
            let overridden = match (&auth_header_name, auth_override) {
                (Some(auth_name), Some(token)) if auth_name == name => {
                    let spec = request.auth_header.as_ref().expect("auth header spec");
                    match &spec.scheme {
                        Some(scheme) => format!("{scheme} {token}"),
                        None => token.to_string(),
                    }
                }
                _ => value.clone(),
            };
            builder = builder.header(name.as_str(), overridden);
        }

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(
            url = %request.url,
            method = %request.method,
            operation = %request.operation,
            "sending request"
        );

        let response = builder.send().await.map_err(normalize_error)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(normalize_error)?
            .to_vec();

        Ok(WireResponse::new(status, headers, body))
    }

    /// Persist a rotated communication token the moment it shows up.
    async fn capture_rotated_token(
        &self,
        request: &TransportRequest,
        response: &WireResponse,
    ) -> SyncResult<()> {
        let Some(header) = &request.token_rotation_header else {
            return Ok(());
        };
        if let Some(token) = response.headers.get(&header.to_lowercase()) {
            debug!(integration = %request.integration, "storing rotated communication token");
            self.credentials
                .rotate_token(&request.integration, request.mode, token.clone())
                .await?;
        }
        Ok(())
    }

    /// Obtain a fresh token from the integration's auth endpoint.
    async fn reauthenticate(
        &self,
        client: &Client,
        request: &TransportRequest,
    ) -> SyncResult<String> {
        let reauth = request
            .reauth
            .as_ref()
            .ok_or_else(|| SyncError::AuthExpired {
                integration: request.integration.clone(),
            })?;

        let credential = self
            .credentials
            .get(&request.integration, request.mode)
            .await?;
        let mut body = serde_json::Map::new();
        if let Some(api_key) = &credential.api_key {
            body.insert("api_key".to_string(), Value::String(api_key.clone()));
        }
        if let Some(secret) = &credential.secret {
            body.insert("secret".to_string(), Value::String(secret.clone()));
        }

        let response = client
            .post(&reauth.url)
            .timeout(request.read_timeout)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(normalize_error)?;

        if !response.status().is_success() {
            return Err(SyncError::AuthExpired {
                integration: request.integration.clone(),
            });
        }

        let body: Value = response.json().await.map_err(normalize_error)?;
        let token = body
            .pointer(&reauth.token_pointer)
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::AuthExpired {
                integration: request.integration.clone(),
            })?
            .to_string();

        self.credentials
            .rotate_token(&request.integration, request.mode, token.clone())
            .await?;

        Ok(token)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(integration = %request.integration, operation = %request.operation))]
    async fn execute(&self, request: &TransportRequest) -> SyncResult<WireResponse> {
        let client = self.client_for(request).await?;

        let response = self.send_once(&client, request, None).await?;
        self.capture_rotated_token(request, &response).await?;

        let response = if is_auth_expired(request, &response) {
            warn!(
                integration = %request.integration,
                "remote signalled expired authentication, re-authenticating once"
            );
            let token = self.reauthenticate(&client, request).await?;
            let retried = self.send_once(&client, request, Some(&token)).await?;
            self.capture_rotated_token(request, &retried).await?;
            if is_auth_expired(request, &retried) {
                return Err(SyncError::AuthExpired {
                    integration: request.integration.clone(),
                });
            }
            retried
        } else {
            response
        };

        if response.status >= 500 {
            return Err(SyncError::transport(
                TransportErrorKind::HttpError,
                format!("remote returned HTTP {}", response.status),
            ));
        }

        Ok(response)
    }
}

/// Check the per-integration auth-expired indicators.
///
/// A 401 counts when the integration can re-authenticate at all; otherwise
/// the body is matched against the integration's error code table.
fn is_auth_expired(request: &TransportRequest, response: &WireResponse) -> bool {
    if request.reauth.is_none() {
        return false;
    }
    if response.status == 401 {
        return true;
    }
    if request.auth_expired_codes.is_empty() {
        return false;
    }
    let Some(body) = response.as_json() else {
        return false;
    };
    request
        .auth_expired_codes
        .iter()
        .any(|code| json_contains_code(&body, code))
}

/// Look for a vendor error code anywhere a code-like field could carry it.
fn json_contains_code(value: &Value, code: &str) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(key, v)| {
            (key.eq_ignore_ascii_case("code")
                || key.eq_ignore_ascii_case("error_code")
                || key.eq_ignore_ascii_case("errorcode"))
                && scalar_eq(v, code)
                || json_contains_code(v, code)
        }),
        Value::Array(items) => items.iter().any(|v| json_contains_code(v, code)),
        _ => false,
    }
}

fn scalar_eq(value: &Value, code: &str) -> bool {
    match value {
        Value::String(s) => s == code,
        Value::Number(n) => n.to_string() == code,
        _ => false,
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// Normalize a reqwest error onto the transport taxonomy.
fn normalize_error(error: reqwest::Error) -> SyncError {
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if is_tls_error(&error) {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Connection
    };
    let message = error.to_string();
    SyncError::transport_with_source(kind, message, error)
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        let text = err.to_string().to_lowercase();
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return true;
        }
        source = err.source();
    }
    false
}
