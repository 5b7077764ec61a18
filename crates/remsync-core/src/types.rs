//! Shared type definitions.
//!
//! Modes, operations, the document status lattice, remote states, and the
//! wire-level response envelope shared by transport, codec and classifier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Operating mode of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Production endpoints, real submissions.
    Live,
    /// Remote sandbox endpoints (default state).
    #[default]
    Test,
    /// No remote at all; transport is short-circuited with canned responses.
    Demo,
}

impl Mode {
    /// Get the string representation used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "live",
            Mode::Test => "test",
            Mode::Demo => "demo",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(Mode::Live),
            "test" => Ok(Mode::Test),
            "demo" => Ok(Mode::Demo),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Error parsing mode from string.
#[derive(Debug, Clone)]
pub struct ParseModeError(String);

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid mode '{}', expected one of: live, test, demo", self.0)
    }
}

impl std::error::Error for ParseModeError {}

/// Kind of outbound submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    /// First registration of an entity with the remote service.
    Register,
    /// Update of an already-bound entity.
    Update,
    /// Cancellation of a previously accepted registration.
    Cancel,
    /// Status query for a pending or sent submission.
    Query,
}

impl SyncOperation {
    /// Get the string representation used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Register => "register",
            SyncOperation::Update => "update",
            SyncOperation::Cancel => "cancel",
            SyncOperation::Query => "query",
        }
    }

    /// Whether this operation mutates remote state.
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        !matches!(self, SyncOperation::Query)
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = ParseSyncOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "register" => Ok(SyncOperation::Register),
            "update" => Ok(SyncOperation::Update),
            "cancel" => Ok(SyncOperation::Cancel),
            "query" => Ok(SyncOperation::Query),
            _ => Err(ParseSyncOperationError(s.to_string())),
        }
    }
}

/// Error parsing sync operation from string.
#[derive(Debug, Clone)]
pub struct ParseSyncOperationError(String);

impl fmt::Display for ParseSyncOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid sync operation '{}', expected one of: register, update, cancel, query",
            self.0
        )
    }
}

impl std::error::Error for ParseSyncOperationError {}

/// Status of a sync document.
///
/// Transitions are monotone: `pending -> sent -> {rejected, sending_failed,
/// registered_with_errors, accepted}` plus `accepted -> cancelled`, and the
/// short-circuit `pending -> sending_failed` when transport never engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Persisted but not yet handed to transport.
    #[default]
    Pending,
    /// Submitted; remote processing is asynchronous.
    Sent,
    /// Remote accepted every line.
    Accepted,
    /// Remote registered the submission but flagged line errors.
    RegisteredWithErrors,
    /// Remote rejected the submission.
    Rejected,
    /// A previously accepted registration was cancelled.
    Cancelled,
    /// Transport-level failure; no remote effect is assumed.
    SendingFailed,
}

impl DocumentStatus {
    /// Get the string representation used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Sent => "sent",
            DocumentStatus::Accepted => "accepted",
            DocumentStatus::RegisteredWithErrors => "registered_with_errors",
            DocumentStatus::Rejected => "rejected",
            DocumentStatus::Cancelled => "cancelled",
            DocumentStatus::SendingFailed => "sending_failed",
        }
    }

    /// Check whether the lattice permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::{
            Accepted, Cancelled, Pending, RegisteredWithErrors, Rejected, SendingFailed, Sent,
        };
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, SendingFailed)
                | (Pending, Rejected)
                | (Pending, RegisteredWithErrors)
                | (Pending, Accepted)
                | (Sent, Rejected)
                | (Sent, SendingFailed)
                | (Sent, RegisteredWithErrors)
                | (Sent, Accepted)
                | (Accepted, Cancelled)
        )
    }

    /// Check if the document is in a terminal state.
    ///
    /// `Accepted` still admits the single `-> Cancelled` edge but is terminal
    /// for submission purposes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Accepted
                | DocumentStatus::Rejected
                | DocumentStatus::Cancelled
                | DocumentStatus::SendingFailed
        )
    }

    /// Check if the remote outcome is still unresolved and worth polling.
    #[must_use]
    pub fn is_pollable(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Pending | DocumentStatus::Sent | DocumentStatus::RegisteredWithErrors
        )
    }

    /// Check if the remote acknowledged the submission (binding-relevant).
    #[must_use]
    pub fn is_remote_success(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Accepted | DocumentStatus::RegisteredWithErrors
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = ParseDocumentStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DocumentStatus::Pending),
            "sent" => Ok(DocumentStatus::Sent),
            "accepted" => Ok(DocumentStatus::Accepted),
            "registered_with_errors" => Ok(DocumentStatus::RegisteredWithErrors),
            "rejected" => Ok(DocumentStatus::Rejected),
            "cancelled" => Ok(DocumentStatus::Cancelled),
            "sending_failed" => Ok(DocumentStatus::SendingFailed),
            _ => Err(ParseDocumentStatusError(s.to_string())),
        }
    }
}

/// Error parsing document status from string.
#[derive(Debug, Clone)]
pub struct ParseDocumentStatusError(String);

impl fmt::Display for ParseDocumentStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid document status '{}', expected one of: pending, sent, accepted, registered_with_errors, rejected, cancelled, sending_failed",
            self.0
        )
    }
}

impl std::error::Error for ParseDocumentStatusError {}

/// Remote-reported state of an entity, normalized across integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    /// Fully accepted by the remote service.
    Accepted,
    /// Registered, but the remote flagged line-level errors.
    RegisteredWithErrors,
    /// Rejected by the remote service.
    Rejected,
    /// A previously accepted registration was cancelled.
    Cancelled,
}

impl RemoteState {
    /// Get the string representation used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteState::Accepted => "accepted",
            RemoteState::RegisteredWithErrors => "registered_with_errors",
            RemoteState::Rejected => "rejected",
            RemoteState::Cancelled => "cancelled",
        }
    }

    /// Whether cancellation is allowed from this state.
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, RemoteState::Accepted | RemoteState::RegisteredWithErrors)
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RemoteState {
    type Err = ParseRemoteStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accepted" => Ok(RemoteState::Accepted),
            "registered_with_errors" => Ok(RemoteState::RegisteredWithErrors),
            "rejected" => Ok(RemoteState::Rejected),
            "cancelled" => Ok(RemoteState::Cancelled),
            _ => Err(ParseRemoteStateError(s.to_string())),
        }
    }
}

/// Error parsing remote state from string.
#[derive(Debug, Clone)]
pub struct ParseRemoteStateError(String);

impl fmt::Display for ParseRemoteStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid remote state '{}', expected one of: accepted, registered_with_errors, rejected, cancelled",
            self.0
        )
    }
}

impl std::error::Error for ParseRemoteStateError {}

/// HTTP method for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Get the method name as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed MIME hint of a remote response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MimeHint {
    Xml,
    Json,
    Html,
    Binary,
    Unknown,
}

impl MimeHint {
    /// Derive a hint from a Content-Type header value.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("json") {
            MimeHint::Json
        } else if ct.contains("xml") {
            MimeHint::Xml
        } else if ct.contains("html") {
            MimeHint::Html
        } else if ct.contains("octet-stream") || ct.contains("pdf") || ct.contains("zip") {
            MimeHint::Binary
        } else {
            MimeHint::Unknown
        }
    }

    /// Sniff a hint from the first bytes of a body, for peers that lie about
    /// or omit the Content-Type header.
    #[must_use]
    pub fn sniff(body: &[u8]) -> Self {
        let Some(text) = std::str::from_utf8(body).ok() else {
            return MimeHint::Binary;
        };
        let trimmed = text.trim_start();
        let starts_with_ci = |prefix: &str| {
            trimmed
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        };
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            MimeHint::Json
        } else if starts_with_ci("<!doctype html") || starts_with_ci("<html") {
            MimeHint::Html
        } else if trimmed.starts_with('<') {
            MimeHint::Xml
        } else {
            MimeHint::Unknown
        }
    }
}

impl fmt::Display for MimeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MimeHint::Xml => "xml",
            MimeHint::Json => "json",
            MimeHint::Html => "html",
            MimeHint::Binary => "binary",
            MimeHint::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// One HTTP(S) round-trip result as seen by codec and classifier.
#[derive(Debug, Clone)]
pub struct WireResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lowercased names.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// Parsed MIME hint.
    pub mime: MimeHint,
}

impl WireResponse {
    /// Build a response, deriving the MIME hint from headers or body.
    #[must_use]
    pub fn new(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        let mime = headers
            .get("content-type")
            .map(|ct| MimeHint::from_content_type(ct))
            .filter(|m| *m != MimeHint::Unknown)
            .unwrap_or_else(|| MimeHint::sniff(&body));
        Self {
            status,
            headers,
            body,
            mime,
        }
    }

    /// Convenience constructor for a JSON response.
    #[must_use]
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            status,
            headers,
            body: value.to_string().into_bytes(),
            mime: MimeHint::Json,
        }
    }

    /// Body as UTF-8 text, if it is text.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Body parsed as JSON, if it parses.
    #[must_use]
    pub fn as_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}
