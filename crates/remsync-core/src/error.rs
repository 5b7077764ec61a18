//! Error types.
//!
//! The typed failure taxonomy with transient/permanent classification.
//! Transport-level failures are recoverable (the poller retries them);
//! payload and binding errors are surfaced to the collaborator; invariant
//! violations abort the operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{EntityId, IntegrationId};
use crate::types::{Mode, RemoteState};

/// One error line reported by a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Vendor error code (e.g. a SOAP faultcode or a numeric registry code).
    pub code: String,
    /// Human-readable message as reported by the remote.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error line.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Subkind of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connect or read deadline exceeded.
    Timeout,
    /// Connection refused, reset, or DNS failure.
    Connection,
    /// Remote answered with a 5xx status.
    HttpError,
    /// TLS handshake or certificate failure.
    Tls,
}

impl TransportErrorKind {
    /// Get the string representation used in document error records.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connection => "connection",
            TransportErrorKind::HttpError => "http-error",
            TransportErrorKind::Tls => "tls",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    // Configuration errors (surfaced to the operator, never retried)
    /// A required credential or endpoint is absent.
    #[error("missing configuration for {integration}/{mode}: {what}")]
    ConfigMissing {
        integration: IntegrationId,
        mode: Mode,
        what: String,
    },

    /// Integration is not present in the registry.
    #[error("unknown integration: {integration}")]
    UnknownIntegration { integration: IntegrationId },

    // Payload errors (surfaced to the collaborator; entity stays unsynced)
    /// Codec validation found required fields missing.
    #[error("payload incomplete, missing fields: {}", missing.join(", "))]
    PayloadIncomplete { missing: Vec<String> },

    // Transport errors (recorded as sending_failed; retried by the poller)
    /// HTTP-level failure with no remote effect assumed.
    #[error("transport failure ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Remote authentication expired and the single re-auth retry failed too.
    #[error("authentication expired for {integration} and re-authentication failed")]
    AuthExpired { integration: IntegrationId },

    // Binding errors
    /// More than one remote candidate matched; operator input required.
    #[error("ambiguous binding for entity {entity_id}: {candidates} remote candidates")]
    AmbiguousBinding {
        entity_id: EntityId,
        candidates: usize,
    },

    /// The remote create response carried no identifier.
    #[error("binding failed: {message}")]
    BindingFailed { message: String },

    /// Operation requires a bound entity.
    #[error("entity {entity_id} is not bound to a remote identifier")]
    NotBound { entity_id: EntityId },

    /// Cancellation attempted from a state that does not allow it.
    #[error("cancellation not allowed from remote state {state:?}")]
    CancelNotAllowed { state: Option<RemoteState> },

    // Registry invariant violations (programming errors, abort loudly)
    /// Attempted mutation of a finalized document.
    #[error("document {document_id} is finalized and cannot be modified")]
    DocumentFinalized { document_id: i64 },

    /// Attempted document status transition outside the lattice.
    #[error("invalid document status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Concurrent pusher claimed the same chain index.
    #[error("chain index {index} already taken in scope {scope}")]
    ChainConflict { scope: String, index: i64 },

    // Ingress errors
    /// Webhook failed authentication or carried no usable reference.
    #[error("webhook rejected: {reason}")]
    WebhookRejected { reason: String },

    // Ambient errors
    /// Database error.
    #[error("database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Check if this error is transient and the operation should be retried.
    ///
    /// Transient errors are recovered locally: the document is recorded as
    /// `sending_failed` and the poller redrives it with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport {
                kind: TransportErrorKind::Timeout
                    | TransportErrorKind::Connection
                    | TransportErrorKind::HttpError,
                ..
            }
        )
    }

    /// Check if this error is permanent and retry won't help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Get an error code for classification and document error records.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::ConfigMissing { .. } => "CONFIG_MISSING",
            SyncError::UnknownIntegration { .. } => "UNKNOWN_INTEGRATION",
            SyncError::PayloadIncomplete { .. } => "PAYLOAD_INCOMPLETE",
            SyncError::Transport { .. } => "TRANSPORT_FAILURE",
            SyncError::AuthExpired { .. } => "AUTH_EXPIRED",
            SyncError::AmbiguousBinding { .. } => "AMBIGUOUS_BINDING",
            SyncError::BindingFailed { .. } => "BINDING_FAILED",
            SyncError::NotBound { .. } => "NOT_BOUND",
            SyncError::CancelNotAllowed { .. } => "CANCEL_NOT_ALLOWED",
            SyncError::DocumentFinalized { .. } => "DOCUMENT_FINALIZED",
            SyncError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SyncError::ChainConflict { .. } => "CHAIN_CONFLICT",
            SyncError::WebhookRejected { .. } => "WEBHOOK_REJECTED",
            SyncError::Database { .. } => "DATABASE_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors

    /// Create a config-missing error.
    pub fn config_missing(
        integration: IntegrationId,
        mode: Mode,
        what: impl Into<String>,
    ) -> Self {
        SyncError::ConfigMissing {
            integration,
            mode,
            what: what.into(),
        }
    }

    /// Create a transport error without a source.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        SyncError::Transport {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with a source.
    pub fn transport_with_source(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Transport {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a binding-failed error.
    pub fn binding_failed(message: impl Into<String>) -> Self {
        SyncError::BindingFailed {
            message: message.into(),
        }
    }

    /// Create a webhook-rejected error.
    pub fn webhook_rejected(reason: impl Into<String>) -> Self {
        SyncError::WebhookRejected {
            reason: reason.into(),
        }
    }

    /// Create a database error without a source.
    pub fn database(message: impl Into<String>) -> Self {
        SyncError::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error with a source.
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        SyncError::Internal {
            message: message.into(),
        }
    }
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
