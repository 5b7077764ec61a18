//! Demo transport.
//!
//! Short-circuits the HTTP layer with canned responses so the rest of the
//! pipeline (codec, classifier, binder, orchestrator, registry) runs
//! deterministically. Used for demo-mode integrations and in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use remsync_core::error::{SyncError, SyncResult, TransportErrorKind};
use remsync_core::ids::IntegrationId;
use remsync_core::types::{SyncOperation, WireResponse};

use crate::request::{Transport, TransportRequest};

/// Canned outcome for one stubbed call.
enum Stubbed {
    Response(WireResponse),
    Failure(TransportErrorKind, String),
}

impl Stubbed {
    fn produce(&self) -> SyncResult<WireResponse> {
        match self {
            Stubbed::Response(response) => Ok(response.clone()),
            Stubbed::Failure(kind, message) => Err(SyncError::transport(*kind, message.clone())),
        }
    }
}

/// Transport with a canned response table.
///
/// Responses are keyed by (integration, operation) and consumed in order;
/// the last stubbed entry repeats so steady-state flows (polling) keep
/// working. Every executed request is recorded for inspection.
#[derive(Default)]
pub struct DemoTransport {
    responses: Mutex<HashMap<(IntegrationId, SyncOperation), VecDeque<Stubbed>>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl DemoTransport {
    /// Create an empty demo transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stub the next response for an operation.
    pub fn stub(&self, integration: &IntegrationId, operation: SyncOperation, response: WireResponse) {
        self.responses
            .lock()
            .expect("demo transport lock poisoned")
            .entry((integration.clone(), operation))
            .or_default()
            .push_back(Stubbed::Response(response));
    }

    /// Stub a transport-level failure for an operation.
    pub fn stub_failure(
        &self,
        integration: &IntegrationId,
        operation: SyncOperation,
        kind: TransportErrorKind,
        message: impl Into<String>,
    ) {
        self.responses
            .lock()
            .expect("demo transport lock poisoned")
            .entry((integration.clone(), operation))
            .or_default()
            .push_back(Stubbed::Failure(kind, message.into()));
    }

    /// Requests executed so far.
    #[must_use]
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .expect("demo transport lock poisoned")
            .clone()
    }

    /// Number of requests executed so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .expect("demo transport lock poisoned")
            .len()
    }
}

#[async_trait::async_trait]
impl Transport for DemoTransport {
    async fn execute(&self, request: &TransportRequest) -> SyncResult<WireResponse> {
        self.requests
            .lock()
            .expect("demo transport lock poisoned")
            .push(request.clone());

        let mut responses = self.responses.lock().expect("demo transport lock poisoned");
        let queue = responses
            .get_mut(&(request.integration.clone(), request.operation))
            .filter(|q| !q.is_empty())
            .ok_or_else(|| {
                SyncError::transport(
                    TransportErrorKind::Connection,
                    format!(
                        "no canned response for {}/{}",
                        request.integration, request.operation
                    ),
                )
            })?;

        if queue.len() > 1 {
            queue.pop_front().expect("non-empty queue").produce()
        } else {
            queue.front().expect("non-empty queue").produce()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn integration() -> IntegrationId {
        IntegrationId::new("card-issuing").unwrap()
    }

    #[tokio::test]
    async fn test_stubbed_sequence_then_repeat() {
        let transport = DemoTransport::new();
        let id = integration();
        transport.stub(&id, SyncOperation::Query, WireResponse::json(200, &json!({"n": 1})));
        transport.stub(&id, SyncOperation::Query, WireResponse::json(200, &json!({"n": 2})));

        let request = TransportRequest::demo(id, SyncOperation::Query);
        let first = transport.execute(&request).await.unwrap();
        let second = transport.execute(&request).await.unwrap();
        let third = transport.execute(&request).await.unwrap();

        assert_eq!(first.as_json().unwrap()["n"], 1);
        assert_eq!(second.as_json().unwrap()["n"], 2);
        // Last entry repeats.
        assert_eq!(third.as_json().unwrap()["n"], 2);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_unstubbed_operation_fails() {
        let transport = DemoTransport::new();
        let request = TransportRequest::demo(integration(), SyncOperation::Register);
        match transport.execute(&request).await {
            Err(SyncError::Transport { kind, .. }) => {
                assert_eq!(kind, TransportErrorKind::Connection);
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stubbed_failure() {
        let transport = DemoTransport::new();
        let id = integration();
        transport.stub_failure(&id, SyncOperation::Register, TransportErrorKind::Timeout, "slow");

        let request = TransportRequest::demo(id, SyncOperation::Register);
        let err = transport.execute(&request).await.unwrap_err();
        assert!(err.is_transient());
    }
}
