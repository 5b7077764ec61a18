//! Axum router for webhook endpoints.
//!
//! One POST path per integration. The acknowledgement is an empty 200 for
//! both fresh and duplicate deliveries; callers that retry on anything
//! else would otherwise loop forever.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tracing::warn;

use remsync_core::error::SyncError;
use remsync_core::ids::IntegrationId;

use crate::ingress::IngressDispatcher;

/// Shared state for webhook handlers.
#[derive(Clone)]
pub struct IngressState {
    dispatcher: Arc<IngressDispatcher>,
}

impl IngressState {
    /// Create a new ingress state.
    pub fn new(dispatcher: Arc<IngressDispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Creates the webhook router.
pub fn ingress_router(state: IngressState) -> Router {
    Router::new()
        .route("/hooks/:integration", post(receive_webhook))
        .with_state(state)
}

async fn receive_webhook(
    State(state): State<IngressState>,
    Path(integration): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Ok(integration) = IntegrationId::new(integration) else {
        return StatusCode::NOT_FOUND;
    };

    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

    match state.dispatcher.handle(&integration, &headers, &body).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(integration = %integration, error = %e, "webhook delivery rejected");
            status_for(&e)
        }
    }
}

fn status_for(error: &SyncError) -> StatusCode {
    match error {
        SyncError::UnknownIntegration { .. } => StatusCode::NOT_FOUND,
        SyncError::WebhookRejected { reason } if reason.starts_with("authentication") => {
            StatusCode::UNAUTHORIZED
        }
        SyncError::WebhookRejected { .. } => StatusCode::BAD_REQUEST,
        SyncError::ConfigMissing { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
