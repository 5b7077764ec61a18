//! Identity binder.
//!
//! Establishes the remote identifier of an entity that has none stored:
//! issue a metadata-filtered search against the remote, and interpret the
//! candidates per the integration's search spec. On a unique match, bind.
//! On multiple matches, prefer the candidate carrying the locally-embedded
//! entity marker, then the candidate in active status; anything still
//! ambiguous needs operator input.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use remsync_core::capability::{RegisteredIntegration, SearchSpec};
use remsync_core::error::{SyncError, SyncResult};
use remsync_core::ids::EntityId;
use remsync_core::snapshot::Snapshot;
use remsync_core::types::SyncOperation;
use remsync_transport::{EndpointResolver, Transport};

/// Performs remote lookups for unbound entities.
pub struct IdentityBinder {
    resolver: Arc<EndpointResolver>,
    transport: Arc<dyn Transport>,
}

/// One remote candidate under consideration.
#[derive(Debug)]
struct Candidate {
    remote_id: String,
    marker: Option<String>,
    status: Option<String>,
}

impl IdentityBinder {
    /// Create a binder.
    pub fn new(resolver: Arc<EndpointResolver>, transport: Arc<dyn Transport>) -> Self {
        Self {
            resolver,
            transport,
        }
    }

    /// Search the remote for an existing counterpart of the entity.
    ///
    /// Returns the remote id to bind, or `None` when the entity does not
    /// exist remotely yet (the caller proceeds with a create).
    #[instrument(skip(self, registered, snapshot), fields(integration = %registered.capability.id, entity_id = %entity_id))]
    pub async fn lookup(
        &self,
        registered: &RegisteredIntegration,
        snapshot: &Snapshot,
        entity_id: EntityId,
    ) -> SyncResult<Option<String>> {
        let capability = &registered.capability;
        let Some(search) = &capability.search else {
            return Ok(None);
        };

        let filters = capability.codec.search_filters(snapshot);
        if filters.is_empty() {
            return Ok(None);
        }

        let query: Vec<(String, String)> = filters
            .into_iter()
            .map(|f| (f.field, f.value))
            .collect();
        let request = self
            .resolver
            .build_request(registered, SyncOperation::Query, None, query, None)
            .await?;
        let response = self.transport.execute(&request).await?;

        let Some(body) = response.as_json() else {
            return Ok(None);
        };
        let candidates = collect_candidates(search, &body);
        debug!(count = candidates.len(), "remote search returned candidates");

        match candidates.len() {
            0 => Ok(None),
            1 => Ok(Some(candidates.into_iter().next().expect("len checked").remote_id)),
            _ => disambiguate(search, candidates, entity_id),
        }
    }
}

fn collect_candidates(search: &SearchSpec, body: &Value) -> Vec<Candidate> {
    let Some(Value::Array(items)) = body.pointer(&search.results_pointer) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let remote_id = match item.pointer(&search.id_pointer)? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let marker = search
                .marker_pointer
                .as_deref()
                .and_then(|p| item.pointer(p))
                .and_then(Value::as_str)
                .map(str::to_string);
            let status = search
                .status_pointer
                .as_deref()
                .and_then(|p| item.pointer(p))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(Candidate {
                remote_id,
                marker,
                status,
            })
        })
        .collect()
}

fn disambiguate(
    search: &SearchSpec,
    candidates: Vec<Candidate>,
    entity_id: EntityId,
) -> SyncResult<Option<String>> {
    let total = candidates.len();
    let marker = entity_id.to_string();

    let marked: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.marker.as_deref() == Some(marker.as_str()))
        .collect();
    if marked.len() == 1 {
        return Ok(Some(marked[0].remote_id.clone()));
    }

    let active: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| {
            c.status
                .as_deref()
                .is_some_and(|s| search.active_values.iter().any(|v| v == s))
        })
        .collect();
    if active.len() == 1 {
        return Ok(Some(active[0].remote_id.clone()));
    }

    Err(SyncError::AmbiguousBinding {
        entity_id,
        candidates: total,
    })
}
