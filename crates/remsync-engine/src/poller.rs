//! Status poller.
//!
//! Periodically scans entities whose latest document is in a non-terminal
//! remote state and issues status queries; redrives sending-failed
//! submissions with exponential backoff. A crash between a pending
//! document and its response is recovered here: the pending row ages past
//! the threshold and gets queried.
//!
//! Cancellation is per integration: an in-flight sweep completes, no new
//! queries start.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use remsync_core::capability::IntegrationRegistry;
use remsync_core::ids::IntegrationId;
use remsync_core::types::DocumentStatus;

use crate::document::SyncDocument;
use crate::orchestrator::Orchestrator;
use crate::store::{BindingStore, DocumentStore};

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often the scan loop wakes up.
    pub tick_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Background poller driving unresolved submissions to a terminal state.
pub struct Poller {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<IntegrationRegistry>,
    bindings: Arc<dyn BindingStore>,
    documents: Arc<dyn DocumentStore>,
    config: PollerConfig,
    shutdown: Arc<AtomicBool>,
    cancelled: StdMutex<HashSet<IntegrationId>>,
}

impl Poller {
    /// Create a poller.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        registry: Arc<IntegrationRegistry>,
        bindings: Arc<dyn BindingStore>,
        documents: Arc<dyn DocumentStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            bindings,
            documents,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            cancelled: StdMutex::new(HashSet::new()),
        }
    }

    /// Run the scan loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "starting sync poller"
        );
        let mut tick = interval(self.config.tick_interval);
        loop {
            tick.tick().await;
            if self.shutdown.load(Ordering::Relaxed) {
                info!("poller shutdown requested, stopping scan loop");
                break;
            }
            self.sweep().await;
        }
    }

    /// Request graceful shutdown; the in-flight sweep completes.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Stop polling one integration; in-flight queries complete.
    pub fn cancel_integration(&self, integration: &IntegrationId) {
        self.cancelled
            .lock()
            .expect("poller cancel set poisoned")
            .insert(integration.clone());
    }

    /// Resume polling a previously cancelled integration.
    pub fn resume_integration(&self, integration: &IntegrationId) {
        self.cancelled
            .lock()
            .expect("poller cancel set poisoned")
            .remove(integration);
    }

    fn is_cancelled(&self, integration: &IntegrationId) -> bool {
        self.cancelled
            .lock()
            .expect("poller cancel set poisoned")
            .contains(integration)
    }

    /// One full scan over every registered integration.
    pub async fn sweep(&self) {
        for registered in self.registry.iter() {
            let integration = registered.capability.id.clone();
            if self.is_cancelled(&integration) {
                continue;
            }
            if let Err(e) = self.sweep_integration(&integration).await {
                error!(integration = %integration, error = %e, "poll sweep failed");
            }
        }
    }

    #[instrument(skip(self))]
    async fn sweep_integration(&self, integration: &IntegrationId) -> remsync_core::error::SyncResult<()> {
        let registered = self.registry.get(integration)?;
        let chained = registered.capability.chain_kind.is_some();
        let latest = self.documents.latest_per_entity(integration).await?;

        for doc in latest {
            if self.is_cancelled(integration) {
                break;
            }
            match doc.status {
                DocumentStatus::Pending | DocumentStatus::Sent | DocumentStatus::RegisteredWithErrors => {
                    let threshold = Duration::from_secs(registered.config.poll_interval_secs);
                    if !is_due(&doc, threshold) {
                        continue;
                    }
                    self.issue_query(&doc).await;
                }
                DocumentStatus::SendingFailed => {
                    let failures = self.trailing_failures(&doc).await?;
                    let threshold = registered.config.retry_backoff(failures.saturating_sub(1));
                    if !is_due(&doc, threshold) {
                        continue;
                    }
                    self.redrive(&doc, chained).await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn issue_query(&self, doc: &SyncDocument) {
        match self
            .orchestrator
            .query(doc.tenant_id, &doc.integration, doc.entity_id)
            .await
        {
            Ok(result) => debug!(
                entity_id = %doc.entity_id,
                status = %result.status,
                "status query completed"
            ),
            Err(e) => warn!(entity_id = %doc.entity_id, error = %e, "status query failed"),
        }
    }

    /// Drive a sending-failed submission forward.
    ///
    /// A bound entity gets a disambiguating query first (the failed call may
    /// have reached the remote). An unbound, unchained one replays its
    /// payload; a chained one waits for the collaborator to resubmit.
    async fn redrive(&self, doc: &SyncDocument, chained: bool) {
        let bound = match self
            .bindings
            .get(doc.tenant_id, &doc.integration, doc.entity_id)
            .await
        {
            Ok(binding) => binding.is_some_and(|b| b.is_bound()),
            Err(e) => {
                warn!(entity_id = %doc.entity_id, error = %e, "binding lookup failed");
                return;
            }
        };

        if bound {
            self.issue_query(doc).await;
        } else if chained {
            debug!(
                entity_id = %doc.entity_id,
                "chained submission awaiting collaborator resubmit"
            );
        } else {
            match self.orchestrator.resubmit(doc).await {
                Ok(result) => debug!(
                    entity_id = %doc.entity_id,
                    status = %result.status,
                    "resubmission completed"
                ),
                Err(e) => warn!(entity_id = %doc.entity_id, error = %e, "resubmission failed"),
            }
        }
    }

    /// Count the trailing run of sending-failed documents for an entity.
    async fn trailing_failures(&self, doc: &SyncDocument) -> remsync_core::error::SyncResult<u32> {
        let history = self
            .documents
            .history(doc.tenant_id, &doc.integration, doc.entity_id)
            .await?;
        Ok(history
            .iter()
            .rev()
            .take_while(|d| d.status == DocumentStatus::SendingFailed)
            .count() as u32)
    }
}

/// Whether a document's last transition is older than the threshold.
fn is_due(doc: &SyncDocument, threshold: Duration) -> bool {
    let last_transition = doc.response_at.unwrap_or(doc.created_at);
    let age = Utc::now().signed_duration_since(last_transition);
    age.to_std().map_or(false, |age| age >= threshold)
}
