//! Entity bindings.
//!
//! A binding is the persisted association between a local entity and its
//! remote identifier, plus the sync bookkeeping: whether a push is due,
//! the last remote-reported state, and a version stamp bumped on every
//! locally-initiated sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use remsync_core::error::{SyncError, SyncResult};
use remsync_core::ids::{EntityId, IntegrationId, TenantId};
use remsync_core::types::RemoteState;

/// The 1:1 mapping between a local entity and its remote identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityBinding {
    /// Local entity handle.
    pub entity_id: EntityId,

    /// Tenant.
    pub tenant_id: TenantId,

    /// Integration this binding belongs to.
    pub integration: IntegrationId,

    /// Remote identifier. Once set it is never cleared except by an
    /// explicit unbind.
    pub remote_id: Option<String>,

    /// Whether the entity has been modified since the last successful push.
    pub sync_required: bool,

    /// Last remote-reported state.
    pub last_known_remote_state: Option<RemoteState>,

    /// Monotonic counter bumped on each locally-initiated sync.
    pub version_stamp: i64,

    /// When the binding was created.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl EntityBinding {
    /// Create a fresh, unsynced binding.
    #[must_use]
    pub fn new(tenant_id: TenantId, integration: IntegrationId, entity_id: EntityId) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            tenant_id,
            integration,
            remote_id: None,
            sync_required: true,
            last_known_remote_state: None,
            version_stamp: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the entity has a remote identifier.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Bind the entity to its remote identifier.
    ///
    /// The remote id is immutable once written; rebinding to the same value
    /// is a no-op, rebinding to a different one is an invariant violation.
    pub fn bind(&mut self, remote_id: impl Into<String>) -> SyncResult<()> {
        let remote_id = remote_id.into();
        match &self.remote_id {
            Some(existing) if *existing == remote_id => Ok(()),
            Some(existing) => Err(SyncError::internal(format!(
                "entity {} already bound to '{existing}', refusing rebind to '{remote_id}'",
                self.entity_id
            ))),
            None => {
                self.remote_id = Some(remote_id);
                self.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    /// Explicitly unbind the entity, clearing remote identity and state.
    pub fn unbind(&mut self) {
        self.remote_id = None;
        self.last_known_remote_state = None;
        self.sync_required = true;
        self.updated_at = Utc::now();
    }

    /// Record a successful push or a fresh remote-reported state.
    pub fn mark_synced(&mut self, state: Option<RemoteState>) {
        self.sync_required = false;
        if state.is_some() {
            self.last_known_remote_state = state;
        }
        self.updated_at = Utc::now();
    }

    /// Flag the entity as locally modified.
    pub fn require_sync(&mut self) {
        self.sync_required = true;
        self.updated_at = Utc::now();
    }

    /// Bump the version stamp for a locally-initiated sync.
    pub fn bump_version(&mut self) {
        self.version_stamp += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> EntityBinding {
        EntityBinding::new(
            TenantId::new(),
            IntegrationId::new("card-issuing").unwrap(),
            EntityId::new(),
        )
    }

    #[test]
    fn test_new_binding_is_unsynced() {
        let b = binding();
        assert!(!b.is_bound());
        assert!(b.sync_required);
        assert_eq!(b.version_stamp, 0);
        assert!(b.last_known_remote_state.is_none());
    }

    #[test]
    fn test_bind_is_write_once() {
        let mut b = binding();
        b.bind("ic_001").unwrap();
        assert_eq!(b.remote_id.as_deref(), Some("ic_001"));

        // Same id is a no-op.
        b.bind("ic_001").unwrap();

        // A different id is refused.
        assert!(b.bind("ic_002").is_err());
        assert_eq!(b.remote_id.as_deref(), Some("ic_001"));
    }

    #[test]
    fn test_unbind_clears_identity() {
        let mut b = binding();
        b.bind("ic_001").unwrap();
        b.mark_synced(Some(RemoteState::Accepted));

        b.unbind();
        assert!(!b.is_bound());
        assert!(b.sync_required);
        assert!(b.last_known_remote_state.is_none());

        // Rebinding after an explicit unbind is allowed.
        b.bind("ic_002").unwrap();
        assert_eq!(b.remote_id.as_deref(), Some("ic_002"));
    }

    #[test]
    fn test_mark_synced() {
        let mut b = binding();
        b.mark_synced(Some(RemoteState::Accepted));
        assert!(!b.sync_required);
        assert_eq!(b.last_known_remote_state, Some(RemoteState::Accepted));

        // A stateless success (async ack) keeps the previous state.
        b.mark_synced(None);
        assert_eq!(b.last_known_remote_state, Some(RemoteState::Accepted));
    }

    #[test]
    fn test_version_stamp_monotonic() {
        let mut b = binding();
        b.bump_version();
        b.bump_version();
        assert_eq!(b.version_stamp, 2);
    }
}
