//! Storage trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use obligation_types::{Obligation, ObligationId, ObligationStatus, OwnerId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StoreResult;

/// Lazy sequence of obligations produced by [`ObligationStore::list`].
pub type ObligationStream = BoxStream<'static, StoreResult<Obligation>>;

/// Durable keyed storage of obligation records.
#[async_trait]
pub trait ObligationStore: Send + Sync {
    /// Get an obligation by ID
    async fn get(&self, id: &ObligationId) -> StoreResult<Obligation>;

    /// Stream every obligation matching `filter`
    async fn list(&self, filter: &ObligationFilter) -> StoreResult<ObligationStream>;

    /// Save an obligation.
    ///
    /// The stored version must equal `obligation.version`, otherwise the
    /// call fails with `Conflict`. Returns the record as stored, with its
    /// version bumped.
    async fn save(&self, obligation: Obligation) -> StoreResult<Obligation>;

    /// Subscribe to change notifications.
    ///
    /// Best-effort: `None` means the backend cannot notify and the engine
    /// relies on reconciliation scans alone.
    fn subscribe(&self) -> Option<broadcast::Receiver<ObligationId>> {
        None
    }
}

/// Selection criteria for [`ObligationStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationFilter {
    #[serde(default)]
    pub statuses: Vec<ObligationStatus>,
    #[serde(default)]
    pub owner: Option<OwnerId>,
    #[serde(default)]
    pub deadline_before: Option<DateTime<Utc>>,
}

impl ObligationFilter {
    /// Every obligation that can still change state.
    pub fn non_terminal() -> Self {
        Self {
            statuses: vec![
                ObligationStatus::Pending,
                ObligationStatus::InProgress,
                ObligationStatus::Overdue,
            ],
            ..Default::default()
        }
    }

    pub fn for_owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn deadline_before(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_before = Some(at);
        self
    }

    pub fn matches(&self, obligation: &Obligation) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&obligation.status) {
            return false;
        }
        if let Some(owner) = &self.owner {
            if &obligation.owner_id != owner {
                return false;
            }
        }
        if let Some(before) = self.deadline_before {
            if obligation.deadline >= before {
                return false;
            }
        }
        true
    }
}
