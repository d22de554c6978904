//! In-memory storage implementation

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use obligation_types::{Obligation, ObligationId};
use tokio::sync::{broadcast, RwLock};

use super::traits::{ObligationFilter, ObligationStore, ObligationStream};
use crate::error::{StoreError, StoreResult};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// In-memory store for development and testing.
///
/// Clones share the same records and change channel.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<ObligationId, Obligation>>>,
    changes: Option<broadcast::Sender<ObligationId>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a store that publishes change notifications.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            changes: Some(tx),
        }
    }

    /// Create a store with no change stream, so only reconciliation sees writes.
    pub fn without_notifications() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            changes: None,
        }
    }

    /// Create or overwrite a record without a version check, as the CRUD
    /// layer does on ingestion. Returns the record as stored.
    pub async fn insert(&self, obligation: Obligation) -> Obligation {
        let stored = self.insert_without_notify(obligation).await;
        self.notify(stored.id);
        stored
    }

    /// Like [`insert`](Self::insert) but never publishes a change notification.
    pub async fn insert_without_notify(&self, mut obligation: Obligation) -> Obligation {
        let mut records = self.records.write().await;
        let previous = records.get(&obligation.id).map(|o| o.version).unwrap_or(0);
        obligation.version = previous.max(obligation.version) + 1;
        records.insert(obligation.id, obligation.clone());
        obligation
    }

    /// Delete a record, as an owner-cascade deletion would.
    pub async fn remove(&self, id: &ObligationId) -> bool {
        let removed = self.records.write().await.remove(id).is_some();
        if removed {
            self.notify(*id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn notify(&self, id: ObligationId) {
        if let Some(tx) = &self.changes {
            // No subscribers is fine; the engine may not be running yet.
            let _ = tx.send(id);
        }
    }
}

#[async_trait]
impl ObligationStore for InMemoryStore {
    async fn get(&self, id: &ObligationId) -> StoreResult<Obligation> {
        let records = self.records.read().await;
        records.get(id).cloned().ok_or(StoreError::NotFound(*id))
    }

    async fn list(&self, filter: &ObligationFilter) -> StoreResult<ObligationStream> {
        let records = self.records.read().await;
        let mut matching: Vec<Obligation> = records
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        matching.sort_by_key(|o| (o.deadline, o.id));
        Ok(Box::pin(futures::stream::iter(matching.into_iter().map(Ok))))
    }

    async fn save(&self, mut obligation: Obligation) -> StoreResult<Obligation> {
        let id = obligation.id;
        {
            let mut records = self.records.write().await;
            let current = records.get(&id).ok_or(StoreError::NotFound(id))?;
            if current.version != obligation.version {
                return Err(StoreError::Conflict {
                    id,
                    expected: obligation.version,
                    found: current.version,
                });
            }
            obligation.version += 1;
            records.insert(id, obligation.clone());
        }
        self.notify(id);
        Ok(obligation)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ObligationId>> {
        self.changes.as_ref().map(|tx| tx.subscribe())
    }
}
