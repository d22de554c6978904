//! Seed data for the in-memory store.
//!
//! A seed file is a JSON array of records in the shape the extraction
//! collaborator produces: owner, action, type, deadline and counterparty.
//! Identifiers and bookkeeping fields are assigned on load.

use chrono::{DateTime, Utc};
use obligation_engine::InMemoryStore;
use obligation_types::{Counterparty, Obligation, ObligationType, OwnerId};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{DaemonError, DaemonResult};

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRecord {
    pub owner_id: String,
    pub action: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type", alias = "obligation_type")]
    pub obligation_type: ObligationType,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub counterparty: Counterparty,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_message_id: Option<String>,
}

impl SeedRecord {
    fn into_obligation(self, now: DateTime<Utc>) -> Obligation {
        let mut obligation = Obligation::new(
            OwnerId::new(self.owner_id),
            self.action,
            self.obligation_type,
            self.deadline,
            now,
        )
        .with_counterparty(self.counterparty);
        if let Some(description) = self.description {
            obligation = obligation.with_description(description);
        }
        if let Some(source) = self.source {
            obligation = obligation.with_source(source, self.source_message_id);
        }
        obligation
    }
}

/// Parse a seed document into new pending obligations created at `now`.
pub fn parse(json: &str, now: DateTime<Utc>) -> DaemonResult<Vec<Obligation>> {
    let records: Vec<SeedRecord> = serde_json::from_str(json)?;
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            if record.owner_id.trim().is_empty() {
                return Err(DaemonError::SeedRecord {
                    index,
                    reason: "owner_id is empty".to_string(),
                });
            }
            if record.action.trim().is_empty() {
                return Err(DaemonError::SeedRecord {
                    index,
                    reason: "action is empty".to_string(),
                });
            }
            Ok(record.into_obligation(now))
        })
        .collect()
}

/// Read and parse the seed file at `path`.
pub async fn load(path: &str, now: DateTime<Utc>) -> DaemonResult<Vec<Obligation>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DaemonError::SeedIo {
            path: path.to_string(),
            source,
        })?;
    let obligations = parse(&json, now)?;
    info!(path, count = obligations.len(), "Loaded seed obligations");
    Ok(obligations)
}

/// Insert every obligation into the store, returning the stored copies.
pub async fn populate(store: &InMemoryStore, obligations: Vec<Obligation>) -> Vec<Obligation> {
    let mut stored = Vec::with_capacity(obligations.len());
    for obligation in obligations {
        let obligation = store.insert(obligation).await;
        debug!(obligation_id = %obligation.id, deadline = %obligation.deadline, "Seeded obligation");
        stored.push(obligation);
    }
    stored
}
