//! Idempotency ledger for side-effect dispatch.
//!
//! One entry per (obligation, kind, epoch). A claim moves the entry to
//! `InFlight`; a confirmed external call moves it to `Completed` and a
//! permanent failure to `Held`. Both are final. Only in-flight entries can
//! be released or taken over after expiry.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use obligation_types::{Epoch, Intent, IntentKind, ObligationId};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Key under which a side effect may fire at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub obligation_id: ObligationId,
    pub kind: IntentKind,
    pub epoch: Epoch,
}

impl IdempotencyKey {
    pub fn new(obligation_id: ObligationId, kind: IntentKind, epoch: Epoch) -> Self {
        Self {
            obligation_id,
            kind,
            epoch,
        }
    }

    pub fn for_intent(intent: &Intent) -> Self {
        Self::new(intent.obligation_id(), intent.kind, intent.epoch())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.obligation_id, self.kind, self.epoch)
    }
}

/// Result of trying to claim a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the key and may call out.
    Acquired,
    /// Another worker holds an unexpired claim.
    InFlight,
    /// The side effect already happened. `payload` is what it produced.
    Completed { payload: Option<String> },
    /// The external call failed permanently and must not be retried.
    Held { reason: String },
}

/// Ledger of dispatched side effects.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Atomically claim `key` until `now + ttl`.
    async fn claim(&self, key: &IdempotencyKey, now: DateTime<Utc>, ttl: Duration) -> StoreResult<Claim>;

    /// Mark `key` as done, remembering the produced payload.
    async fn complete(&self, key: &IdempotencyKey, payload: Option<String>, now: DateTime<Utc>) -> StoreResult<()>;

    /// Mark `key` as permanently failed. Later claims see `Held`.
    async fn hold(&self, key: &IdempotencyKey, reason: &str, now: DateTime<Utc>) -> StoreResult<()>;

    /// Drop an in-flight claim so a later sweep may retry. Final entries are kept.
    async fn release(&self, key: &IdempotencyKey) -> StoreResult<()>;

    /// Forget completed per-day entries finished before `cutoff`. Returns how
    /// many were dropped. Ledgers that expire entries on their own keep the default.
    async fn prune_completed_before(&self, _cutoff: DateTime<Utc>) -> StoreResult<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LedgerEntry {
    InFlight { expires_at: DateTime<Utc> },
    Completed { payload: Option<String>, completed_at: DateTime<Utc> },
    Held { reason: String, held_at: DateTime<Utc> },
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: DashMap<IdempotencyKey, LedgerEntry>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_completed(&self, key: &IdempotencyKey) -> bool {
        matches!(
            self.entries.get(key).as_deref(),
            Some(LedgerEntry::Completed { .. })
        )
    }

    pub fn is_held(&self, key: &IdempotencyKey) -> bool {
        matches!(self.entries.get(key).as_deref(), Some(LedgerEntry::Held { .. }))
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn claim(&self, key: &IdempotencyKey, now: DateTime<Utc>, ttl: Duration) -> StoreResult<Claim> {
        let claim = match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(LedgerEntry::InFlight { expires_at: now + ttl });
                Claim::Acquired
            }
            Entry::Occupied(mut occupied) => {
                let claim = match occupied.get() {
                    LedgerEntry::InFlight { expires_at } if *expires_at <= now => Claim::Acquired,
                    LedgerEntry::InFlight { .. } => Claim::InFlight,
                    LedgerEntry::Completed { payload, .. } => Claim::Completed {
                        payload: payload.clone(),
                    },
                    LedgerEntry::Held { reason, .. } => Claim::Held { reason: reason.clone() },
                };
                if claim == Claim::Acquired {
                    // Previous holder's claim expired; take it over.
                    occupied.insert(LedgerEntry::InFlight { expires_at: now + ttl });
                }
                claim
            }
        };
        Ok(claim)
    }

    async fn complete(&self, key: &IdempotencyKey, payload: Option<String>, now: DateTime<Utc>) -> StoreResult<()> {
        self.entries.insert(
            key.clone(),
            LedgerEntry::Completed {
                payload,
                completed_at: now,
            },
        );
        Ok(())
    }

    async fn hold(&self, key: &IdempotencyKey, reason: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.entries.insert(
            key.clone(),
            LedgerEntry::Held {
                reason: reason.to_string(),
                held_at: now,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &IdempotencyKey) -> StoreResult<()> {
        self.entries
            .remove_if(key, |_, entry| matches!(entry, LedgerEntry::InFlight { .. }));
        Ok(())
    }

    /// Single-shot and held entries are never pruned.
    async fn prune_completed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, entry| match (key.epoch, entry) {
            (Epoch::Day(_), LedgerEntry::Completed { completed_at, .. }) => *completed_at >= cutoff,
            _ => true,
        });
        Ok(before - self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn key(kind: IntentKind) -> IdempotencyKey {
        IdempotencyKey::new(ObligationId::generate(), kind, kind.epoch_at(now()))
    }

    #[tokio::test]
    async fn test_second_claim_sees_in_flight() {
        let ledger = InMemoryLedger::new();
        let key = key(IntentKind::Escalate);
        let ttl = Duration::minutes(5);

        assert_eq!(ledger.claim(&key, now(), ttl).await.unwrap(), Claim::Acquired);
        assert_eq!(ledger.claim(&key, now(), ttl).await.unwrap(), Claim::InFlight);
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let ledger = InMemoryLedger::new();
        let key = key(IntentKind::SendReminder);
        let ttl = Duration::minutes(5);

        ledger.claim(&key, now(), ttl).await.unwrap();
        let later = now() + Duration::minutes(6);
        assert_eq!(ledger.claim(&key, later, ttl).await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn test_completed_entry_survives_release() {
        let ledger = InMemoryLedger::new();
        let key = key(IntentKind::AttemptAutoDraft);

        ledger.claim(&key, now(), Duration::minutes(5)).await.unwrap();
        ledger.complete(&key, Some("Hello".into()), now()).await.unwrap();
        ledger.release(&key).await.unwrap();

        assert_eq!(
            ledger.claim(&key, now() + Duration::days(400), Duration::minutes(5)).await.unwrap(),
            Claim::Completed {
                payload: Some("Hello".into())
            }
        );
    }

    #[tokio::test]
    async fn test_release_frees_in_flight_claim() {
        let ledger = InMemoryLedger::new();
        let key = key(IntentKind::Escalate);
        ledger.claim(&key, now(), Duration::minutes(5)).await.unwrap();
        ledger.release(&key).await.unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.claim(&key, now(), Duration::minutes(5)).await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn test_reminder_epochs_are_separate_days() {
        let ledger = InMemoryLedger::new();
        let id = ObligationId::generate();
        let today = IdempotencyKey::new(id, IntentKind::SendReminder, IntentKind::SendReminder.epoch_at(now()));
        let tomorrow_at = now() + Duration::days(1);
        let tomorrow = IdempotencyKey::new(
            id,
            IntentKind::SendReminder,
            IntentKind::SendReminder.epoch_at(tomorrow_at),
        );

        ledger.claim(&today, now(), Duration::minutes(5)).await.unwrap();
        ledger.complete(&today, None, now()).await.unwrap();
        assert_eq!(
            ledger.claim(&tomorrow, tomorrow_at, Duration::minutes(5)).await.unwrap(),
            Claim::Acquired
        );

        ledger.complete(&tomorrow, None, tomorrow_at).await.unwrap();
        assert_eq!(ledger.prune_completed_before(tomorrow_at).await.unwrap(), 1);
        assert!(ledger.is_completed(&tomorrow));
    }

    #[tokio::test]
    async fn test_held_entry_is_final() {
        let ledger = InMemoryLedger::new();
        let key = key(IntentKind::Escalate);

        ledger.claim(&key, now(), Duration::minutes(5)).await.unwrap();
        ledger.hold(&key, "recipient rejected", now()).await.unwrap();
        ledger.release(&key).await.unwrap();
        assert!(ledger.is_held(&key));

        assert_eq!(
            ledger.claim(&key, now() + Duration::days(1), Duration::minutes(5)).await.unwrap(),
            Claim::Held {
                reason: "recipient rejected".into()
            }
        );
        assert_eq!(ledger.prune_completed_before(now() + Duration::days(30)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let ledger = std::sync::Arc::new(InMemoryLedger::new());
        let key = key(IntentKind::Escalate);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                ledger.claim(&key, now(), Duration::minutes(5)).await.unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap() == Claim::Acquired {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }
}
