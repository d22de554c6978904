//! Idempotent execution of side-effect intents.
//!
//! For every intent the dispatcher:
//! 1. re-reads the record and skips intents that no longer apply,
//! 2. claims the (obligation, kind, epoch) key in the ledger,
//! 3. calls the notifier or drafter under a deadline,
//! 4. on success, completes the ledger entry and persists the flag,
//! 5. on a transient failure, releases the claim,
//! 6. on a permanent failure, holds the key and parks the kind for review.
//!
//! A flag is only ever set after a confirmed external call. A claim is only
//! ever released by the dispatcher that acquired it.

mod idempotency;

pub use idempotency::{Claim, IdempotencyKey, IdempotencyLedger, InMemoryLedger};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use obligation_types::{Intent, IntentKind, Obligation, ObligationId};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::call::CallPolicy;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ExternalResult, StoreError};
use crate::external::{Drafter, Notification, Notifier, Recipient};
use crate::store::ObligationStore;

/// What happened to a dispatched intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The external call succeeded and the flag was persisted.
    Delivered,
    /// Another attempt owns or already finished this key.
    AlreadyDispatched,
    /// The intent no longer applies to the current record.
    Skipped,
    /// Transient failure; the claim was released for a later sweep.
    Deferred { reason: String },
    /// Permanent failure; the kind is parked for manual review.
    HeldForReview { reason: String },
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered => "delivered",
            DispatchOutcome::AlreadyDispatched => "already_dispatched",
            DispatchOutcome::Skipped => "skipped",
            DispatchOutcome::Deferred { .. } => "deferred",
            DispatchOutcome::HeldForReview { .. } => "held_for_review",
        }
    }
}

/// Executes intents against the notifier and drafter.
///
/// Cheap to clone; clones share the worker permits.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn ObligationStore>,
    notifier: Arc<dyn Notifier>,
    drafter: Arc<dyn Drafter>,
    ledger: Arc<dyn IdempotencyLedger>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    /// Claims acquired here and not yet completed, held or released.
    held: Arc<DashSet<IdempotencyKey>>,
    calls: CallPolicy,
    claim_ttl: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("available_permits", &self.permits.available_permits())
            .field("held_claims", &self.held.len())
            .field("calls", &self.calls)
            .field("claim_ttl", &self.claim_ttl)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ObligationStore>,
        notifier: Arc<dyn Notifier>,
        drafter: Arc<dyn Drafter>,
        ledger: Arc<dyn IdempotencyLedger>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            drafter,
            ledger,
            clock,
            permits: Arc::new(Semaphore::new(config.dispatch_concurrency.max(1))),
            held: Arc::new(DashSet::new()),
            calls: CallPolicy::from_config(config),
            claim_ttl: config.claim_ttl(),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop handing out worker permits. Queued dispatches fail with `ShutDown`.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Claims this dispatcher acquired and has not resolved yet.
    pub fn held_claims(&self) -> usize {
        self.held.len()
    }

    /// Release `key` if this dispatcher still holds its claim, for dispatches
    /// that panicked or were aborted mid-call. Returns whether it did.
    pub async fn release_held(&self, key: &IdempotencyKey) -> bool {
        if self.held.remove(key).is_none() {
            return false;
        }
        if let Err(e) = self.calls.store("release", || self.ledger.release(key)).await {
            warn!(key = %key, error = %e, "Failed to release idempotency claim");
        }
        true
    }

    /// Drop completed reminder entries older than one reminder epoch.
    pub async fn prune_ledger(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(1);
        match self
            .calls
            .store("prune", || self.ledger.prune_completed_before(cutoff))
            .await
        {
            Ok(pruned) => {
                if pruned > 0 {
                    debug!(pruned, cutoff = %cutoff, "Pruned idempotency ledger");
                }
                pruned
            }
            Err(e) => {
                warn!(error = %e, "Failed to prune idempotency ledger");
                0
            }
        }
    }

    /// Execute one intent at most once per epoch.
    #[instrument(skip(self, intent), fields(obligation_id = %intent.obligation_id(), kind = %intent.kind))]
    pub async fn dispatch(&self, intent: Intent) -> EngineResult<DispatchOutcome> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShutDown)?;

        let id = intent.obligation_id();
        let kind = intent.kind;
        let current = self.calls.store("get", || self.store.get(&id)).await?;
        let now = self.clock.now();

        if let Some(reason) = skip_reason(&current, kind, now) {
            debug!(reason, "Intent no longer applies");
            return Ok(DispatchOutcome::Skipped);
        }

        let key = IdempotencyKey::for_intent(&intent);
        let claim = self
            .calls
            .store("claim", || self.ledger.claim(&key, now, self.claim_ttl))
            .await?;
        match claim {
            Claim::Acquired => {
                self.held.insert(key.clone());
            }
            Claim::InFlight => {
                debug!(key = %key, "Claim held by another worker");
                return Ok(DispatchOutcome::AlreadyDispatched);
            }
            Claim::Completed { payload } => {
                // Delivered before but the flag write was lost.
                info!(key = %key, "Repairing flag for completed side effect");
                self.persist_success(id, kind, payload.as_deref()).await?;
                return Ok(DispatchOutcome::AlreadyDispatched);
            }
            Claim::Held { reason } => {
                // Failed permanently before but the review write was lost.
                info!(key = %key, "Repairing review flag for held side effect");
                self.persist_review(id, kind, &reason).await?;
                return Ok(DispatchOutcome::AlreadyDispatched);
            }
        }

        match self.execute(&intent).await {
            Ok(payload) => {
                // The call went out; this claim must never be released now.
                self.held.remove(&key);
                let completed_at = self.clock.now();
                if let Err(e) = self
                    .calls
                    .store("complete", || self.ledger.complete(&key, payload.clone(), completed_at))
                    .await
                {
                    warn!(key = %key, error = %e, "Failed to record completion in ledger");
                }
                self.persist_success(id, kind, payload.as_deref()).await?;
                info!(key = %key, "Side effect delivered");
                Ok(DispatchOutcome::Delivered)
            }
            Err(source) if source.is_transient() => {
                self.release_held(&key).await;
                let err = EngineError::TransientExternal {
                    obligation_id: id,
                    kind,
                    source,
                };
                warn!(key = %key, error = %err, "Transient external failure, will retry");
                Ok(DispatchOutcome::Deferred { reason: err.to_string() })
            }
            Err(source) => {
                self.held.remove(&key);
                let reason = source.to_string();
                let err = EngineError::PermanentExternal {
                    obligation_id: id,
                    kind,
                    source,
                };
                error!(key = %key, error = %err, "Permanent external failure, holding for manual review");
                let held_at = self.clock.now();
                if let Err(e) = self
                    .calls
                    .store("hold", || self.ledger.hold(&key, &reason, held_at))
                    .await
                {
                    warn!(key = %key, error = %e, "Failed to record held side effect in ledger");
                }
                self.persist_review(id, kind, &reason).await?;
                Ok(DispatchOutcome::HeldForReview { reason })
            }
        }
    }

    async fn execute(&self, intent: &Intent) -> ExternalResult<Option<String>> {
        match intent.kind {
            IntentKind::AttemptAutoDraft => self
                .calls
                .external(self.drafter.draft(&intent.context))
                .await
                .map(Some),
            IntentKind::SendReminder | IntentKind::Escalate => {
                let recipient = Recipient::for_intent(intent);
                let notification = Notification::for_intent(intent);
                self.calls
                    .external(self.notifier.send(&recipient, &notification))
                    .await
                    .map(|_| None)
            }
        }
    }

    async fn persist_success(&self, id: ObligationId, kind: IntentKind, payload: Option<&str>) -> EngineResult<()> {
        let now = self.clock.now();
        self.update(id, |ob| {
            if ob.flag_set(kind) {
                return false;
            }
            ob.record_side_effect(kind, payload, now);
            true
        })
        .await
    }

    async fn persist_review(&self, id: ObligationId, kind: IntentKind, reason: &str) -> EngineResult<()> {
        let now = self.clock.now();
        self.update(id, |ob| {
            if ob.is_held(kind) {
                return false;
            }
            ob.flag_for_review(kind, reason, now);
            true
        })
        .await
    }

    /// Read-modify-write with optimistic concurrency. A `Conflict` means
    /// someone saved in between; reload and re-apply.
    async fn update<F>(&self, id: ObligationId, mut apply: F) -> EngineResult<()>
    where
        F: FnMut(&mut Obligation) -> bool,
    {
        let mut last_conflict = None;
        for attempt in 1..=self.calls.attempts() {
            let mut current = self.calls.store("get", || self.store.get(&id)).await?;
            if !apply(&mut current) {
                return Ok(());
            }
            match self.calls.store("save", || self.store.save(current.clone())).await {
                Ok(_) => return Ok(()),
                Err(conflict @ StoreError::Conflict { .. }) => {
                    debug!(attempt, error = %conflict, "Version conflict, reloading");
                    last_conflict = Some(conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::TransientStore(last_conflict.unwrap_or(StoreError::Transient(
            "flag update did not converge".to_string(),
        ))))
    }
}

fn skip_reason(obligation: &Obligation, kind: IntentKind, now: DateTime<Utc>) -> Option<&'static str> {
    if obligation.is_terminal() {
        Some("obligation is terminal")
    } else if !obligation.is_overdue(now) {
        Some("obligation is not overdue")
    } else if obligation.flag_set(kind) {
        Some("flag already set")
    } else if obligation.is_held(kind) {
        Some("held for manual review")
    } else {
        None
    }
}
