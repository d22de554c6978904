//! Scheduling loop.
//!
//! The sweeper task is the only owner of the [`DueQueue`]. Everything else
//! talks to it through [`SweeperCommand`]s. Each obligation sits in the
//! queue at its next interesting timestamp; when that passes the sweeper
//! re-reads the record, applies the deadline transition, asks the policy
//! for intents and hands them to the dispatcher's worker pool.
//!
//! Per-obligation failures never leave [`Sweeper::evaluate_one`]:
//! transient errors reschedule after `retry_delay_secs`, inconsistent
//! records are dropped from the queue until the next reconciliation.

mod queue;

pub use queue::DueQueue;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use obligation_types::{Intent, IntentKind, Obligation, ObligationId, ObligationStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::call::CallPolicy;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher, IdempotencyKey};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::policy::EscalationPolicy;
use crate::state_machine::{apply_evaluation, evaluate, Evaluation, InconsistentState};
use crate::store::{ObligationFilter, ObligationStore};

/// Messages accepted by the sweeper task.
#[derive(Debug)]
pub enum SweeperCommand {
    /// A record was created or changed by the CRUD layer.
    Upsert(Box<Obligation>),
    /// Re-evaluate one obligation now, regardless of its due time.
    ForceEvaluate {
        id: ObligationId,
        reply: oneshot::Sender<EngineResult<EvaluationReport>>,
    },
    /// Run a full reconciliation scan now.
    Reconcile {
        reply: oneshot::Sender<EngineResult<ReconcileReport>>,
    },
    /// Process everything due at the clock's current time.
    SweepNow { reply: oneshot::Sender<usize> },
    /// Wait for every in-flight dispatch to finish.
    Settle { reply: oneshot::Sender<()> },
    Stats { reply: oneshot::Sender<SweeperStats> },
}

/// Counters kept by the sweeper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperStats {
    pub evaluated: u64,
    pub transitioned: u64,
    pub dispatched: u64,
    pub delivered: u64,
    pub deduplicated: u64,
    pub deferred: u64,
    pub held_for_review: u64,
    pub inconsistent: u64,
    pub failures: u64,
    pub reconciliations: u64,
    pub queue_len: usize,
    pub in_flight: usize,
}

/// Result of a full store scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Records returned by the scan.
    pub scanned: usize,
    /// Records that now have a queue entry.
    pub scheduled: usize,
    /// Queue entries dropped because the record is gone or has nothing left to do.
    pub removed: usize,
    /// Records that could not be read or evaluated.
    pub failed: usize,
    /// Expired entries dropped from the idempotency ledger.
    pub pruned: usize,
}

/// What a single evaluation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub obligation_id: ObligationId,
    pub status: ObligationStatus,
    /// Whether the deadline transition was written.
    pub transitioned: bool,
    /// Intent kinds handed to the dispatcher.
    pub dispatched: Vec<IntentKind>,
    pub next_due: Option<DateTime<Utc>>,
}

type Slot = (ObligationId, IntentKind);

struct DispatchDone {
    slot: Slot,
    key: IdempotencyKey,
    result: EngineResult<DispatchOutcome>,
}

/// Single owner of the due queue and the dispatch task set.
pub struct Sweeper {
    store: Arc<dyn ObligationStore>,
    policy: Arc<dyn EscalationPolicy>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    calls: CallPolicy,
    queue: DueQueue,
    in_flight: HashMap<Slot, IdempotencyKey>,
    cooldown: HashMap<Slot, DateTime<Utc>>,
    dispatches: JoinSet<DispatchDone>,
    changes: Option<broadcast::Receiver<ObligationId>>,
    stats: SweeperStats,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn ObligationStore>,
        policy: Arc<dyn EscalationPolicy>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let changes = store.subscribe();
        if changes.is_none() {
            info!("Store has no change stream, relying on reconciliation");
        }
        Self {
            store,
            policy,
            dispatcher,
            clock,
            calls: CallPolicy::from_config(&config),
            config,
            queue: DueQueue::new(),
            in_flight: HashMap::new(),
            cooldown: HashMap::new(),
            dispatches: JoinSet::new(),
            changes,
            stats: SweeperStats::default(),
        }
    }

    /// Run until shutdown is signalled or every command sender is gone.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SweeperCommand>, mut shutdown: watch::Receiver<bool>) {
        let mut reconcile = tokio::time::interval(self.config.reconciliation_interval());
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            reconciliation_interval_secs = self.config.reconciliation_interval_secs,
            dispatch_concurrency = self.config.dispatch_concurrency,
            "Sweeper started"
        );

        loop {
            let wait = self.idle_wait();
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                Some(joined) = self.dispatches.join_next(), if !self.dispatches.is_empty() => {
                    match joined {
                        Ok(done) => self.on_dispatch_done(done).await,
                        Err(e) => error!(error = %e, "Dispatch task failed to join"),
                    }
                }

                change = next_change(&mut self.changes) => self.on_change(change).await,

                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation failed");
                    }
                }

                _ = tokio::time::sleep(wait) => {
                    self.sweep_due(self.clock.now()).await;
                }
            }
        }

        self.drain().await;
        info!(stats = ?self.stats(), "Sweeper stopped");
    }

    async fn handle_command(&mut self, command: SweeperCommand) {
        match command {
            SweeperCommand::Upsert(obligation) => self.ingest(&obligation, self.clock.now()),
            SweeperCommand::ForceEvaluate { id, reply } => {
                let report = self.evaluate_one(id, self.clock.now()).await;
                let _ = reply.send(report);
            }
            SweeperCommand::Reconcile { reply } => {
                let report = self.reconcile().await;
                let _ = reply.send(report);
            }
            SweeperCommand::SweepNow { reply } => {
                let swept = self.sweep_due(self.clock.now()).await;
                let _ = reply.send(swept);
            }
            SweeperCommand::Settle { reply } => {
                self.settle().await;
                let _ = reply.send(());
            }
            SweeperCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    pub fn stats(&self) -> SweeperStats {
        SweeperStats {
            queue_len: self.queue.len(),
            in_flight: self.in_flight.len(),
            ..self.stats.clone()
        }
    }

    pub fn queue(&self) -> &DueQueue {
        &self.queue
    }

    /// Evaluate every obligation due at or before `now`. Returns how many were popped.
    pub async fn sweep_due(&mut self, now: DateTime<Utc>) -> usize {
        let due = self.queue.pop_due(now);
        if !due.is_empty() {
            debug!(count = due.len(), "Sweeping due obligations");
        }
        for id in &due {
            // Errors are handled and logged inside.
            let _ = self.evaluate_one(*id, now).await;
        }
        due.len()
    }

    /// Evaluate one obligation behind the per-item error boundary.
    pub async fn evaluate_one(&mut self, id: ObligationId, now: DateTime<Utc>) -> EngineResult<EvaluationReport> {
        match self.process(id, now).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.on_failure(id, &e, now);
                Err(e)
            }
        }
    }

    /// Queue or drop `obligation` from a record in hand, without touching the store.
    pub fn ingest(&mut self, obligation: &Obligation, now: DateTime<Utc>) {
        if obligation.is_terminal() {
            debug!(obligation_id = %obligation.id, status = %obligation.status, "Obligation is terminal, unscheduling");
            self.forget(obligation.id);
            return;
        }
        match self.schedule(obligation, now) {
            Ok(next_due) => debug!(obligation_id = %obligation.id, next_due = ?next_due, "Obligation scheduled"),
            Err(inconsistent) => self.on_inconsistent(inconsistent.obligation_id, &inconsistent.detail),
        }
    }

    /// Scan every non-terminal record and rebuild queue entries from it.
    pub async fn reconcile(&mut self) -> EngineResult<ReconcileReport> {
        let now = self.clock.now();
        let filter = ObligationFilter::non_terminal();
        let mut stream = self.calls.store("list", || self.store.list(&filter)).await?;

        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();
        let mut complete_scan = true;
        loop {
            let item = match tokio::time::timeout(self.config.call_timeout(), stream.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    warn!("Reconciliation scan timed out, keeping existing schedule");
                    report.failed += 1;
                    complete_scan = false;
                    break;
                }
            };
            match item {
                Ok(obligation) => {
                    report.scanned += 1;
                    seen.insert(obligation.id);
                    match self.schedule(&obligation, now) {
                        Ok(Some(_)) => report.scheduled += 1,
                        Ok(None) => {}
                        Err(inconsistent) => {
                            report.failed += 1;
                            self.on_inconsistent(inconsistent.obligation_id, &inconsistent.detail);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read obligation during reconciliation");
                    report.failed += 1;
                    complete_scan = false;
                }
            }
        }

        if complete_scan {
            let stale: Vec<ObligationId> = self.queue.ids().filter(|id| !seen.contains(id)).collect();
            for id in stale {
                self.forget(id);
                report.removed += 1;
            }
        }
        report.pruned = self.dispatcher.prune_ledger(now).await;

        self.stats.reconciliations += 1;
        info!(
            scanned = report.scanned,
            scheduled = report.scheduled,
            removed = report.removed,
            failed = report.failed,
            pruned = report.pruned,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Wait for every in-flight dispatch and process its completion.
    pub async fn settle(&mut self) {
        while let Some(joined) = self.dispatches.join_next().await {
            match joined {
                Ok(done) => self.on_dispatch_done(done).await,
                Err(e) => error!(error = %e, "Dispatch task failed to join"),
            }
        }
    }

    async fn process(&mut self, id: ObligationId, now: DateTime<Utc>) -> EngineResult<EvaluationReport> {
        let (obligation, evaluation) = self.advance(id, now).await?;
        let mut report = EvaluationReport {
            obligation_id: id,
            status: obligation.status,
            transitioned: evaluation.status_changed,
            dispatched: Vec::new(),
            next_due: None,
        };

        if evaluation.due_for_policy_check {
            let intents = self.policy.decide(&obligation, now, obligation.overdue_by(now));
            for intent in intents {
                let slot = (id, intent.kind);
                if self.in_flight.contains_key(&slot) {
                    debug!(obligation_id = %id, kind = %intent.kind, "Dispatch already in flight");
                    continue;
                }
                if self.cooldown.get(&slot).is_some_and(|until| *until > now) {
                    debug!(obligation_id = %id, kind = %intent.kind, "Intent cooling down after failure");
                    continue;
                }
                self.cooldown.remove(&slot);
                report.dispatched.push(intent.kind);
                self.spawn_dispatch(slot, intent);
            }
        }

        report.next_due = self.schedule(&obligation, now)?;
        Ok(report)
    }

    /// Read the record and write the deadline transition if one is due.
    async fn advance(&mut self, id: ObligationId, now: DateTime<Utc>) -> EngineResult<(Obligation, Evaluation)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut current = self.calls.store("get", || self.store.get(&id)).await?;
            let evaluation = evaluate(&current, now)?;
            self.stats.evaluated += 1;

            if !apply_evaluation(&mut current, &evaluation, now) {
                return Ok((current, evaluation));
            }
            match self.calls.store("save", || self.store.save(current.clone())).await {
                Ok(saved) => {
                    self.stats.transitioned += 1;
                    info!(obligation_id = %id, status = %saved.status, deadline = %saved.deadline, "Obligation transitioned");
                    return Ok((saved, evaluation));
                }
                Err(StoreError::Conflict { .. }) if attempt < self.calls.attempts() => {
                    debug!(obligation_id = %id, attempt, "Version conflict on transition, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Compute the next due time for `obligation` and update its queue entry.
    fn schedule(&mut self, obligation: &Obligation, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, InconsistentState> {
        let next = self.next_due(obligation, now)?;
        match next {
            Some(at) => self.queue.schedule(obligation.id, at),
            None => {
                self.queue.remove(&obligation.id);
            }
        }
        Ok(next)
    }

    fn next_due(&self, obligation: &Obligation, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, InconsistentState> {
        if obligation.is_terminal() {
            return Ok(None);
        }
        let evaluation = evaluate(obligation, now)?;
        if evaluation.status_changed {
            return Ok(Some(now));
        }

        let mut next = self.policy.next_wakeup(obligation, now);
        if evaluation.due_for_policy_check {
            let intents = self.policy.decide(obligation, now, obligation.overdue_by(now));
            for intent in intents.iter() {
                let slot = (obligation.id, intent.kind);
                if self.in_flight.contains_key(&slot) {
                    // The completion refreshes this record.
                    continue;
                }
                let at = match self.cooldown.get(&slot) {
                    Some(until) if *until > now => *until,
                    _ => now,
                };
                next = Some(next.map_or(at, |n| n.min(at)));
            }
        }
        Ok(next)
    }

    fn spawn_dispatch(&mut self, slot: Slot, intent: Intent) {
        let key = IdempotencyKey::for_intent(&intent);
        self.in_flight.insert(slot, key.clone());
        self.stats.dispatched += 1;

        let dispatcher = self.dispatcher.clone();
        self.dispatches.spawn(async move {
            let result = AssertUnwindSafe(dispatcher.dispatch(intent))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(EngineError::Internal("dispatch task panicked".to_string())));
            DispatchDone { slot, key, result }
        });
    }

    async fn on_dispatch_done(&mut self, done: DispatchDone) {
        let DispatchDone { slot, key, result } = done;
        let (id, kind) = slot;
        self.in_flight.remove(&slot);
        let now = self.clock.now();

        match result {
            Ok(outcome) => {
                debug!(obligation_id = %id, kind = %kind, outcome = outcome.as_str(), "Dispatch finished");
                match outcome {
                    DispatchOutcome::Delivered => {
                        self.stats.delivered += 1;
                        self.cooldown.remove(&slot);
                    }
                    DispatchOutcome::AlreadyDispatched => {
                        self.stats.deduplicated += 1;
                        self.cooldown.insert(slot, now + self.config.retry_delay());
                    }
                    DispatchOutcome::Skipped => {
                        // A policy that keeps proposing a skipped intent must not spin.
                        self.cooldown.insert(slot, now + self.config.retry_delay());
                    }
                    DispatchOutcome::Deferred { .. } => {
                        self.stats.deferred += 1;
                        self.cooldown.insert(slot, now + self.config.retry_delay());
                    }
                    DispatchOutcome::HeldForReview { .. } => {
                        self.stats.held_for_review += 1;
                        self.cooldown.remove(&slot);
                    }
                }
            }
            Err(EngineError::ShutDown) => {
                debug!(obligation_id = %id, kind = %kind, "Dispatch refused during shutdown");
                return;
            }
            Err(e) => {
                self.stats.failures += 1;
                warn!(obligation_id = %id, kind = %kind, error = %e, "Dispatch failed, will retry");
                if self.dispatcher.release_held(&key).await {
                    debug!(obligation_id = %id, kind = %kind, "Released claim left by failed dispatch");
                }
                self.cooldown.insert(slot, now + self.config.retry_delay());
            }
        }

        self.refresh(id, now).await;
    }

    async fn on_change(&mut self, change: Result<ObligationId, broadcast::error::RecvError>) {
        match change {
            Ok(id) => self.refresh(id, self.clock.now()).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Change stream lagged, reconciling");
                if let Err(e) = self.reconcile().await {
                    error!(error = %e, "Reconciliation after lag failed");
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Change stream closed, relying on reconciliation");
                self.changes = None;
            }
        }
    }

    /// Re-read one record and reschedule it.
    async fn refresh(&mut self, id: ObligationId, now: DateTime<Utc>) {
        match self.calls.store("get", || self.store.get(&id)).await {
            Ok(obligation) => self.ingest(&obligation, now),
            Err(StoreError::NotFound(_)) => {
                debug!(obligation_id = %id, "Obligation deleted, unscheduling");
                self.forget(id);
            }
            Err(e) => {
                warn!(obligation_id = %id, error = %e, "Failed to refresh obligation");
                self.queue.schedule_earliest(id, now + self.config.retry_delay());
            }
        }
    }

    fn on_failure(&mut self, id: ObligationId, err: &EngineError, now: DateTime<Utc>) {
        match err {
            EngineError::InconsistentState { obligation_id, detail } => {
                self.on_inconsistent(*obligation_id, detail)
            }
            EngineError::NotFound(_) => {
                debug!(obligation_id = %id, "Obligation deleted, unscheduling");
                self.forget(id);
            }
            other => {
                self.stats.failures += 1;
                if other.is_transient() {
                    warn!(obligation_id = %id, error = %other, "Evaluation failed, retrying later");
                } else {
                    error!(obligation_id = %id, error = %other, "Evaluation failed");
                }
                self.queue.schedule(id, now + self.config.retry_delay());
            }
        }
    }

    fn on_inconsistent(&mut self, id: ObligationId, detail: &str) {
        self.stats.inconsistent += 1;
        warn!(obligation_id = %id, detail, "Inconsistent obligation state, skipping until reconciliation");
        self.forget(id);
    }

    fn forget(&mut self, id: ObligationId) {
        self.queue.remove(&id);
        self.cooldown.retain(|(oid, _), _| *oid != id);
    }

    /// Give in-flight dispatches the grace period, then abort the rest and
    /// release their claims.
    async fn drain(&mut self) {
        if !self.dispatches.is_empty() {
            self.wait_or_abort().await;
        }
        self.dispatcher.close();
    }

    async fn wait_or_abort(&mut self) {
        let grace = self.config.shutdown_grace();
        info!(in_flight = self.dispatches.len(), grace_secs = grace.as_secs(), "Waiting for in-flight dispatches");
        if tokio::time::timeout(grace, self.settle()).await.is_ok() {
            return;
        }

        self.dispatches.abort_all();
        while self.dispatches.join_next().await.is_some() {}

        let orphaned: Vec<IdempotencyKey> = self.in_flight.drain().map(|(_, key)| key).collect();
        let mut released = 0;
        for key in &orphaned {
            if self.dispatcher.release_held(key).await {
                released += 1;
            }
        }
        warn!(aborted = orphaned.len(), released, "Aborted in-flight dispatches after grace period");
    }

    fn idle_wait(&mut self) -> std::time::Duration {
        let max_idle = self.config.max_idle();
        match self.queue.next_due() {
            Some(at) => (at - self.clock.now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
                .min(max_idle),
            None => max_idle,
        }
    }
}

async fn next_change(
    changes: &mut Option<broadcast::Receiver<ObligationId>>,
) -> Result<ObligationId, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
