//! Test doubles for the engine's collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use obligation_types::{IntentContext, IntentKind, Obligation, ObligationId};
use tokio::sync::broadcast;

use crate::error::{ExternalError, ExternalResult, StoreError, StoreResult};
use crate::external::{Drafter, Notification, Notifier, Recipient};
use crate::store::{ObligationFilter, ObligationStore, ObligationStream};

/// One call observed by a [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub recipient: Recipient,
    pub notification: Notification,
}

/// Notifier that records every delivery and always succeeds.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call, to keep calls in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_of(&self, kind: IntentKind) -> usize {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|d| d.notification.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &Recipient, notification: &Notification) -> ExternalResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Delivery {
                recipient: recipient.clone(),
                notification: notification.clone(),
            });
        Ok(())
    }
}

/// Notifier that fails a fixed number of times, then delegates to a recorder.
#[derive(Debug, Clone)]
pub struct FailingNotifier {
    error: ExternalError,
    remaining: Arc<AtomicU32>,
    attempts: Arc<AtomicUsize>,
    inner: RecordingNotifier,
}

impl FailingNotifier {
    /// Fail every call with `error`.
    pub fn always(error: ExternalError) -> Self {
        Self::times(error, u32::MAX)
    }

    /// Fail the first `failures` calls with `error`.
    pub fn times(error: ExternalError, failures: u32) -> Self {
        Self {
            error,
            remaining: Arc::new(AtomicU32::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
            inner: RecordingNotifier::new(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Deliveries that went through once failures ran out.
    pub fn delivered(&self) -> &RecordingNotifier {
        &self.inner
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, recipient: &Recipient, notification: &Notification) -> ExternalResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(self.error.clone());
        }
        self.inner.send(recipient, notification).await
    }
}

/// Drafter that plays back scripted results, then a fixed fallback draft.
#[derive(Debug, Clone)]
pub struct ScriptedDrafter {
    script: Arc<Mutex<VecDeque<ExternalResult<String>>>>,
    fallback: String,
    calls: Arc<AtomicUsize>,
}

impl Default for ScriptedDrafter {
    fn default() -> Self {
        Self::new("Scripted draft")
    }
}

impl ScriptedDrafter {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: fallback.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn then(self, result: ExternalResult<String>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Drafter for ScriptedDrafter {
    async fn draft(&self, _context: &IntentContext) -> ExternalResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Store wrapper that injects transient failures into `get` and `save`.
#[derive(Clone)]
pub struct FlakyStore<S> {
    inner: S,
    get_failures: Arc<AtomicU32>,
    save_failures: Arc<AtomicU32>,
}

impl<S: ObligationStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            get_failures: Arc::new(AtomicU32::new(0)),
            save_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail the next `n` calls to `get`.
    pub fn fail_gets(&self, n: u32) {
        self.get_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `save`.
    pub fn fail_saves(&self, n: u32) {
        self.save_failures.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<S: ObligationStore> ObligationStore for FlakyStore<S> {
    async fn get(&self, id: &ObligationId) -> StoreResult<Obligation> {
        if Self::take(&self.get_failures) {
            return Err(StoreError::Transient("injected get failure".to_string()));
        }
        self.inner.get(id).await
    }

    async fn list(&self, filter: &ObligationFilter) -> StoreResult<ObligationStream> {
        self.inner.list(filter).await
    }

    async fn save(&self, obligation: Obligation) -> StoreResult<Obligation> {
        if Self::take(&self.save_failures) {
            return Err(StoreError::Transient("injected save failure".to_string()));
        }
        self.inner.save(obligation).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ObligationId>> {
        self.inner.subscribe()
    }
}
