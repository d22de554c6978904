//! Error types for the obligation engine.
//!
//! Errors are split by the collaborator that produced them. Everything
//! that happens to a single obligation is caught at the sweeper's
//! per-item boundary; only [`EngineError::Configuration`] is fatal.

use std::time::Duration;

use obligation_types::{IntentKind, LifecycleError, ObligationId};
use thiserror::Error;

/// Errors returned by an [`ObligationStore`](crate::store::ObligationStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Record does not exist.
    #[error("obligation not found: {0}")]
    NotFound(ObligationId),

    /// Optimistic concurrency check failed.
    #[error("version conflict for {id}: expected {expected}, found {found}")]
    Conflict {
        id: ObligationId,
        expected: u64,
        found: u64,
    },

    /// Backend is temporarily unavailable.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The call exceeded its deadline.
    #[error("store operation `{operation}` timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by external notifier and drafter services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    /// Worth retrying later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying will not help; a human has to look.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The call exceeded its deadline.
    #[error("external call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExternalError::Permanent(_))
    }
}

/// Result type for external service calls.
pub type ExternalResult<T> = Result<T, ExternalError>;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store failed in a way that may succeed on retry.
    #[error("transient store error: {0}")]
    TransientStore(StoreError),

    /// Record could not be found.
    #[error("obligation not found: {0}")]
    NotFound(ObligationId),

    /// Notifier or drafter failed in a way that may succeed on retry.
    #[error("transient external error for {obligation_id} ({kind}): {source}")]
    TransientExternal {
        obligation_id: ObligationId,
        kind: IntentKind,
        #[source]
        source: ExternalError,
    },

    /// Notifier or drafter refused permanently.
    #[error("permanent external error for {obligation_id} ({kind}): {source}")]
    PermanentExternal {
        obligation_id: ObligationId,
        kind: IntentKind,
        #[source]
        source: ExternalError,
    },

    /// State machine saw a combination that cannot be reached legally.
    #[error("inconsistent state for {obligation_id}: {detail}")]
    InconsistentState {
        obligation_id: ObligationId,
        detail: String,
    },

    /// Owner signal rejected by the lifecycle.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Invalid configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A worker task died unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),

    /// The engine is no longer running.
    #[error("engine has shut down")]
    ShutDown,
}

impl EngineError {
    /// Whether the failed operation should be retried on a later sweep.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TransientStore(_) | EngineError::TransientExternal { .. }
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::TransientStore(other),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
