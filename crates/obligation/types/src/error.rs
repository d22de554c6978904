//! Errors raised by the obligation data model.

use thiserror::Error;

use crate::{ObligationId, ObligationStatus};

/// Errors for lifecycle operations on a single obligation record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The requested status change is not an edge of the lifecycle.
    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: ObligationId,
        from: ObligationStatus,
        to: ObligationStatus,
    },

    /// The record violates a structural invariant.
    #[error("invariant violated for {id}: {detail}")]
    InvariantViolation { id: ObligationId, detail: String },
}

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
