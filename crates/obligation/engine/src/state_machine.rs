//! Obligation lifecycle state machine.
//!
//! ```text
//!   pending ──start──▶ in_progress
//!      │                   │
//!      ├──── now > deadline ────▶ overdue ──┐ (re-entry: no status write)
//!      │                   │        │  ◀────┘
//!      └──complete/cancel──┴────────┴──▶ completed | cancelled   (terminal)
//! ```
//!
//! Pure decision logic, no I/O. The only transition time can drive is
//! `{pending, in_progress} -> overdue`; everything else is an owner signal.

use chrono::{DateTime, Utc};
use obligation_types::{
    LifecycleError, LifecycleResult, Obligation, ObligationId, ObligationStatus,
};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Result of evaluating an obligation at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Status the obligation should have at `now`.
    pub next_status: ObligationStatus,
    /// Whether `next_status` differs from the stored status.
    pub status_changed: bool,
    /// Whether the escalation policy should be consulted.
    pub due_for_policy_check: bool,
}

/// A reachable-state check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InconsistentState {
    pub obligation_id: ObligationId,
    pub status: ObligationStatus,
    pub detail: String,
}

impl From<InconsistentState> for EngineError {
    fn from(err: InconsistentState) -> Self {
        EngineError::InconsistentState {
            obligation_id: err.obligation_id,
            detail: format!("{} (status {})", err.detail, err.status),
        }
    }
}

/// External signals from the owner, delivered through the CRUD layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerSignal {
    Start,
    Complete,
    Cancel,
}

/// Decide the next status of `obligation` at `now`.
///
/// Total over every reachable state. Unreachable combinations fail closed
/// with [`InconsistentState`] rather than being coerced.
pub fn evaluate(obligation: &Obligation, now: DateTime<Utc>) -> Result<Evaluation, InconsistentState> {
    let status = obligation.status;
    let inconsistent = |detail: &str| InconsistentState {
        obligation_id: obligation.id,
        status,
        detail: detail.to_string(),
    };

    match status {
        ObligationStatus::Completed => {
            if obligation.completed_at.is_none() {
                return Err(inconsistent("completed without completed_at"));
            }
            Ok(unchanged(status))
        }
        ObligationStatus::Cancelled => {
            if obligation.completed_at.is_some() {
                return Err(inconsistent("cancelled with completed_at set"));
            }
            Ok(unchanged(status))
        }
        ObligationStatus::Pending | ObligationStatus::InProgress => {
            if obligation.completed_at.is_some() {
                return Err(inconsistent("completed_at set on an open obligation"));
            }
            if now > obligation.deadline {
                Ok(Evaluation {
                    next_status: ObligationStatus::Overdue,
                    status_changed: true,
                    due_for_policy_check: true,
                })
            } else {
                Ok(unchanged(status))
            }
        }
        ObligationStatus::Overdue => {
            if obligation.completed_at.is_some() {
                return Err(inconsistent("completed_at set on an overdue obligation"));
            }
            if now <= obligation.deadline {
                return Err(inconsistent("overdue before its deadline"));
            }
            Ok(Evaluation {
                next_status: ObligationStatus::Overdue,
                status_changed: false,
                due_for_policy_check: true,
            })
        }
    }
}

fn unchanged(status: ObligationStatus) -> Evaluation {
    Evaluation {
        next_status: status,
        status_changed: false,
        due_for_policy_check: false,
    }
}

/// Apply a deadline-driven evaluation to the record.
///
/// Returns `true` when the stored status needs to be written.
pub fn apply_evaluation(obligation: &mut Obligation, evaluation: &Evaluation, now: DateTime<Utc>) -> bool {
    if !evaluation.status_changed {
        return false;
    }
    obligation.status = evaluation.next_status;
    obligation.updated_at = now;
    true
}

/// Apply an owner signal to the record.
///
/// `start` is only legal from `pending`; `complete` and `cancel` are legal
/// from any open status, including `overdue`.
pub fn apply_signal(obligation: &mut Obligation, signal: OwnerSignal, now: DateTime<Utc>) -> LifecycleResult<()> {
    let from = obligation.status;
    let to = match signal {
        OwnerSignal::Start => ObligationStatus::InProgress,
        OwnerSignal::Complete => ObligationStatus::Completed,
        OwnerSignal::Cancel => ObligationStatus::Cancelled,
    };

    let legal = match signal {
        OwnerSignal::Start => from == ObligationStatus::Pending,
        OwnerSignal::Complete | OwnerSignal::Cancel => matches!(
            from,
            ObligationStatus::Pending | ObligationStatus::InProgress | ObligationStatus::Overdue
        ),
    };
    if !legal {
        return Err(LifecycleError::IllegalTransition {
            id: obligation.id,
            from,
            to,
        });
    }

    obligation.status = to;
    obligation.updated_at = now;
    if to == ObligationStatus::Completed {
        obligation.completed_at = Some(now);
    }
    Ok(())
}
