//! Obligation data model.
//!
//! An [`Obligation`] is a commitment with a deadline and a counterparty.
//! Its status is a closed enumeration with exactly one value at a time, and
//! its side-effect flags (`reminder_sent`, `escalated`, `auto_drafted`) are
//! monotonic: this crate offers setters for them but nothing that clears
//! them.
//!
//! Nothing here performs I/O. Time is always passed in by the caller.

#![deny(unsafe_code)]

pub mod error;
pub mod ids;
pub mod intent;
pub mod obligation;

pub use error::{LifecycleError, LifecycleResult};
pub use ids::{ObligationId, OwnerId};
pub use intent::{Epoch, Intent, IntentContext, IntentKind, IntentSet};
pub use obligation::{
    Counterparty, ManualReview, Obligation, ObligationStatus, ObligationType,
    UnknownObligationType,
};
