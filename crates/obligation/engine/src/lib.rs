//! Obligation lifecycle and escalation engine.
//!
//! The engine watches a store of [`Obligation`](obligation_types::Obligation)
//! records and does three things with them:
//!
//! - moves records past their deadline to `overdue`
//! - asks an [`EscalationPolicy`] which side effects are owed
//! - hands those to a [`Dispatcher`] that fires each one at most once
//!
//! A single [`Sweeper`] task owns the due-time queue. It is fed by change
//! notifications from the CRUD layer (through an [`EngineHandle`]), by the
//! store's change stream when it has one, and by a periodic reconciliation
//! scan that heals anything missed.
//!
//! ```ignore
//! let store = Arc::new(InMemoryStore::new());
//! let engine = Engine::builder(store.clone())
//!     .config(EngineConfig::default())
//!     .start()?;
//!
//! let ob = store.insert(obligation).await;
//! engine.on_obligation_created(ob).await?;
//! ```

#![deny(unsafe_code)]

mod call;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod external;
pub mod ollama;
pub mod policy;
pub mod state_machine;
pub mod store;
pub mod sweeper;
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::EngineConfig;
pub use dispatcher::{
    Claim, DispatchOutcome, Dispatcher, IdempotencyKey, IdempotencyLedger, InMemoryLedger,
};
pub use engine::{Engine, EngineBuilder, EngineHandle};
pub use error::{
    EngineError, EngineResult, ExternalError, ExternalResult, StoreError, StoreResult,
};
pub use external::{Drafter, Notification, Notifier, Recipient, TemplateDrafter, TracingNotifier};
pub use ollama::OllamaDrafter;
pub use policy::{EscalationPolicy, PolicyRouter, ThresholdPolicy};
pub use state_machine::{apply_signal, evaluate, Evaluation, OwnerSignal};
pub use store::{InMemoryStore, ObligationFilter, ObligationStore, ObligationStream};
pub use sweeper::{EvaluationReport, ReconcileReport, Sweeper, SweeperCommand, SweeperStats};
