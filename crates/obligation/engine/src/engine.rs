//! Engine assembly and the handle exposed to the CRUD layer.

use std::sync::Arc;

use obligation_types::{Obligation, ObligationId};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, IdempotencyLedger, InMemoryLedger};
use crate::error::{EngineError, EngineResult};
use crate::external::{Drafter, Notifier, TemplateDrafter, TracingNotifier};
use crate::policy::{EscalationPolicy, ThresholdPolicy};
use crate::store::ObligationStore;
use crate::sweeper::{EvaluationReport, ReconcileReport, Sweeper, SweeperCommand, SweeperStats};

/// Entry point for assembling an engine.
pub struct Engine;

impl Engine {
    pub fn builder(store: Arc<dyn ObligationStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }
}

/// Collects the engine's collaborators. Anything not set gets a default:
/// system clock, threshold policy from the config, tracing notifier,
/// template drafter, in-memory ledger.
pub struct EngineBuilder {
    store: Arc<dyn ObligationStore>,
    clock: Option<Arc<dyn Clock>>,
    policy: Option<Arc<dyn EscalationPolicy>>,
    notifier: Option<Arc<dyn Notifier>>,
    drafter: Option<Arc<dyn Drafter>>,
    ledger: Option<Arc<dyn IdempotencyLedger>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn ObligationStore>) -> Self {
        Self {
            store,
            clock: None,
            policy: None,
            notifier: None,
            drafter: None,
            ledger: None,
            config: EngineConfig::default(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn EscalationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn drafter(mut self, drafter: Arc<dyn Drafter>) -> Self {
        self.drafter = Some(drafter);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and spawn the sweeper on the current runtime.
    pub fn start(self) -> EngineResult<EngineHandle> {
        self.config.validate()?;

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(ThresholdPolicy::from_config(&config)));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let drafter = self.drafter.unwrap_or_else(|| Arc::new(TemplateDrafter));
        let ledger = self.ledger.unwrap_or_else(|| Arc::new(InMemoryLedger::new()));

        let dispatcher = Dispatcher::new(
            self.store.clone(),
            notifier,
            drafter,
            ledger,
            clock.clone(),
            &config,
        );
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sweeper = Sweeper::new(self.store, policy, dispatcher, clock, config);
        let task = tokio::spawn(sweeper.run(commands_rx, shutdown_rx));
        info!("Obligation engine started");

        Ok(EngineHandle {
            commands: commands_tx,
            shutdown: Arc::new(shutdown_tx),
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Handle to a running engine. Clones talk to the same sweeper.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<SweeperCommand>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl EngineHandle {
    /// Called by the CRUD layer after a new obligation is stored.
    #[instrument(skip(self, obligation), fields(obligation_id = %obligation.id))]
    pub async fn on_obligation_created(&self, obligation: Obligation) -> EngineResult<()> {
        self.send(SweeperCommand::Upsert(Box::new(obligation))).await
    }

    /// Called by the CRUD layer after an obligation is changed, including
    /// owner signals and deadline edits.
    #[instrument(skip(self, obligation), fields(obligation_id = %obligation.id))]
    pub async fn on_obligation_updated(&self, obligation: Obligation) -> EngineResult<()> {
        self.send(SweeperCommand::Upsert(Box::new(obligation))).await
    }

    /// Re-evaluate one obligation now.
    #[instrument(skip(self))]
    pub async fn force_evaluate(&self, id: ObligationId) -> EngineResult<EvaluationReport> {
        let (reply, rx) = oneshot::channel();
        self.send(SweeperCommand::ForceEvaluate { id, reply }).await?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Run a full store scan now.
    #[instrument(skip(self))]
    pub async fn reconcile_now(&self) -> EngineResult<ReconcileReport> {
        let (reply, rx) = oneshot::channel();
        self.send(SweeperCommand::Reconcile { reply }).await?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Process everything due at the engine clock's current time. Returns
    /// how many obligations were evaluated.
    pub async fn sweep_now(&self) -> EngineResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(SweeperCommand::SweepNow { reply }).await?;
        rx.await.map_err(|_| EngineError::ShutDown)
    }

    /// Wait until every in-flight dispatch has finished and been recorded.
    pub async fn settle(&self) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SweeperCommand::Settle { reply }).await?;
        rx.await.map_err(|_| EngineError::ShutDown)
    }

    pub async fn stats(&self) -> EngineResult<SweeperStats> {
        let (reply, rx) = oneshot::channel();
        self.send(SweeperCommand::Stats { reply }).await?;
        rx.await.map_err(|_| EngineError::ShutDown)
    }

    /// Stop the sweeper, giving in-flight dispatches the configured grace period.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> EngineResult<()> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await
                .map_err(|e| EngineError::Internal(format!("sweeper task failed: {}", e)))?;
            info!("Obligation engine stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn send(&self, command: SweeperCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::ShutDown)
    }
}
