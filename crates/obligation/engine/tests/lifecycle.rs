//! End-to-end lifecycle tests driven through the engine handle with a manual clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use obligation_engine::testing::{FailingNotifier, RecordingNotifier, ScriptedDrafter};
use obligation_engine::{
    apply_signal, Clock, Engine, EngineConfig, EngineHandle, ExternalError, InMemoryLedger, InMemoryStore,
    ManualClock, Notifier, ObligationStore, OwnerSignal, Recipient,
};
use obligation_types::{Counterparty, IntentKind, Obligation, ObligationStatus, ObligationType, OwnerId};

fn deadline() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
}

fn config() -> EngineConfig {
    EngineConfig {
        store_retry_backoff_ms: 1,
        ..Default::default()
    }
}

fn obligation(obligation_type: ObligationType) -> Obligation {
    Obligation::new(
        OwnerId::new("owner-1"),
        "Send the revised quote",
        obligation_type,
        deadline(),
        deadline() - Duration::days(3),
    )
    .with_counterparty(Counterparty::named("Dana").with_email("dana@example.com"))
}

fn start(store: &InMemoryStore, clock: &ManualClock, notifier: Arc<dyn Notifier>) -> EngineHandle {
    Engine::builder(Arc::new(store.clone()))
        .clock(Arc::new(clock.clone()))
        .notifier(notifier)
        .drafter(Arc::new(ScriptedDrafter::default()))
        .config(config())
        .start()
        .unwrap()
}

async fn sweep_at(engine: &EngineHandle, clock: &ManualClock, at: DateTime<Utc>) {
    clock.set(at);
    engine.sweep_now().await.unwrap();
    engine.settle().await.unwrap();
}

#[tokio::test]
async fn test_overdue_walkthrough() {
    let store = InMemoryStore::new();
    let clock = ManualClock::new(deadline() - Duration::hours(1));
    let notifier = RecordingNotifier::new();
    let engine = start(&store, &clock, Arc::new(notifier.clone()));

    let ob = store.insert(obligation(ObligationType::FollowUp)).await;
    engine.on_obligation_created(ob.clone()).await.unwrap();

    // One hour late: overdue, nothing sent yet.
    sweep_at(&engine, &clock, deadline() + Duration::hours(1)).await;
    let stored = store.get(&ob.id).await.unwrap();
    assert_eq!(stored.status, ObligationStatus::Overdue);
    assert!(!stored.reminder_sent);
    assert_eq!(notifier.count(), 0);

    // Past the reminder threshold: reminder and draft.
    sweep_at(&engine, &clock, deadline() + Duration::hours(25)).await;
    let stored = store.get(&ob.id).await.unwrap();
    assert!(stored.reminder_sent);
    assert!(stored.auto_drafted);
    assert_eq!(stored.draft_content.as_deref(), Some("Scripted draft"));
    assert!(!stored.escalated);
    assert_eq!(notifier.count_of(IntentKind::SendReminder), 1);
    assert!(matches!(
        notifier.deliveries()[0].recipient,
        Recipient::Counterparty(_)
    ));

    // Between thresholds nothing new is owed.
    clock.set(deadline() + Duration::hours(30));
    let report = engine.force_evaluate(ob.id).await.unwrap();
    assert_eq!(report.status, ObligationStatus::Overdue);
    assert!(report.dispatched.is_empty());
    assert_eq!(report.next_due, Some(deadline() + Duration::hours(72)));

    // Past the escalation threshold: escalate to the owner.
    sweep_at(&engine, &clock, deadline() + Duration::hours(73)).await;
    let stored = store.get(&ob.id).await.unwrap();
    assert!(stored.escalated);
    assert_eq!(notifier.count_of(IntentKind::Escalate), 1);
    let escalation = notifier
        .deliveries()
        .into_iter()
        .find(|d| d.notification.kind == IntentKind::Escalate)
        .unwrap();
    assert_eq!(escalation.recipient, Recipient::Owner(OwnerId::new("owner-1")));

    // Days later nothing fires again.
    sweep_at(&engine, &clock, deadline() + Duration::hours(200)).await;
    assert_eq!(notifier.count(), 2);
    let report = engine.force_evaluate(ob.id).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.next_due, None);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_before_deadline_never_fires() {
    let store = InMemoryStore::new();
    let clock = ManualClock::new(deadline() - Duration::hours(2));
    let notifier = RecordingNotifier::new();
    let engine = start(&store, &clock, Arc::new(notifier.clone()));

    let ob = store.insert(obligation(ObligationType::Invoice)).await;
    engine.on_obligation_created(ob.clone()).await.unwrap();

    let mut cancelled = store.get(&ob.id).await.unwrap();
    apply_signal(&mut cancelled, OwnerSignal::Cancel, clock.now()).unwrap();
    let cancelled = store.save(cancelled).await.unwrap();
    engine.on_obligation_updated(cancelled).await.unwrap();

    sweep_at(&engine, &clock, deadline() + Duration::hours(100)).await;

    let stored = store.get(&ob.id).await.unwrap();
    assert_eq!(stored.status, ObligationStatus::Cancelled);
    assert!(!stored.reminder_sent && !stored.escalated);
    assert_eq!(notifier.count(), 0);

    let report = engine.force_evaluate(ob.id).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.next_due, None);
    assert_eq!(engine.stats().await.unwrap().queue_len, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_completed_while_overdue_stops_escalation() {
    let store = InMemoryStore::new();
    let clock = ManualClock::new(deadline() + Duration::hours(25));
    let notifier = RecordingNotifier::new();
    let engine = start(&store, &clock, Arc::new(notifier.clone()));

    let ob = store.insert(obligation(ObligationType::Payment)).await;
    engine.on_obligation_created(ob.clone()).await.unwrap();
    sweep_at(&engine, &clock, clock.now()).await;
    assert_eq!(notifier.count_of(IntentKind::SendReminder), 1);

    let mut done = store.get(&ob.id).await.unwrap();
    apply_signal(&mut done, OwnerSignal::Complete, clock.now()).unwrap();
    let done = store.save(done).await.unwrap();
    engine.on_obligation_updated(done).await.unwrap();

    sweep_at(&engine, &clock, deadline() + Duration::hours(80)).await;
    let stored = store.get(&ob.id).await.unwrap();
    assert_eq!(stored.status, ObligationStatus::Completed);
    assert!(stored.completed_at.is_some());
    assert!(!stored.escalated);
    assert_eq!(notifier.count(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_engines_send_one_reminder() {
    let store = InMemoryStore::new();
    let clock = ManualClock::new(deadline() - Duration::hours(1));
    let ledger = Arc::new(InMemoryLedger::new());
    let notifier = RecordingNotifier::new().with_delay(std::time::Duration::from_millis(20));

    let build = || {
        Engine::builder(Arc::new(store.clone()))
            .clock(Arc::new(clock.clone()))
            .notifier(Arc::new(notifier.clone()))
            .ledger(ledger.clone())
            .config(config())
            .start()
            .unwrap()
    };
    let a = build();
    let b = build();

    let ob = store.insert(obligation(ObligationType::Invoice)).await;
    a.on_obligation_created(ob.clone()).await.unwrap();
    b.on_obligation_created(ob.clone()).await.unwrap();

    clock.set(deadline() + Duration::hours(25));
    let (swept_a, swept_b) = tokio::join!(a.sweep_now(), b.sweep_now());
    swept_a.unwrap();
    swept_b.unwrap();
    a.settle().await.unwrap();
    b.settle().await.unwrap();

    assert_eq!(notifier.count_of(IntentKind::SendReminder), 1);
    assert!(store.get(&ob.id).await.unwrap().reminder_sent);

    // Later sweeps on either engine stay quiet.
    clock.advance(Duration::minutes(5));
    let (swept_a, swept_b) = tokio::join!(a.sweep_now(), b.sweep_now());
    swept_a.unwrap();
    swept_b.unwrap();
    a.settle().await.unwrap();
    b.settle().await.unwrap();
    assert_eq!(notifier.count_of(IntentKind::SendReminder), 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconciliation_picks_up_unnotified_records() {
    let store = InMemoryStore::without_notifications();
    let clock = ManualClock::new(deadline() + Duration::hours(2));
    let notifier = RecordingNotifier::new();
    let engine = start(&store, &clock, Arc::new(notifier.clone()));

    // Written behind the engine's back: no handle call, no change stream.
    let ob = store.insert(obligation(ObligationType::Invoice)).await;

    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.scheduled, 1);
    assert_eq!(report.failed, 0);

    sweep_at(&engine, &clock, clock.now()).await;
    assert_eq!(store.get(&ob.id).await.unwrap().status, ObligationStatus::Overdue);

    sweep_at(&engine, &clock, deadline() + Duration::hours(25)).await;
    assert_eq!(notifier.count_of(IntentKind::SendReminder), 1);

    // Deleted records drop out on the next scan.
    store.remove(&ob.id).await;
    let report = engine.reconcile_now().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(engine.stats().await.unwrap().queue_len, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_is_held_not_retried() {
    let store = InMemoryStore::new();
    let clock = ManualClock::new(deadline() + Duration::hours(25));
    let notifier = FailingNotifier::always(ExternalError::Permanent("mailbox does not exist".into()));
    let engine = start(&store, &clock, Arc::new(notifier.clone()));

    let ob = store.insert(obligation(ObligationType::Invoice)).await;
    engine.on_obligation_created(ob.clone()).await.unwrap();
    sweep_at(&engine, &clock, clock.now()).await;

    let stored = store.get(&ob.id).await.unwrap();
    assert!(!stored.reminder_sent);
    assert!(stored.is_held(IntentKind::SendReminder));
    assert_eq!(notifier.attempts(), 1);

    sweep_at(&engine, &clock, deadline() + Duration::hours(26)).await;
    assert_eq!(notifier.attempts(), 1);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.held_for_review, 1);
    assert_eq!(stats.delivered, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let store = InMemoryStore::new();
    let config = EngineConfig {
        reminder_threshold_secs: 100,
        escalation_threshold_secs: 10,
        ..Default::default()
    };
    let err = Engine::builder(Arc::new(store)).config(config).start().unwrap_err();
    assert!(err.to_string().contains("escalation_threshold_secs"));
}
