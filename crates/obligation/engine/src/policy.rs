//! Escalation policy: maps "how overdue" to side-effect intents.
//!
//! A policy only proposes. It never performs I/O and never suspends; the
//! dispatcher decides whether a proposed intent actually fires.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use obligation_types::{Intent, IntentKind, IntentSet, Obligation, ObligationStatus, ObligationType, OwnerId};

use crate::config::EngineConfig;

/// Rule set deciding which side effects an obligation is due for.
pub trait EscalationPolicy: Send + Sync {
    /// Intents `obligation` is due for at `now`, given how far past its deadline it is.
    fn decide(&self, obligation: &Obligation, now: DateTime<Utc>, overdue_by: Duration) -> IntentSet;

    /// Next instant strictly after `now` at which [`decide`](Self::decide)
    /// or the state machine could produce something new. `None` when
    /// nothing time-driven remains.
    fn next_wakeup(&self, obligation: &Obligation, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Default rule set: grace period, then reminder, then escalation.
///
/// ```text
///   deadline          +reminder            +escalation
///      │   grace        │ SendReminder        │ Escalate
///      │                │ AttemptAutoDraft*   │
/// ─────┴────────────────┴─────────────────────┴──────▶ time
/// ```
/// `*` only for types in the auto-draft set.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    reminder_threshold: Duration,
    escalation_threshold: Duration,
    auto_draft_types: Vec<ObligationType>,
}

impl ThresholdPolicy {
    pub fn new(reminder_threshold: Duration, escalation_threshold: Duration) -> Self {
        Self {
            reminder_threshold,
            escalation_threshold,
            auto_draft_types: Vec::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            reminder_threshold: config.reminder_threshold(),
            escalation_threshold: config.escalation_threshold(),
            auto_draft_types: config.auto_draft_enabled_types.clone(),
        }
    }

    pub fn with_auto_draft_types(mut self, types: impl IntoIterator<Item = ObligationType>) -> Self {
        self.auto_draft_types = types.into_iter().collect();
        self
    }

    pub fn reminder_threshold(&self) -> Duration {
        self.reminder_threshold
    }

    pub fn escalation_threshold(&self) -> Duration {
        self.escalation_threshold
    }

    fn auto_draft_eligible(&self, obligation: &Obligation) -> bool {
        self.auto_draft_types.contains(&obligation.obligation_type)
    }

    /// Whether `kind` could still fire for `obligation` at some point.
    fn pending(&self, obligation: &Obligation, kind: IntentKind) -> bool {
        if obligation.flag_set(kind) || obligation.is_held(kind) {
            return false;
        }
        kind != IntentKind::AttemptAutoDraft || self.auto_draft_eligible(obligation)
    }

    fn threshold(&self, kind: IntentKind) -> Duration {
        match kind {
            IntentKind::SendReminder | IntentKind::AttemptAutoDraft => self.reminder_threshold,
            IntentKind::Escalate => self.escalation_threshold,
        }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EscalationPolicy for ThresholdPolicy {
    fn decide(&self, obligation: &Obligation, now: DateTime<Utc>, overdue_by: Duration) -> IntentSet {
        let mut intents = IntentSet::new();
        if obligation.is_terminal() || overdue_by <= Duration::zero() {
            return intents;
        }

        for kind in IntentKind::ALL {
            if overdue_by >= self.threshold(kind) && self.pending(obligation, kind) {
                intents.insert(Intent::new(kind, obligation, now));
            }
        }
        intents
    }

    fn next_wakeup(&self, obligation: &Obligation, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if obligation.is_terminal() {
            return None;
        }

        let mut candidates = Vec::with_capacity(4);
        if obligation.status != ObligationStatus::Overdue {
            // The overdue transition is strict: now > deadline.
            candidates.push(obligation.deadline + Duration::milliseconds(1));
        }
        for kind in IntentKind::ALL {
            if self.pending(obligation, kind) {
                candidates.push(obligation.deadline + self.threshold(kind));
            }
        }

        candidates.into_iter().filter(|at| *at > now).min()
    }
}

/// Routes each obligation to a policy by owner, then by type, then to a default.
#[derive(Clone)]
pub struct PolicyRouter {
    default: Arc<dyn EscalationPolicy>,
    by_owner: HashMap<OwnerId, Arc<dyn EscalationPolicy>>,
    by_type: HashMap<ObligationType, Arc<dyn EscalationPolicy>>,
}

impl PolicyRouter {
    pub fn new(default: Arc<dyn EscalationPolicy>) -> Self {
        Self {
            default,
            by_owner: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    pub fn with_owner_policy(mut self, owner: OwnerId, policy: Arc<dyn EscalationPolicy>) -> Self {
        self.by_owner.insert(owner, policy);
        self
    }

    pub fn with_type_policy(mut self, obligation_type: ObligationType, policy: Arc<dyn EscalationPolicy>) -> Self {
        self.by_type.insert(obligation_type, policy);
        self
    }

    /// The policy responsible for `obligation`.
    pub fn route(&self, obligation: &Obligation) -> &dyn EscalationPolicy {
        self.by_owner
            .get(&obligation.owner_id)
            .or_else(|| self.by_type.get(&obligation.obligation_type))
            .unwrap_or(&self.default)
            .as_ref()
    }
}

impl std::fmt::Debug for PolicyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRouter")
            .field("owners", &self.by_owner.len())
            .field("types", &self.by_type.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EscalationPolicy for PolicyRouter {
    fn decide(&self, obligation: &Obligation, now: DateTime<Utc>, overdue_by: Duration) -> IntentSet {
        self.route(obligation).decide(obligation, now, overdue_by)
    }

    fn next_wakeup(&self, obligation: &Obligation, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.route(obligation).next_wakeup(obligation, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn deadline() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn obligation(obligation_type: ObligationType) -> Obligation {
        let mut ob = Obligation::new(
            OwnerId::new("owner"),
            "Send the signed contract",
            obligation_type,
            deadline(),
            deadline() - Duration::days(2),
        );
        ob.status = ObligationStatus::Overdue;
        ob
    }

    fn decide_at(policy: &ThresholdPolicy, ob: &Obligation, after: Duration) -> Vec<IntentKind> {
        let now = deadline() + after;
        policy.decide(ob, now, ob.overdue_by(now)).kinds()
    }

    #[test]
    fn test_default_thresholds_walkthrough() {
        let policy = ThresholdPolicy::new(Duration::hours(24), Duration::hours(72));
        let mut ob = obligation(ObligationType::Invoice);

        assert!(decide_at(&policy, &ob, Duration::hours(1)).is_empty());
        assert_eq!(decide_at(&policy, &ob, Duration::hours(25)), vec![IntentKind::SendReminder]);

        ob.record_reminder_sent(deadline() + Duration::hours(25));
        assert!(decide_at(&policy, &ob, Duration::hours(30)).is_empty());
        assert_eq!(decide_at(&policy, &ob, Duration::hours(73)), vec![IntentKind::Escalate]);

        ob.record_escalated(deadline() + Duration::hours(73));
        assert!(decide_at(&policy, &ob, Duration::days(30)).is_empty());
    }

    #[test]
    fn test_no_intents_before_or_at_deadline() {
        let policy = ThresholdPolicy::new(Duration::zero(), Duration::zero());
        let ob = obligation(ObligationType::FollowUp);
        assert!(decide_at(&policy, &ob, Duration::zero()).is_empty());
        assert!(decide_at(&policy, &ob, -Duration::hours(1)).is_empty());
    }

    #[test]
    fn test_auto_draft_only_for_enabled_types() {
        let policy = ThresholdPolicy::new(Duration::hours(24), Duration::hours(72))
            .with_auto_draft_types([ObligationType::FollowUp]);

        let follow_up = obligation(ObligationType::FollowUp);
        assert_eq!(
            decide_at(&policy, &follow_up, Duration::hours(25)),
            vec![IntentKind::SendReminder, IntentKind::AttemptAutoDraft]
        );
        // Grace period applies to drafting too.
        assert!(decide_at(&policy, &follow_up, Duration::hours(2)).is_empty());

        let payment = obligation(ObligationType::Payment);
        assert_eq!(decide_at(&policy, &payment, Duration::hours(25)), vec![IntentKind::SendReminder]);
    }

    #[test]
    fn test_from_config_drafts_for_configured_types() {
        let policy = ThresholdPolicy::from_config(&EngineConfig::default());
        assert_eq!(
            decide_at(&policy, &obligation(ObligationType::Reminder), Duration::hours(25)),
            vec![IntentKind::SendReminder, IntentKind::AttemptAutoDraft]
        );
        assert_eq!(
            decide_at(&policy, &obligation(ObligationType::Invoice), Duration::hours(25)),
            vec![IntentKind::SendReminder]
        );

        let config = EngineConfig {
            auto_draft_enabled_types: vec![ObligationType::Invoice],
            ..Default::default()
        };
        let policy = ThresholdPolicy::from_config(&config);
        assert_eq!(
            decide_at(&policy, &obligation(ObligationType::Invoice), Duration::hours(25)),
            vec![IntentKind::SendReminder, IntentKind::AttemptAutoDraft]
        );
        assert_eq!(
            decide_at(&policy, &obligation(ObligationType::FollowUp), Duration::hours(25)),
            vec![IntentKind::SendReminder]
        );
    }

    #[test]
    fn test_held_kinds_are_suppressed() {
        let policy = ThresholdPolicy::new(Duration::hours(24), Duration::hours(72));
        let mut ob = obligation(ObligationType::Invoice);
        ob.flag_for_review(IntentKind::SendReminder, "mailbox does not exist", deadline());
        assert_eq!(decide_at(&policy, &ob, Duration::hours(80)), vec![IntentKind::Escalate]);
    }

    #[test]
    fn test_terminal_obligations_emit_nothing() {
        let policy = ThresholdPolicy::new(Duration::hours(1), Duration::hours(2));
        let mut ob = obligation(ObligationType::FollowUp);
        ob.status = ObligationStatus::Cancelled;
        assert!(decide_at(&policy, &ob, Duration::days(10)).is_empty());
        assert_eq!(policy.next_wakeup(&ob, deadline()), None);
    }

    #[test]
    fn test_next_wakeup_walks_the_thresholds() {
        let policy = ThresholdPolicy::new(Duration::hours(24), Duration::hours(72));
        let mut ob = obligation(ObligationType::Invoice);
        ob.status = ObligationStatus::Pending;

        let before = deadline() - Duration::hours(5);
        assert_eq!(policy.next_wakeup(&ob, before), Some(deadline() + Duration::milliseconds(1)));

        ob.status = ObligationStatus::Overdue;
        let after = deadline() + Duration::hours(1);
        assert_eq!(policy.next_wakeup(&ob, after), Some(deadline() + Duration::hours(24)));

        ob.record_reminder_sent(after);
        assert_eq!(policy.next_wakeup(&ob, after), Some(deadline() + Duration::hours(72)));

        ob.record_escalated(after);
        assert_eq!(policy.next_wakeup(&ob, after), None);
    }

    #[test]
    fn test_next_wakeup_is_strictly_after_now() {
        let policy = ThresholdPolicy::new(Duration::hours(24), Duration::hours(72));
        let ob = obligation(ObligationType::Invoice);
        let at_reminder = deadline() + Duration::hours(24);
        assert_eq!(policy.next_wakeup(&ob, at_reminder), Some(deadline() + Duration::hours(72)));
    }

    #[test]
    fn test_router_prefers_owner_then_type() {
        let lenient: Arc<dyn EscalationPolicy> =
            Arc::new(ThresholdPolicy::new(Duration::days(10), Duration::days(20)));
        let strict: Arc<dyn EscalationPolicy> =
            Arc::new(ThresholdPolicy::new(Duration::hours(1), Duration::hours(2)));
        let default: Arc<dyn EscalationPolicy> =
            Arc::new(ThresholdPolicy::new(Duration::hours(24), Duration::hours(72)));

        let router = PolicyRouter::new(default)
            .with_type_policy(ObligationType::Payment, strict)
            .with_owner_policy(OwnerId::new("vip"), lenient);

        let now = deadline() + Duration::hours(3);

        let payment = obligation(ObligationType::Payment);
        assert_eq!(
            router.decide(&payment, now, payment.overdue_by(now)).kinds(),
            vec![IntentKind::SendReminder, IntentKind::Escalate]
        );

        let mut vip_payment = obligation(ObligationType::Payment);
        vip_payment.owner_id = OwnerId::new("vip");
        assert!(router.decide(&vip_payment, now, vip_payment.overdue_by(now)).is_empty());

        let invoice = obligation(ObligationType::Invoice);
        assert!(router.decide(&invoice, now, invoice.overdue_by(now)).is_empty());
    }
}
