//! Side-effect intents emitted by policy evaluation.
//!
//! An intent is a proposal, not an action: the dispatcher decides whether
//! it actually runs, at most once per (obligation, kind, epoch).

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Counterparty, Obligation, ObligationId, ObligationType, OwnerId};

/// The three kinds of side effect the engine may trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    SendReminder,
    Escalate,
    AttemptAutoDraft,
}

impl IntentKind {
    pub const ALL: [IntentKind; 3] = [
        IntentKind::SendReminder,
        IntentKind::Escalate,
        IntentKind::AttemptAutoDraft,
    ];

    /// The idempotency window this kind fires in at `now`.
    ///
    /// Reminders are bounded per calendar day (UTC); escalation and
    /// auto-drafting are single-shot.
    pub fn epoch_at(&self, now: DateTime<Utc>) -> Epoch {
        match self {
            IntentKind::SendReminder => Epoch::Day(now.date_naive()),
            IntentKind::Escalate | IntentKind::AttemptAutoDraft => Epoch::Once,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::SendReminder => "send_reminder",
            IntentKind::Escalate => "escalate",
            IntentKind::AttemptAutoDraft => "attempt_auto_draft",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time window within which an intent kind may fire at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Epoch {
    Day(NaiveDate),
    Once,
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Epoch::Day(day) => write!(f, "{}", day),
            Epoch::Once => f.write_str("once"),
        }
    }
}

/// Everything the dispatcher needs to act without re-reading the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentContext {
    pub obligation_id: ObligationId,
    pub owner_id: OwnerId,
    pub action: String,
    pub description: Option<String>,
    pub obligation_type: ObligationType,
    pub deadline: DateTime<Utc>,
    pub counterparty: Counterparty,
    /// How far past the deadline the obligation was when the intent was emitted.
    pub overdue_by_secs: i64,
}

impl IntentContext {
    pub fn from_obligation(obligation: &Obligation, now: DateTime<Utc>) -> Self {
        Self {
            obligation_id: obligation.id,
            owner_id: obligation.owner_id.clone(),
            action: obligation.action.clone(),
            description: obligation.description.clone(),
            obligation_type: obligation.obligation_type,
            deadline: obligation.deadline,
            counterparty: obligation.counterparty.clone(),
            overdue_by_secs: obligation.overdue_by(now).num_seconds(),
        }
    }

    pub fn overdue_by(&self) -> Duration {
        Duration::seconds(self.overdue_by_secs)
    }
}

/// A proposed side effect, not yet executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub context: IntentContext,
    pub emitted_at: DateTime<Utc>,
}

impl Intent {
    pub fn new(kind: IntentKind, obligation: &Obligation, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            context: IntentContext::from_obligation(obligation, now),
            emitted_at: now,
        }
    }

    pub fn obligation_id(&self) -> ObligationId {
        self.context.obligation_id
    }

    pub fn epoch(&self) -> Epoch {
        self.kind.epoch_at(self.emitted_at)
    }
}

/// A set of intents with at most one intent per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentSet {
    intents: Vec<Intent>,
}

impl IntentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an intent; a second intent of the same kind is ignored.
    pub fn insert(&mut self, intent: Intent) -> bool {
        if self.contains(intent.kind) {
            return false;
        }
        self.intents.push(intent);
        true
    }

    pub fn contains(&self, kind: IntentKind) -> bool {
        self.intents.iter().any(|i| i.kind == kind)
    }

    pub fn kinds(&self) -> Vec<IntentKind> {
        self.intents.iter().map(|i| i.kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Intent> {
        self.intents.iter()
    }
}

impl IntoIterator for IntentSet {
    type Item = Intent;
    type IntoIter = std::vec::IntoIter<Intent>;

    fn into_iter(self) -> Self::IntoIter {
        self.intents.into_iter()
    }
}

impl FromIterator<Intent> for IntentSet {
    fn from_iter<I: IntoIterator<Item = Intent>>(iter: I) -> Self {
        let mut set = IntentSet::new();
        for intent in iter {
            set.insert(intent);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obligation() -> Obligation {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        Obligation::new(OwnerId::new("u1"), "Chase payment", ObligationType::Payment, t0, t0)
    }

    #[test]
    fn test_reminder_epoch_is_calendar_day() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 3, 2, 23, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2024, 3, 3, 0, 30, 0).unwrap();

        let kind = IntentKind::SendReminder;
        assert_eq!(kind.epoch_at(morning), kind.epoch_at(evening));
        assert_ne!(kind.epoch_at(evening), kind.epoch_at(next_day));
    }

    #[test]
    fn test_escalation_epoch_is_single_shot() {
        let a = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(IntentKind::Escalate.epoch_at(a), IntentKind::Escalate.epoch_at(b));
        assert_eq!(IntentKind::Escalate.epoch_at(a), Epoch::Once);
    }

    #[test]
    fn test_intent_set_keeps_one_per_kind() {
        let ob = obligation();
        let now = ob.deadline + Duration::hours(30);
        let mut set = IntentSet::new();
        assert!(set.insert(Intent::new(IntentKind::SendReminder, &ob, now)));
        assert!(!set.insert(Intent::new(IntentKind::SendReminder, &ob, now)));
        assert!(set.insert(Intent::new(IntentKind::Escalate, &ob, now)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.kinds(), vec![IntentKind::SendReminder, IntentKind::Escalate]);
    }

    #[test]
    fn test_context_records_overdue_duration() {
        let ob = obligation();
        let intent = Intent::new(IntentKind::Escalate, &ob, ob.deadline + Duration::hours(73));
        assert_eq!(intent.context.overdue_by(), Duration::hours(73));
        assert_eq!(intent.obligation_id(), ob.id);
    }
}
