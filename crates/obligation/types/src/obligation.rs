//! The obligation record and its enumerations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LifecycleError, LifecycleResult};
use crate::intent::IntentKind;
use crate::{ObligationId, OwnerId};

/// Lifecycle status of an obligation. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Overdue,
    Cancelled,
}

impl ObligationStatus {
    /// Terminal states never transition again and never fire side effects.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObligationStatus::Completed | ObligationStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Pending => "pending",
            ObligationStatus::InProgress => "in_progress",
            ObligationStatus::Completed => "completed",
            ObligationStatus::Overdue => "overdue",
            ObligationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of business obligation this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObligationType {
    Invoice,
    Reorder,
    Payment,
    #[serde(rename = "followup", alias = "follow_up", alias = "follow-up")]
    FollowUp,
    Delivery,
    Reminder,
    #[default]
    Other,
}

impl ObligationType {
    pub const ALL: [ObligationType; 7] = [
        ObligationType::Invoice,
        ObligationType::Reorder,
        ObligationType::Payment,
        ObligationType::FollowUp,
        ObligationType::Delivery,
        ObligationType::Reminder,
        ObligationType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationType::Invoice => "invoice",
            ObligationType::Reorder => "reorder",
            ObligationType::Payment => "payment",
            ObligationType::FollowUp => "followup",
            ObligationType::Delivery => "delivery",
            ObligationType::Reminder => "reminder",
            ObligationType::Other => "other",
        }
    }
}

impl fmt::Display for ObligationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown obligation type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown obligation type: {0}")]
pub struct UnknownObligationType(pub String);

impl FromStr for ObligationType {
    type Err = UnknownObligationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invoice" => Ok(ObligationType::Invoice),
            "reorder" => Ok(ObligationType::Reorder),
            "payment" => Ok(ObligationType::Payment),
            "followup" | "follow_up" | "follow-up" => Ok(ObligationType::FollowUp),
            "delivery" => Ok(ObligationType::Delivery),
            "reminder" => Ok(ObligationType::Reminder),
            "other" => Ok(ObligationType::Other),
            other => Err(UnknownObligationType(other.to_string())),
        }
    }
}

/// Contact details for the other party of an obligation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counterparty {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Counterparty {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Whether there is any channel to reach the counterparty on.
    pub fn is_reachable(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
            || self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }

    /// Best label for messages: name, then email, then phone.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .or(self.phone.as_deref())
            .unwrap_or("counterparty")
    }
}

/// A side effect that failed permanently and now waits for a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualReview {
    pub kind: IntentKind,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

/// A tracked commitment with a deadline and a counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    pub id: ObligationId,
    pub owner_id: OwnerId,

    pub action: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub obligation_type: ObligationType,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub status: ObligationStatus,
    #[serde(default)]
    pub counterparty: Counterparty,

    /// Channel the obligation was extracted from (email, whatsapp, ...).
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_message_id: Option<String>,

    #[serde(default)]
    pub reminder_sent: bool,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub auto_drafted: bool,
    #[serde(default)]
    pub draft_content: Option<String>,
    #[serde(default)]
    pub manual_review: Vec<ManualReview>,

    /// Optimistic concurrency token, bumped by the store on every save.
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Obligation {
    /// Create a pending obligation, as the ingestion collaborator does at extraction time.
    pub fn new(
        owner_id: OwnerId,
        action: impl Into<String>,
        obligation_type: ObligationType,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ObligationId::generate(),
            owner_id,
            action: action.into(),
            description: None,
            obligation_type,
            deadline,
            status: ObligationStatus::Pending,
            counterparty: Counterparty::default(),
            source: None,
            source_message_id: None,
            reminder_sent: false,
            escalated: false,
            auto_drafted: false,
            draft_content: None,
            manual_review: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_counterparty(mut self, counterparty: Counterparty) -> Self {
        self.counterparty = counterparty;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>, message_id: Option<String>) -> Self {
        self.source = Some(source.into());
        self.source_message_id = message_id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Logical overdue-ness, independent of whether the status was rewritten yet.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now > self.deadline
    }

    /// How far past the deadline `now` is. Negative before the deadline.
    pub fn overdue_by(&self, now: DateTime<Utc>) -> Duration {
        now - self.deadline
    }

    /// Whether the flag for `kind` is already set.
    pub fn flag_set(&self, kind: IntentKind) -> bool {
        match kind {
            IntentKind::SendReminder => self.reminder_sent,
            IntentKind::Escalate => self.escalated,
            IntentKind::AttemptAutoDraft => self.auto_drafted,
        }
    }

    /// Whether `kind` has been parked for manual review.
    pub fn is_held(&self, kind: IntentKind) -> bool {
        self.manual_review.iter().any(|r| r.kind == kind)
    }

    pub fn record_reminder_sent(&mut self, now: DateTime<Utc>) {
        self.reminder_sent = true;
        self.updated_at = now;
    }

    pub fn record_escalated(&mut self, now: DateTime<Utc>) {
        self.escalated = true;
        self.updated_at = now;
    }

    pub fn record_auto_draft(&mut self, content: impl Into<String>, now: DateTime<Utc>) {
        self.auto_drafted = true;
        self.draft_content = Some(content.into());
        self.updated_at = now;
    }

    /// Set the flag for `kind`. Draft content is only applied for auto-drafts.
    pub fn record_side_effect(
        &mut self,
        kind: IntentKind,
        payload: Option<&str>,
        now: DateTime<Utc>,
    ) {
        match kind {
            IntentKind::SendReminder => self.record_reminder_sent(now),
            IntentKind::Escalate => self.record_escalated(now),
            IntentKind::AttemptAutoDraft => {
                self.record_auto_draft(payload.unwrap_or_default(), now)
            }
        }
    }

    /// Park `kind` for manual review. Idempotent per kind.
    pub fn flag_for_review(&mut self, kind: IntentKind, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.is_held(kind) {
            return;
        }
        self.manual_review.push(ManualReview {
            kind,
            reason: reason.into(),
            flagged_at: now,
        });
        self.updated_at = now;
    }

    /// OR in the side-effect flags of another copy of the same record.
    ///
    /// Used when a save lost a race: flags are monotonic, so the union is
    /// always the correct merge.
    pub fn merge_flags(&mut self, other: &Obligation) {
        self.reminder_sent |= other.reminder_sent;
        self.escalated |= other.escalated;
        if other.auto_drafted && !self.auto_drafted {
            self.auto_drafted = true;
            self.draft_content = other.draft_content.clone();
        }
        for review in &other.manual_review {
            if !self.is_held(review.kind) {
                self.manual_review.push(review.clone());
            }
        }
    }

    /// Check the structural invariants of the record.
    pub fn check_invariants(&self) -> LifecycleResult<()> {
        let completed = self.status == ObligationStatus::Completed;
        match (completed, self.completed_at.is_some()) {
            (true, false) => Err(LifecycleError::InvariantViolation {
                id: self.id,
                detail: "status is completed but completed_at is unset".to_string(),
            }),
            (false, true) => Err(LifecycleError::InvariantViolation {
                id: self.id,
                detail: format!("completed_at is set but status is {}", self.status),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn sample() -> Obligation {
        Obligation::new(
            OwnerId::new("u1"),
            "Send invoice to Acme",
            ObligationType::Invoice,
            t0() + Duration::days(2),
            t0(),
        )
    }

    #[test]
    fn test_new_obligation_is_pending() {
        let ob = sample();
        assert_eq!(ob.status, ObligationStatus::Pending);
        assert!(ob.completed_at.is_none());
        assert!(ob.check_invariants().is_ok());
    }

    #[test]
    fn test_is_overdue_ignores_stored_status() {
        let ob = sample();
        assert!(!ob.is_overdue(ob.deadline));
        assert!(ob.is_overdue(ob.deadline + Duration::seconds(1)));
    }

    #[test]
    fn test_terminal_obligations_are_never_overdue() {
        let mut ob = sample();
        ob.status = ObligationStatus::Cancelled;
        assert!(!ob.is_overdue(ob.deadline + Duration::days(30)));
    }

    #[test]
    fn test_invariants_detect_missing_completed_at() {
        let mut ob = sample();
        ob.status = ObligationStatus::Completed;
        assert!(matches!(
            ob.check_invariants(),
            Err(LifecycleError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_merge_flags_is_a_union() {
        let mut a = sample();
        let mut b = a.clone();
        a.record_reminder_sent(t0());
        b.record_auto_draft("Hello", t0());

        a.merge_flags(&b);
        assert!(a.reminder_sent);
        assert!(a.auto_drafted);
        assert_eq!(a.draft_content.as_deref(), Some("Hello"));
        assert!(!a.escalated);
    }

    #[test]
    fn test_flag_for_review_is_idempotent() {
        let mut ob = sample();
        ob.flag_for_review(IntentKind::Escalate, "bounced", t0());
        ob.flag_for_review(IntentKind::Escalate, "bounced again", t0());
        assert_eq!(ob.manual_review.len(), 1);
        assert!(ob.is_held(IntentKind::Escalate));
        assert!(!ob.is_held(IntentKind::SendReminder));
    }

    #[test]
    fn test_type_parsing_accepts_source_spellings() {
        assert_eq!("followup".parse::<ObligationType>().unwrap(), ObligationType::FollowUp);
        assert_eq!("Follow-Up".parse::<ObligationType>().unwrap(), ObligationType::FollowUp);
        assert!("gift".parse::<ObligationType>().is_err());
    }

    #[test]
    fn test_serde_uses_source_strings() {
        let json = serde_json::to_string(&ObligationType::FollowUp).unwrap();
        assert_eq!(json, "\"followup\"");
        let status: ObligationStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(status, ObligationStatus::InProgress);
    }

    #[test]
    fn test_counterparty_reachability() {
        assert!(!Counterparty::named("Bob").is_reachable());
        assert!(Counterparty::named("Bob").with_email("bob@example.com").is_reachable());
        assert_eq!(Counterparty::default().display_name(), "counterparty");
    }
}
