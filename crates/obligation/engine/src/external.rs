//! External notifier and drafter seams.

use async_trait::async_trait;
use obligation_types::{Counterparty, Intent, IntentContext, IntentKind, OwnerId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExternalResult;

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    Counterparty(Counterparty),
    Owner(OwnerId),
}

impl Recipient {
    /// Reminders go to the counterparty when they can be reached, escalations
    /// always go to the owner.
    pub fn for_intent(intent: &Intent) -> Self {
        let context = &intent.context;
        match intent.kind {
            IntentKind::SendReminder if context.counterparty.is_reachable() => {
                Recipient::Counterparty(context.counterparty.clone())
            }
            _ => Recipient::Owner(context.owner_id.clone()),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Counterparty(c) => write!(f, "counterparty:{}", c.display_name()),
            Recipient::Owner(owner) => write!(f, "{}", owner),
        }
    }
}

/// A rendered message ready for a notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: IntentKind,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn for_intent(intent: &Intent) -> Self {
        let context = &intent.context;
        let overdue_hours = context.overdue_by().num_hours();
        let (subject, body) = match intent.kind {
            IntentKind::SendReminder => (
                format!("Reminder: {}", context.action),
                format!(
                    "Hi {},\n\nThis is a reminder about \"{}\", which was due on {}.\n",
                    context.counterparty.display_name(),
                    context.action,
                    context.deadline.format("%Y-%m-%d %H:%M UTC"),
                ),
            ),
            IntentKind::Escalate => (
                format!("Escalation: {} is {}h overdue", context.action, overdue_hours),
                format!(
                    "\"{}\" ({}) with {} was due on {} and is now {} hours overdue.\n",
                    context.action,
                    context.obligation_type,
                    context.counterparty.display_name(),
                    context.deadline.format("%Y-%m-%d %H:%M UTC"),
                    overdue_hours,
                ),
            ),
            IntentKind::AttemptAutoDraft => (
                format!("Draft ready: {}", context.action),
                format!("A draft reply for \"{}\" is ready for review.\n", context.action),
            ),
        };
        Self {
            kind: intent.kind,
            subject,
            body,
        }
    }
}

/// Delivers reminder and escalation messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &Recipient, notification: &Notification) -> ExternalResult<()>;
}

/// Produces draft replies for an obligation.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft(&self, context: &IntentContext) -> ExternalResult<String>;
}

/// Notifier that only logs. The daemon's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, recipient: &Recipient, notification: &Notification) -> ExternalResult<()> {
        info!(
            recipient = %recipient,
            kind = %notification.kind,
            subject = %notification.subject,
            "Notification delivered"
        );
        Ok(())
    }
}

/// Deterministic drafter built from the obligation's own fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateDrafter;

#[async_trait]
impl Drafter for TemplateDrafter {
    async fn draft(&self, context: &IntentContext) -> ExternalResult<String> {
        let mut draft = format!(
            "Hi {},\n\nFollowing up on \"{}\", originally due {}.",
            context.counterparty.display_name(),
            context.action,
            context.deadline.format("%Y-%m-%d"),
        );
        if let Some(description) = context.description.as_deref().filter(|d| !d.trim().is_empty()) {
            draft.push_str("\n\n");
            draft.push_str(description.trim());
        }
        draft.push_str("\n\nCould you let me know where things stand?\n\nThanks");
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use obligation_types::{Obligation, ObligationType};

    fn obligation(counterparty: Counterparty) -> Obligation {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
        Obligation::new(OwnerId::new("u7"), "Confirm delivery slot", ObligationType::FollowUp, t0, t0)
            .with_counterparty(counterparty)
            .with_description("Warehouse needs a 2h window.")
    }

    #[test]
    fn test_reminder_goes_to_reachable_counterparty() {
        let ob = obligation(Counterparty::named("Dana").with_email("dana@example.com"));
        let intent = Intent::new(IntentKind::SendReminder, &ob, ob.deadline + Duration::hours(25));
        assert!(matches!(Recipient::for_intent(&intent), Recipient::Counterparty(_)));
    }

    #[test]
    fn test_unreachable_counterparty_falls_back_to_owner() {
        let ob = obligation(Counterparty::named("Dana"));
        let intent = Intent::new(IntentKind::SendReminder, &ob, ob.deadline + Duration::hours(25));
        assert_eq!(Recipient::for_intent(&intent), Recipient::Owner(OwnerId::new("u7")));
    }

    #[test]
    fn test_escalation_goes_to_owner() {
        let ob = obligation(Counterparty::named("Dana").with_email("dana@example.com"));
        let intent = Intent::new(IntentKind::Escalate, &ob, ob.deadline + Duration::hours(73));
        assert_eq!(Recipient::for_intent(&intent), Recipient::Owner(OwnerId::new("u7")));
        let notification = Notification::for_intent(&intent);
        assert!(notification.subject.contains("73h overdue"));
    }

    #[tokio::test]
    async fn test_template_drafter_includes_description() {
        let ob = obligation(Counterparty::named("Dana"));
        let context = IntentContext::from_obligation(&ob, ob.deadline);
        let draft = TemplateDrafter.draft(&context).await.unwrap();
        assert!(draft.starts_with("Hi Dana"));
        assert!(draft.contains("Confirm delivery slot"));
        assert!(draft.contains("2h window"));
    }
}
