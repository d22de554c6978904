//! Engine configuration.
//!
//! Durations are stored as whole seconds (or milliseconds where noted) so
//! the struct maps directly onto config files and environment variables.

use std::time::Duration;

use obligation_types::ObligationType;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Configuration for the lifecycle and escalation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Time past the deadline before a reminder goes out.
    #[serde(default = "default_reminder_threshold")]
    pub reminder_threshold_secs: u64,

    /// Time past the deadline before the obligation is escalated.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold_secs: u64,

    /// Interval between full store scans that heal missed notifications.
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_secs: u64,

    /// Maximum number of side effects executing at once.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,

    /// Obligation types eligible for an auto-drafted response.
    #[serde(default = "default_auto_draft_types")]
    pub auto_draft_enabled_types: Vec<ObligationType>,

    /// Longest the sweeper sleeps without looking at the queue.
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// Deadline for every store, notifier and drafter call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// How long in-flight dispatches may run after shutdown is requested.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Lifetime of an in-flight idempotency claim.
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,

    /// Delay before an obligation is looked at again after a transient failure.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Attempts per store call before a transient error is surfaced.
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,

    /// Initial backoff between store attempts, doubled each time.
    #[serde(default = "default_store_retry_backoff")]
    pub store_retry_backoff_ms: u64,

    /// Capacity of the sweeper's command channel.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reminder_threshold_secs: default_reminder_threshold(),
            escalation_threshold_secs: default_escalation_threshold(),
            reconciliation_interval_secs: default_reconciliation_interval(),
            dispatch_concurrency: default_dispatch_concurrency(),
            auto_draft_enabled_types: default_auto_draft_types(),
            max_idle_secs: default_max_idle(),
            call_timeout_secs: default_call_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            claim_ttl_secs: default_claim_ttl(),
            retry_delay_secs: default_retry_delay(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_backoff_ms: default_store_retry_backoff(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl EngineConfig {
    pub fn reminder_threshold(&self) -> chrono::Duration {
        secs_to_chrono(self.reminder_threshold_secs)
    }

    pub fn escalation_threshold(&self) -> chrono::Duration {
        secs_to_chrono(self.escalation_threshold_secs)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        secs_to_chrono(self.claim_ttl_secs)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        secs_to_chrono(self.retry_delay_secs)
    }

    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.escalation_threshold_secs < self.reminder_threshold_secs {
            return Err(EngineError::Configuration(format!(
                "escalation_threshold_secs ({}) must not be below reminder_threshold_secs ({})",
                self.escalation_threshold_secs, self.reminder_threshold_secs
            )));
        }
        if self.reconciliation_interval_secs == 0 {
            return Err(EngineError::Configuration(
                "reconciliation_interval_secs must be positive".to_string(),
            ));
        }
        if self.dispatch_concurrency == 0 {
            return Err(EngineError::Configuration(
                "dispatch_concurrency must be positive".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "call_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_idle_secs == 0 {
            return Err(EngineError::Configuration(
                "max_idle_secs must be positive".to_string(),
            ));
        }
        if self.claim_ttl_secs < self.call_timeout_secs {
            return Err(EngineError::Configuration(format!(
                "claim_ttl_secs ({}) must cover call_timeout_secs ({})",
                self.claim_ttl_secs, self.call_timeout_secs
            )));
        }
        if self.store_retry_attempts == 0 {
            return Err(EngineError::Configuration(
                "store_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(EngineError::Configuration(
                "command_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64)
}

// Default value helpers
fn default_reminder_threshold() -> u64 {
    24 * 60 * 60
}

fn default_escalation_threshold() -> u64 {
    72 * 60 * 60
}

fn default_reconciliation_interval() -> u64 {
    60 * 60
}

fn default_dispatch_concurrency() -> usize {
    8
}

fn default_auto_draft_types() -> Vec<ObligationType> {
    vec![ObligationType::FollowUp, ObligationType::Reminder]
}

fn default_max_idle() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    15
}

fn default_claim_ttl() -> u64 {
    300
}

fn default_retry_delay() -> u64 {
    60
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_backoff() -> u64 {
    200
}

fn default_command_buffer() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reminder_threshold(), chrono::Duration::hours(24));
        assert_eq!(config.escalation_threshold(), chrono::Duration::hours(72));
        assert_eq!(config.reconciliation_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_escalation_below_reminder_is_rejected() {
        let config = EngineConfig {
            reminder_threshold_secs: 100,
            escalation_threshold_secs: 50,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = EngineConfig {
            dispatch_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_draft_defaults() {
        let config = EngineConfig::default();
        assert_eq!(
            config.auto_draft_enabled_types,
            vec![ObligationType::FollowUp, ObligationType::Reminder]
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"reminder_threshold_secs": 60, "auto_draft_enabled_types": ["invoice"]}"#)
                .unwrap();
        assert_eq!(config.reminder_threshold_secs, 60);
        assert_eq!(config.escalation_threshold_secs, 72 * 3600);
        assert_eq!(config.auto_draft_enabled_types, vec![ObligationType::Invoice]);
    }
}
