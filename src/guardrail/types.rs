//! Guardrail records, events and thresholds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::schema::GuardrailConfig;
use crate::config::validation::MAX_EFFECT_MINUTES;

/// Mitigation kinds written to the action journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    MuteAlerts,
    KillSwitch,
    BackoffCollectors,
    RollbackTuning,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::MuteAlerts => "MUTE_ALERTS",
            ActionType::KillSwitch => "KILL_SWITCH",
            ActionType::BackoffCollectors => "BACKOFF_COLLECTORS",
            ActionType::RollbackTuning => "ROLLBACK_TUNING",
        }
    }
}

/// One immutable journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailAction {
    pub id: Uuid,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    pub reason: String,
    /// Effect length in minutes, for actions that expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl GuardrailAction {
    pub fn new(action_type: ActionType, timestamp: u64, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            action_type,
            chain: None,
            reason: reason.into(),
            duration: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn for_chain(mut self, chain: &str) -> Self {
        self.chain = Some(chain.to_string());
        self
    }

    pub fn lasting(mut self, minutes: u64) -> Self {
        self.duration = Some(minutes);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// End of the effect window in epoch ms, for expiring actions.
    pub fn expires_at(&self) -> Option<u64> {
        self.duration
            .map(|minutes| self.timestamp.saturating_add(minutes.saturating_mul(60_000)))
    }
}

/// Broadcast to subscribers on every guardrail transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardrailEvent {
    Mute {
        chain: String,
        until_ms: u64,
        action: GuardrailAction,
    },
    MuteExpired {
        chain: String,
    },
    /// `chain` is `None` for the process-wide switch.
    KillSwitch {
        chain: Option<String>,
        action: GuardrailAction,
    },
    KillSwitchReset {
        chain: Option<String>,
    },
    Backoff {
        until_ms: u64,
        action: GuardrailAction,
    },
    BackoffResume,
}

/// Whether an alert for a chain may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AlertDecision {
    Allowed,
    Muted { until_ms: u64 },
    Killed,
}

impl AlertDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AlertDecision::Allowed)
    }
}

/// Per-chain alert counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainMetrics {
    pub chain: String,
    pub alerts_last_hour: usize,
    pub alerts_last_15min: usize,
    pub last_alert_ms: Option<u64>,
    pub mute_until_ms: Option<u64>,
    pub kill_switch_active: bool,
}

/// Process-wide request error counters over the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorMetrics {
    pub total_requests: u64,
    pub error_requests: u64,
    pub error_rate: f64,
    pub backoff_active: bool,
    pub backoff_until_ms: Option<u64>,
    pub kill_switch_active: bool,
}

/// Rule thresholds, swappable at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailThresholds {
    pub alert_rate_limit: u32,
    pub alert_kill_limit: u32,
    pub error_rate_warn: f64,
    pub error_rate_kill: f64,
    pub mute_duration: Duration,
    pub backoff_duration: Duration,
    pub min_error_samples: u64,
}

impl GuardrailThresholds {
    pub fn mute_minutes(&self) -> u64 {
        self.mute_duration.as_secs() / 60
    }

    pub fn backoff_minutes(&self) -> u64 {
        self.backoff_duration.as_secs() / 60
    }
}

impl Default for GuardrailThresholds {
    fn default() -> Self {
        Self::from(&GuardrailConfig::default())
    }
}

/// Minutes to a duration, clamped to the longest effect config validation accepts.
fn effect_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.min(MAX_EFFECT_MINUTES).saturating_mul(60))
}

impl From<&GuardrailConfig> for GuardrailThresholds {
    fn from(config: &GuardrailConfig) -> Self {
        Self {
            alert_rate_limit: config.alert_rate_limit,
            alert_kill_limit: config.alert_kill_limit,
            error_rate_warn: config.error_rate_warn,
            error_rate_kill: config.error_rate_kill,
            mute_duration: effect_duration(config.mute_duration_min),
            backoff_duration: effect_duration(config.backoff_duration_min),
            min_error_samples: config.min_error_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_format() {
        let action = GuardrailAction::new(ActionType::MuteAlerts, 1_700_000_000_000, "alert storm")
            .for_chain("eth")
            .lasting(30)
            .with_metadata(serde_json::json!({ "alerts_last_hour": 15 }));

        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "MUTE_ALERTS");
        assert_eq!(value["chain"], "eth");
        assert_eq!(value["duration"], 30);
        assert_eq!(value["metadata"]["alerts_last_hour"], 15);
        assert_eq!(action.expires_at(), Some(1_700_000_000_000 + 30 * 60_000));

        let back: GuardrailAction = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_global_action_omits_chain() {
        let action = GuardrailAction::new(ActionType::KillSwitch, 1, "manual");
        let json = serde_json::to_string(&action).unwrap();
        assert!(!json.contains("chain"));
        assert!(!json.contains("duration"));
        assert_eq!(action.expires_at(), None);
    }

    #[test]
    fn test_oversized_durations_are_clamped() {
        let config = GuardrailConfig {
            mute_duration_min: u64::MAX,
            backoff_duration_min: MAX_EFFECT_MINUTES * 2,
            ..Default::default()
        };
        let thresholds = GuardrailThresholds::from(&config);
        assert_eq!(thresholds.mute_minutes(), MAX_EFFECT_MINUTES);
        assert_eq!(thresholds.backoff_minutes(), MAX_EFFECT_MINUTES);
        assert_eq!(GuardrailThresholds::from(&GuardrailConfig::default()).mute_minutes(), 30);
    }
}
