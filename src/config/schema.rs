//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resilience::error::ErrorKind;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PulseGuardConfig {
    /// Per-dependency resilience settings, keyed by service name.
    pub services: BTreeMap<String, ServiceConfig>,

    /// Limiter-wide 429 handling.
    pub rate_limiter: RateLimiterSettings,

    /// Shared retry budget across all services.
    pub retry_budget: RetryBudgetConfig,

    /// Guardrail thresholds and sweep settings.
    pub guardrail: GuardrailConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

impl Default for PulseGuardConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            rate_limiter: RateLimiterSettings::default(),
            retry_budget: RetryBudgetConfig::default(),
            guardrail: GuardrailConfig::default(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

/// Resilience settings for one upstream dependency.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,

    /// Per-attempt deadline in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            default_timeout_ms: 10_000,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive non-expected failures before opening.
    pub failure_threshold: u32,

    /// Time spent open before a trial call, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Error kinds that are recorded but never trip the breaker.
    pub expected_errors: Vec<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            expected_errors: Vec::new(),
        }
    }
}

/// Upstream quota for one service. Unset fields impose no limit.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Token refill rate. Enables the token bucket when set.
    pub requests_per_second: Option<f64>,

    /// Sliding one-minute request cap.
    pub requests_per_minute: Option<u32>,

    /// Sliding one-hour request cap.
    pub requests_per_hour: Option<u32>,

    /// Bucket capacity (default: ceil of requests_per_second).
    pub burst_size: Option<u32>,
}

/// Retry configuration. `policy` names a preset (`standard`,
/// `quota_limited`, `fast`, `notification`); other fields override it.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub policy: Option<String>,

    /// Total attempts including the first.
    pub max_attempts: Option<u32>,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: Option<u64>,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: Option<u64>,

    pub backoff_multiplier: Option<f64>,

    /// Perturb delays by ±25%.
    pub jitter: Option<bool>,
}

/// Retry budget shared by every caller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryBudgetConfig {
    pub enabled: bool,

    /// Share of requests that may be retried per window.
    /// e.g., 0.2 for a 20% budget.
    pub ratio: f64,

    /// Retries always allowed per window regardless of volume.
    pub min_retries: u32,

    pub window_secs: u64,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ratio: 0.2,
            min_retries: 10,
            window_secs: 10,
        }
    }
}

/// Rate limiter behavior shared by all services.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    /// Block applied after a 429 without `Retry-After`, doubled per recent block.
    pub block_base_secs: u64,

    /// Upper bound on an adaptive block.
    pub block_max_secs: u64,

    /// Polling interval for `wait_for_availability`.
    pub poll_interval_ms: u64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            block_base_secs: 30,
            block_max_secs: 600,
            poll_interval_ms: 100,
        }
    }
}

/// Guardrail thresholds. Environment variables override the file values.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Alerts per chain per hour before muting (`GUARDRAIL_ALERT_RATE_LIMIT`).
    pub alert_rate_limit: u32,

    /// Alerts per chain per 15 minutes before the chain kill switch
    /// (`GUARDRAIL_ALERT_KILL_LIMIT`).
    pub alert_kill_limit: u32,

    /// Error rate that backs off collectors (`GUARDRAIL_ERROR_RATE_WARN`).
    pub error_rate_warn: f64,

    /// Error rate that triggers the global kill switch (`GUARDRAIL_ERROR_RATE_KILL`).
    pub error_rate_kill: f64,

    /// Mute length in minutes (`GUARDRAIL_MUTE_DURATION_MIN`).
    pub mute_duration_min: u64,

    /// Collector backoff length in minutes.
    pub backoff_duration_min: u64,

    /// Trailing window for the error rate.
    pub error_window_secs: u64,

    /// Bucket width inside the error window.
    pub error_bucket_secs: u64,

    /// Requests required in the window before error rules apply.
    pub min_error_samples: u64,

    /// Interval between guardrail sweeps.
    pub sweep_interval_secs: u64,

    /// Append-only action journal (JSON lines). Disabled when unset.
    pub journal_path: Option<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            alert_rate_limit: 15,
            alert_kill_limit: 25,
            error_rate_warn: 0.10,
            error_rate_kill: 0.20,
            mute_duration_min: 30,
            backoff_duration_min: 60,
            error_window_secs: 300,
            error_bucket_secs: 10,
            min_error_samples: 10,
            sweep_interval_secs: 60,
            journal_path: Some("data/guardrail_actions.jsonl".to_string()),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

fn service(
    breaker: CircuitBreakerConfig,
    rate_limit: RateLimitConfig,
    policy: &str,
    default_timeout_ms: u64,
) -> ServiceConfig {
    ServiceConfig {
        circuit_breaker: breaker,
        rate_limit,
        retry: RetryConfig {
            policy: Some(policy.to_string()),
            ..Default::default()
        },
        default_timeout_ms,
    }
}

/// Built-in provider profiles.
fn default_services() -> BTreeMap<String, ServiceConfig> {
    let throttling_expected = || CircuitBreakerConfig {
        expected_errors: vec![ErrorKind::RateLimited],
        ..Default::default()
    };

    let mut services = BTreeMap::new();
    services.insert(
        "dexscreener".to_string(),
        service(
            throttling_expected(),
            RateLimitConfig {
                requests_per_minute: Some(300),
                ..Default::default()
            },
            "standard",
            10_000,
        ),
    );
    services.insert(
        "goplus".to_string(),
        service(
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout_ms: 120_000,
                expected_errors: vec![ErrorKind::RateLimited],
            },
            RateLimitConfig {
                requests_per_minute: Some(30),
                ..Default::default()
            },
            "quota_limited",
            15_000,
        ),
    );
    services.insert(
        "coingecko".to_string(),
        service(
            throttling_expected(),
            RateLimitConfig {
                requests_per_minute: Some(30),
                requests_per_hour: Some(1_000),
                ..Default::default()
            },
            "quota_limited",
            10_000,
        ),
    );
    services.insert(
        "telegram".to_string(),
        service(
            CircuitBreakerConfig {
                failure_threshold: 10,
                reset_timeout_ms: 30_000,
                expected_errors: vec![ErrorKind::RateLimited],
            },
            RateLimitConfig {
                requests_per_second: Some(1.0),
                requests_per_minute: Some(20),
                burst_size: Some(5),
                ..Default::default()
            },
            "notification",
            10_000,
        ),
    );
    services.insert(
        "rpc".to_string(),
        service(
            CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout_ms: 30_000,
                expected_errors: vec![ErrorKind::RateLimited, ErrorKind::Timeout],
            },
            RateLimitConfig {
                requests_per_second: Some(10.0),
                burst_size: Some(20),
                ..Default::default()
            },
            "fast",
            5_000,
        ),
    );
    services
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_known_providers() {
        let config = PulseGuardConfig::default();
        let names: Vec<_> = config.services.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["coingecko", "dexscreener", "goplus", "rpc", "telegram"]);
        assert_eq!(config.guardrail.alert_rate_limit, 15);
        assert_eq!(config.guardrail.error_rate_kill, 0.20);
    }

    #[test]
    fn test_partial_service_section_fills_defaults() {
        let config: PulseGuardConfig = toml::from_str(
            r#"
            [services.birdeye]
            default_timeout_ms = 2500

            [services.birdeye.circuit_breaker]
            failure_threshold = 2
            expected_errors = ["rate_limited", "timeout"]

            [services.birdeye.rate_limit]
            requests_per_minute = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.services.len(), 1);
        let birdeye = &config.services["birdeye"];
        assert_eq!(birdeye.default_timeout_ms, 2500);
        assert_eq!(birdeye.circuit_breaker.failure_threshold, 2);
        assert_eq!(birdeye.circuit_breaker.reset_timeout_ms, 60_000);
        assert_eq!(
            birdeye.circuit_breaker.expected_errors,
            vec![ErrorKind::RateLimited, ErrorKind::Timeout]
        );
        assert_eq!(birdeye.rate_limit.requests_per_minute, Some(60));
        assert!(birdeye.retry.policy.is_none());
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }
}
