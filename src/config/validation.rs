//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, rates within (0, 1])
//! - Check cross-field consistency (warn threshold below kill threshold)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: PulseGuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::{GuardrailConfig, PulseGuardConfig, ServiceConfig};
use crate::resilience::retries::RetryPolicy;

/// One failed check, addressed by its dotted config path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &PulseGuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (name, service) in &config.services {
        validate_service(name, service, &mut errors);
    }
    validate_guardrail(&config.guardrail, &mut errors);

    if config.rate_limiter.block_base_secs == 0 {
        errors.push(ValidationError::new("rate_limiter.block_base_secs", "must be > 0"));
    }
    if config.rate_limiter.block_max_secs < config.rate_limiter.block_base_secs {
        errors.push(ValidationError::new(
            "rate_limiter.block_max_secs",
            "must be >= block_base_secs",
        ));
    }

    let budget = &config.retry_budget;
    if budget.enabled && (budget.ratio < 0.0 || budget.window_secs == 0) {
        errors.push(ValidationError::new(
            "retry_budget",
            "ratio must be >= 0 and window_secs > 0",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if config.admin.enabled {
        if config.admin.api_key.trim().is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "admin.bind_address",
                format!("'{}' is not a socket address", config.admin.bind_address),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_service(name: &str, service: &ServiceConfig, errors: &mut Vec<ValidationError>) {
    let field = |suffix: &str| format!("services.{}.{}", name, suffix);

    if service.circuit_breaker.failure_threshold == 0 {
        errors.push(ValidationError::new(field("circuit_breaker.failure_threshold"), "must be > 0"));
    }
    if service.circuit_breaker.reset_timeout_ms == 0 {
        errors.push(ValidationError::new(field("circuit_breaker.reset_timeout_ms"), "must be > 0"));
    }
    if service.default_timeout_ms == 0 {
        errors.push(ValidationError::new(field("default_timeout_ms"), "must be > 0"));
    }

    let limits = &service.rate_limit;
    if matches!(limits.requests_per_second, Some(r) if !(r > 0.0 && r.is_finite())) {
        errors.push(ValidationError::new(field("rate_limit.requests_per_second"), "must be > 0"));
    }
    if limits.requests_per_minute == Some(0) {
        errors.push(ValidationError::new(field("rate_limit.requests_per_minute"), "must be > 0"));
    }
    if limits.requests_per_hour == Some(0) {
        errors.push(ValidationError::new(field("rate_limit.requests_per_hour"), "must be > 0"));
    }
    if limits.burst_size == Some(0) {
        errors.push(ValidationError::new(field("rate_limit.burst_size"), "must be > 0"));
    }

    let retry = &service.retry;
    if let Some(policy) = &retry.policy {
        if RetryPolicy::named(policy).is_none() {
            errors.push(ValidationError::new(
                field("retry.policy"),
                format!("unknown retry policy '{}'", policy),
            ));
        }
    }
    if retry.max_attempts == Some(0) {
        errors.push(ValidationError::new(field("retry.max_attempts"), "must be > 0"));
    }
    if matches!(retry.backoff_multiplier, Some(m) if m < 1.0) {
        errors.push(ValidationError::new(field("retry.backoff_multiplier"), "must be >= 1.0"));
    }
    let resolved = RetryPolicy::from_config(retry);
    if resolved.base_delay > resolved.max_delay {
        errors.push(ValidationError::new(
            field("retry"),
            "base delay must not exceed max delay",
        ));
    }
}

/// One week.
pub const MAX_EFFECT_MINUTES: u64 = 7 * 24 * 60;

fn validate_guardrail(guardrail: &GuardrailConfig, errors: &mut Vec<ValidationError>) {
    let in_unit_range = |v: f64| v > 0.0 && v <= 1.0;

    if guardrail.alert_rate_limit == 0 {
        errors.push(ValidationError::new("guardrail.alert_rate_limit", "must be > 0"));
    }
    if guardrail.alert_kill_limit == 0 {
        errors.push(ValidationError::new("guardrail.alert_kill_limit", "must be > 0"));
    }
    if !in_unit_range(guardrail.error_rate_warn) {
        errors.push(ValidationError::new("guardrail.error_rate_warn", "must be within (0, 1]"));
    }
    if !in_unit_range(guardrail.error_rate_kill) {
        errors.push(ValidationError::new("guardrail.error_rate_kill", "must be within (0, 1]"));
    }
    if guardrail.error_rate_warn >= guardrail.error_rate_kill {
        errors.push(ValidationError::new(
            "guardrail.error_rate_warn",
            "must be below error_rate_kill",
        ));
    }
    if guardrail.mute_duration_min == 0 || guardrail.mute_duration_min > MAX_EFFECT_MINUTES {
        errors.push(ValidationError::new(
            "guardrail.mute_duration_min",
            format!("must be within 1..={}", MAX_EFFECT_MINUTES),
        ));
    }
    if guardrail.backoff_duration_min == 0 || guardrail.backoff_duration_min > MAX_EFFECT_MINUTES {
        errors.push(ValidationError::new(
            "guardrail.backoff_duration_min",
            format!("must be within 1..={}", MAX_EFFECT_MINUTES),
        ));
    }
    if guardrail.error_bucket_secs == 0 || guardrail.error_bucket_secs > guardrail.error_window_secs {
        errors.push(ValidationError::new(
            "guardrail.error_bucket_secs",
            "must be > 0 and no larger than error_window_secs",
        ));
    }
    if guardrail.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("guardrail.sweep_interval_secs", "must be > 0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&PulseGuardConfig::default()), Ok(()));
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = PulseGuardConfig::default();
        if let Some(rpc) = config.services.get_mut("rpc") {
            rpc.circuit_breaker.failure_threshold = 0;
            rpc.retry.policy = Some("aggressive".into());
        }
        config.guardrail.error_rate_warn = 0.5;
        config.guardrail.error_rate_kill = 0.3;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"services.rpc.circuit_breaker.failure_threshold"));
        assert!(fields.contains(&"services.rpc.retry.policy"));
        assert!(fields.contains(&"guardrail.error_rate_warn"));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_admin_requires_key_when_enabled() {
        let mut config = PulseGuardConfig::default();
        config.admin.enabled = true;
        config.admin.api_key = "  ".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].to_string(), "admin.api_key: must not be empty");
    }

    #[test]
    fn test_effect_durations_are_bounded() {
        let mut config = PulseGuardConfig::default();
        config.guardrail.mute_duration_min = u64::MAX;
        config.guardrail.backoff_duration_min = MAX_EFFECT_MINUTES + 1;
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["guardrail.mute_duration_min", "guardrail.backoff_duration_min"]);
    }
}
