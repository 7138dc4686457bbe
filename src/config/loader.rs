//! Configuration loading from disk and the environment.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::{GuardrailConfig, PulseGuardConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value '{value}' for {var}")]
    Env { var: &'static str, value: String },

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file, applying environment
/// overrides from the process environment.
pub fn load_config(path: &Path) -> Result<PulseGuardConfig, ConfigError> {
    load_config_with(path, |var| std::env::var(var).ok())
}

/// As [`load_config`] with an explicit variable lookup.
pub fn load_config_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PulseGuardConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, lookup)
}

/// Parse, apply overrides, validate.
pub fn parse_config(
    content: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PulseGuardConfig, ConfigError> {
    let mut config: PulseGuardConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config.guardrail, lookup)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Overlay `GUARDRAIL_*` variables onto the guardrail thresholds.
pub fn apply_env_overrides(
    guardrail: &mut GuardrailConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parse<T: std::str::FromStr>(var: &'static str, raw: String) -> Result<T, ConfigError> {
        raw.trim().parse().map_err(|_| ConfigError::Env { var, value: raw })
    }

    if let Some(raw) = lookup("GUARDRAIL_ALERT_RATE_LIMIT") {
        guardrail.alert_rate_limit = parse("GUARDRAIL_ALERT_RATE_LIMIT", raw)?;
    }
    if let Some(raw) = lookup("GUARDRAIL_ALERT_KILL_LIMIT") {
        guardrail.alert_kill_limit = parse("GUARDRAIL_ALERT_KILL_LIMIT", raw)?;
    }
    if let Some(raw) = lookup("GUARDRAIL_ERROR_RATE_WARN") {
        guardrail.error_rate_warn = parse("GUARDRAIL_ERROR_RATE_WARN", raw)?;
    }
    if let Some(raw) = lookup("GUARDRAIL_ERROR_RATE_KILL") {
        guardrail.error_rate_kill = parse("GUARDRAIL_ERROR_RATE_KILL", raw)?;
    }
    if let Some(raw) = lookup("GUARDRAIL_MUTE_DURATION_MIN") {
        guardrail.mute_duration_min = parse("GUARDRAIL_MUTE_DURATION_MIN", raw)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_env_overrides_file_values() {
        let config = parse_config(
            "[guardrail]\nalert_rate_limit = 40\nmute_duration_min = 10\n",
            env(&[("GUARDRAIL_ALERT_RATE_LIMIT", "8"), ("GUARDRAIL_ERROR_RATE_WARN", "0.05")]),
        )
        .unwrap();

        assert_eq!(config.guardrail.alert_rate_limit, 8);
        assert_eq!(config.guardrail.error_rate_warn, 0.05);
        assert_eq!(config.guardrail.mute_duration_min, 10);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let err = parse_config("", env(&[("GUARDRAIL_ERROR_RATE_KILL", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "GUARDRAIL_ERROR_RATE_KILL", .. }));
    }

    #[test]
    fn test_validation_failure_surfaces() {
        let err = parse_config("[guardrail]\nerror_rate_warn = 0.9\n", env(&[])).unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors[0].field, "guardrail.error_rate_warn"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let path = std::env::temp_dir().join("pulse-guard-does-not-exist.toml");
        assert!(matches!(load_config_with(&path, |_| None), Err(ConfigError::Io(_))));
    }
}
