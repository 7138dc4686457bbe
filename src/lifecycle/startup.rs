//! Startup assembly.
//!
//! Builds the shared components from a validated configuration in
//! dependency order: journal, guardrail, limiter, breakers, callers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::PulseGuardConfig;
use crate::guardrail::{ActionJournal, FileJournal, GuardrailController, GuardrailThresholds, JournalError, MemoryJournal};
use crate::resilience::caller::ResilientCaller;
use crate::resilience::circuit_breaker::BreakerSettings;
use crate::resilience::rate_limit::RateLimiter;
use crate::resilience::registry::CircuitBreakerRegistry;
use crate::resilience::retries::RetryBudget;

/// Everything the daemon and the admin API share.
#[derive(Debug)]
pub struct GuardServices {
    pub config: Arc<PulseGuardConfig>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub guardrail: Arc<GuardrailController>,
    callers: BTreeMap<String, Arc<ResilientCaller>>,
}

impl GuardServices {
    /// Build with the journal named by `guardrail.journal_path`, or an
    /// in-memory journal when unset.
    pub fn build(config: PulseGuardConfig) -> Result<Self, JournalError> {
        let journal: Arc<dyn ActionJournal> = match &config.guardrail.journal_path {
            Some(path) => Arc::new(FileJournal::open(path)?),
            None => Arc::new(MemoryJournal::new()),
        };
        Ok(Self::with_journal(config, journal))
    }

    pub fn with_journal(config: PulseGuardConfig, journal: Arc<dyn ActionJournal>) -> Self {
        let guardrail = Arc::new(GuardrailController::new(&config.guardrail, journal));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limiter));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerSettings::default()));

        let budget = config.retry_budget.enabled.then(|| {
            Arc::new(RetryBudget::new(
                config.retry_budget.ratio,
                config.retry_budget.min_retries,
                Duration::from_secs(config.retry_budget.window_secs),
            ))
        });

        let callers = config
            .services
            .iter()
            .map(|(name, service)| {
                let mut caller = ResilientCaller::from_config(name, service, &breakers, limiter.clone())
                    .with_guardrail(guardrail.clone());
                if let Some(budget) = &budget {
                    caller = caller.with_retry_budget(budget.clone());
                }
                (name.clone(), Arc::new(caller))
            })
            .collect::<BTreeMap<_, _>>();

        tracing::info!(
            services = callers.len(),
            retry_budget = budget.is_some(),
            "Resilience components initialized"
        );

        Self {
            config: Arc::new(config),
            breakers,
            limiter,
            guardrail,
            callers,
        }
    }

    /// Caller for a configured service.
    pub fn caller(&self, service: &str) -> Option<Arc<ResilientCaller>> {
        self.callers.get(service).cloned()
    }

    pub fn callers(&self) -> impl Iterator<Item = &Arc<ResilientCaller>> {
        self.callers.values()
    }

    /// Apply a reloaded configuration. Guardrail thresholds swap in place;
    /// per-service changes take effect on restart.
    pub fn apply_reload(&self, new: &PulseGuardConfig) {
        self.guardrail
            .update_thresholds(GuardrailThresholds::from(&new.guardrail));

        if new.services != self.config.services {
            tracing::warn!("Service resilience settings changed; restart to apply them");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builds_one_caller_per_service() {
        let mut config = PulseGuardConfig::default();
        config.guardrail.journal_path = None;
        let services = GuardServices::build(config).unwrap();

        assert_eq!(services.callers().count(), 5);
        let goplus = services.caller("goplus").unwrap();
        assert_eq!(goplus.breaker().settings().failure_threshold, 3);
        assert_eq!(goplus.default_timeout(), Duration::from_millis(15_000));
        assert!(services.limiter.status("goplus").is_some());
        assert_eq!(services.breakers.len(), 5);
        assert!(services.caller("unknown").is_none());
    }

    #[tokio::test]
    async fn test_reload_swaps_guardrail_thresholds() {
        let mut config = PulseGuardConfig::default();
        config.guardrail.journal_path = None;
        let services = GuardServices::build(config.clone()).unwrap();

        config.guardrail.alert_rate_limit = 3;
        services.apply_reload(&config);
        assert_eq!(services.guardrail.thresholds().alert_rate_limit, 3);
    }
}
