//! Breaker registry.
//!
//! One breaker per service name, created on first use and kept until
//! shutdown. Constructed once at startup and shared by `Arc`.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::resilience::circuit_breaker::{BreakerSettings, BreakerStatus, BreakerTransition, CircuitBreaker};

#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: BreakerSettings,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            breakers: DashMap::new(),
            defaults,
            events,
        }
    }

    /// Return the breaker for `service`, creating it with `settings` (or the
    /// registry defaults) if it does not exist yet. Settings of an existing
    /// breaker are left untouched.
    pub fn get_or_create(&self, service: &str, settings: Option<BreakerSettings>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                tracing::debug!(service = %service, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    service,
                    settings.unwrap_or_else(|| self.defaults.clone()),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| b.clone())
    }

    /// Transitions from every breaker in the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    /// Status of every breaker, sorted by service name.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut out: Vec<_> = self.breakers.iter().map(|b| b.value().status()).collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    pub fn reset_all(&self) {
        for b in self.breakers.iter() {
            b.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_one_breaker_per_service() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("coingecko", None);
        let b = registry.get_or_create(
            "coingecko",
            Some(BreakerSettings::new(1, Duration::from_millis(10))),
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.settings().failure_threshold, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_fans_in_transitions() {
        let registry = CircuitBreakerRegistry::default();
        let mut rx = registry.subscribe();
        registry.get_or_create("telegram", None).force_open();
        registry.get_or_create("goplus", None).force_open();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.service, "telegram");
        assert_eq!(second.service, "goplus");
        assert_eq!(second.to, CircuitState::Open);

        registry.reset_all();
        let statuses = registry.statuses();
        assert_eq!(statuses[0].service, "goplus");
        assert!(statuses.iter().all(|s| s.healthy));
    }
}
