//! Composed call path for one upstream dependency.
//!
//! ```text
//! call(request)
//!     → rate_limit.rs      (admission, fail fast)
//!     → circuit_breaker.rs (admission, records the call's outcome)
//!     → retries.rs         (attempt loop with backoff, each retry re-admitted)
//!     → timeouts.rs        (deadline per attempt)
//!     → request()
//! ```

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::schema::ServiceConfig;
use crate::guardrail::GuardrailController;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{BreakerSettings, BreakerStatus, CircuitBreaker};
use crate::resilience::error::{Classify, ErrorKind, ResilienceError, UpstreamError};
use crate::resilience::rate_limit::{LimiterStatus, RateLimitPolicy, RateLimiter};
use crate::resilience::registry::CircuitBreakerRegistry;
use crate::resilience::retries::{execute_with_retry_gated, RetryBudget, RetryPolicy};
use crate::resilience::timeouts::{with_timeout, TimeoutOptions};

/// Terminal result of one `call`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub service: String,
    /// `success`, or the failing [`ResilienceError::status_label`].
    pub status: &'static str,
    /// Upstream attempts made; zero for rejections.
    pub attempts: u32,
    pub duration: Duration,
}

/// Receives every terminal outcome.
pub trait CallObserver: Send + Sync {
    fn observe(&self, outcome: &CallOutcome);
}

/// Writes outcomes to the metrics recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl CallObserver for MetricsObserver {
    fn observe(&self, outcome: &CallOutcome) {
        metrics::record_call(&outcome.service, outcome.status, outcome.attempts, outcome.duration);
    }
}

/// Health view of one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct CallerStatus {
    pub service: String,
    pub breaker: BreakerStatus,
    pub limiter: Option<LimiterStatus>,
    pub healthy: bool,
}

/// Resilient client for a single service.
pub struct ResilientCaller {
    service: String,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    default_timeout: Duration,
    observer: Arc<dyn CallObserver>,
    guardrail: Option<Arc<GuardrailController>>,
}

impl ResilientCaller {
    pub fn new(
        service: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            breaker,
            limiter,
            retry,
            default_timeout,
            observer: Arc::new(MetricsObserver),
            guardrail: None,
        }
    }

    /// Build from a service section, registering its rate-limit policy and
    /// creating (or reusing) its breaker.
    pub fn from_config(
        service: &str,
        config: &ServiceConfig,
        breakers: &CircuitBreakerRegistry,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        limiter.register(service, RateLimitPolicy::from(&config.rate_limit));
        let breaker = breakers.get_or_create(service, Some(BreakerSettings::from(&config.circuit_breaker)));
        Self::new(
            service,
            breaker,
            limiter,
            RetryPolicy::from_config(&config.retry),
            Duration::from_millis(config.default_timeout_ms),
        )
    }

    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Draw retries from a budget shared with other callers.
    pub fn with_retry_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.retry = self.retry.with_budget(budget);
        self
    }

    /// Report every executed attempt to `guardrail` for error-rate tracking.
    pub fn with_guardrail(mut self, guardrail: Arc<GuardrailController>) -> Self {
        self.guardrail = Some(guardrail);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `request` through the full resilience stack using the default
    /// per-attempt deadline.
    pub async fn call<F, Fut, T>(&self, request: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.call_with_timeout(self.default_timeout, request).await
    }

    /// As [`call`](Self::call) with an explicit per-attempt deadline.
    pub async fn call_with_timeout<F, Fut, T>(&self, timeout: Duration, mut request: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let start = Instant::now();

        if let Err(rejection) = self.limiter.try_acquire(&self.service) {
            return Err(self.finish(ResilienceError::from(rejection), 0, start));
        }

        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => return Err(self.finish(ResilienceError::from(rejection), 0, start)),
        };

        let admit_retry = |attempt: u32| match self.limiter.try_acquire(&self.service) {
            Ok(()) => true,
            Err(rejection) => {
                tracing::debug!(
                    service = %self.service,
                    attempt,
                    reason = rejection.reason.as_str(),
                    "Retry held back by rate limiter"
                );
                false
            }
        };

        let result = execute_with_retry_gated(&self.retry, admit_retry, |_| {
            let fut = request();
            async move {
                let result = match with_timeout(fut, TimeoutOptions::new(self.service.clone(), timeout)).await {
                    Ok(inner) => inner,
                    Err(timeout) => Err(UpstreamError::Timeout(timeout)),
                };
                self.after_attempt(&result);
                result
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                permit.success();
                self.observer.observe(&CallOutcome {
                    service: self.service.clone(),
                    status: "success",
                    attempts: outcome.attempts,
                    duration: start.elapsed(),
                });
                Ok(outcome.value)
            }
            Err(exhausted) => {
                permit.failure(Classify::kind(&exhausted));
                let attempts = exhausted.attempts;
                let err = match exhausted.last_error() {
                    Some(UpstreamError::Timeout(source)) if exhausted.all_timed_out() => ResilienceError::Timeout {
                        source: source.clone(),
                        attempts,
                    },
                    _ => ResilienceError::RetryExhausted(exhausted),
                };
                Err(self.finish(err, attempts, start))
            }
        }
    }

    fn after_attempt<T>(&self, result: &Result<T, UpstreamError>) {
        if let Some(guardrail) = &self.guardrail {
            guardrail.record_request(result.is_ok());
        }
        if let Err(err) = result {
            if err.kind() == ErrorKind::RateLimited {
                self.limiter.handle_429_response(&self.service, err.retry_after());
            }
        }
    }

    fn finish(&self, err: ResilienceError, attempts: u32, start: Instant) -> ResilienceError {
        let outcome = CallOutcome {
            service: self.service.clone(),
            status: err.status_label(),
            attempts,
            duration: start.elapsed(),
        };
        if err.is_rejection() {
            tracing::debug!(service = %self.service, status = outcome.status, error = %err, "Call rejected");
        } else {
            tracing::warn!(
                service = %self.service,
                status = outcome.status,
                attempts,
                duration_ms = outcome.duration.as_millis() as u64,
                error = %err,
                "Upstream call failed"
            );
        }
        self.observer.observe(&outcome);
        err
    }

    pub fn status(&self) -> CallerStatus {
        let breaker = self.breaker.status();
        let limiter = self.limiter.status(&self.service);
        let healthy = breaker.healthy && limiter.as_ref().map_or(true, |l| l.blocked_for_ms.is_none());
        CallerStatus {
            service: self.service.clone(),
            breaker,
            limiter,
            healthy,
        }
    }
}

impl std::fmt::Debug for ResilientCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCaller")
            .field("service", &self.service)
            .field("retry", &self.retry)
            .field("default_timeout", &self.default_timeout)
            .field("guardrail", &self.guardrail.is_some())
            .finish()
    }
}
