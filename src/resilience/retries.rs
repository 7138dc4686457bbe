//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed attempt is worth repeating
//! - Execute retries with exponential backoff + jitter
//! - Enforce a retry budget (retries as a share of requests per window)
//!
//! # Design Decisions
//! - Every attempt's error is kept; exhaustion reports all of them
//! - Rejections from the rate limiter or breaker never reach this layer
//! - Jittered backoff prevents thundering herd
//! - Retry budget prevents retry storms under load

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::schema::RetryConfig;
use crate::resilience::backoff::{apply_jitter, calculate_delay};
use crate::resilience::error::{RetryExhaustedError, UpstreamError};

/// Predicate deciding whether an attempt's error is retryable.
pub type RetryCondition = Arc<dyn Fn(&UpstreamError) -> bool + Send + Sync>;

/// Callback run before each retry with the failed attempt's error and number.
pub type RetryHook = Arc<dyn Fn(&UpstreamError, u32) + Send + Sync>;

/// Retry settings for one dependency.
#[derive(Clone)]
pub struct RetryPolicy {
    pub name: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    retry_condition: RetryCondition,
    on_retry: Option<RetryHook>,
    budget: Option<Arc<RetryBudget>>,
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: true,
            retry_condition: Arc::new(UpstreamError::is_transient),
            on_retry: None,
            budget: None,
        }
    }

    /// General-purpose providers.
    pub fn standard() -> Self {
        Self::new("standard", 3, Duration::from_millis(1000), Duration::from_millis(30_000))
    }

    /// Strictly quota-limited providers: fewer, shorter retries.
    pub fn quota_limited() -> Self {
        Self::new("quota_limited", 2, Duration::from_millis(500), Duration::from_millis(2000))
    }

    /// Low-latency RPC endpoints.
    pub fn fast() -> Self {
        Self::new("fast", 3, Duration::from_millis(100), Duration::from_millis(1000))
    }

    /// Alert delivery, where a late alert still beats a lost one.
    pub fn notification() -> Self {
        let mut policy = Self::new("notification", 5, Duration::from_millis(1000), Duration::from_millis(15_000));
        policy.backoff_multiplier = 1.5;
        policy
    }

    /// Look up a built-in policy by name.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "standard" => Some(Self::standard()),
            "quota_limited" => Some(Self::quota_limited()),
            "fast" => Some(Self::fast()),
            "notification" => Some(Self::notification()),
            _ => None,
        }
    }

    /// Build from configuration. A named preset supplies the defaults, explicit
    /// fields override them.
    pub fn from_config(config: &RetryConfig) -> Self {
        let mut policy = config
            .policy
            .as_deref()
            .and_then(Self::named)
            .unwrap_or_else(Self::standard);

        if let Some(v) = config.max_attempts {
            policy.max_attempts = v.max(1);
        }
        if let Some(v) = config.base_delay_ms {
            policy.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = config.max_delay_ms {
            policy.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = config.backoff_multiplier {
            policy.backoff_multiplier = v;
        }
        if let Some(v) = config.jitter {
            policy.jitter = v;
        }
        policy
    }

    pub fn with_retry_condition(mut self, condition: impl Fn(&UpstreamError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_condition = Arc::new(condition);
        self
    }

    pub fn with_on_retry(mut self, hook: impl Fn(&UpstreamError, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn should_retry(&self, error: &UpstreamError) -> bool {
        (self.retry_condition)(error)
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = calculate_delay(
            attempt,
            self.base_delay.as_millis() as u64,
            self.backoff_multiplier,
            self.max_delay.as_millis() as u64,
        );
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("budget", &self.budget.is_some())
            .finish()
    }
}

/// Successful result plus how it was reached.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub total_time: Duration,
}

/// Run `op` until it succeeds, the policy gives up, or attempts run out.
///
/// `op` receives the 1-based attempt number.
pub async fn execute_with_retry<F, Fut, T>(policy: &RetryPolicy, op: F) -> Result<RetryOutcome<T>, RetryExhaustedError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    execute_with_retry_gated(policy, |_| true, op).await
}

/// As [`execute_with_retry`], but `admit` is consulted after each backoff
/// sleep and before the retry it precedes. A refusal ends the loop with the
/// errors collected so far.
pub async fn execute_with_retry_gated<G, F, Fut, T>(
    policy: &RetryPolicy,
    mut admit: G,
    mut op: F,
) -> Result<RetryOutcome<T>, RetryExhaustedError>
where
    G: FnMut(u32) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let start = Instant::now();
    let mut errors = Vec::new();

    if let Some(budget) = &policy.budget {
        budget.record_request();
    }

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 && !admit(attempt) {
            tracing::debug!(policy = %policy.name, attempt, "Retry not admitted, giving up");
            return Err(RetryExhaustedError {
                attempts: attempt - 1,
                total_elapsed: start.elapsed(),
                errors,
            });
        }

        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(policy = %policy.name, attempt, "Succeeded after retry");
                }
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                    total_time: start.elapsed(),
                });
            }
            Err(error) => {
                let last = attempt >= policy.max_attempts;
                let retryable = policy.should_retry(&error);
                let budget_ok = !last
                    && retryable
                    && policy.budget.as_ref().map_or(true, |b| b.try_acquire_retry());

                if !budget_ok {
                    if retryable && !last {
                        tracing::warn!(policy = %policy.name, attempt, "Retry budget exhausted");
                    }
                    errors.push(error);
                    return Err(RetryExhaustedError {
                        attempts: attempt,
                        total_elapsed: start.elapsed(),
                        errors,
                    });
                }

                let delay = policy.delay_for(attempt);
                tracing::info!(
                    policy = %policy.name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after failure"
                );
                if let Some(hook) = &policy.on_retry {
                    hook(&error, attempt);
                }
                errors.push(error);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(RetryExhaustedError {
        attempts: policy.max_attempts,
        total_elapsed: start.elapsed(),
        errors,
    })
}

/// Caps retries to a share of recent requests.
///
/// The window is a fixed interval; counters reset when it rolls over.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f64,
    min_retries: u32,
    window: Duration,
    counters: Mutex<BudgetWindow>,
}

#[derive(Debug)]
struct BudgetWindow {
    started: Instant,
    requests: u32,
    retries: u32,
}

impl RetryBudget {
    /// `ratio` of requests may be retried per `window`, with at least
    /// `min_retries` allowed regardless of volume.
    pub fn new(ratio: f64, min_retries: u32, window: Duration) -> Self {
        Self {
            ratio: ratio.max(0.0),
            min_retries,
            window,
            counters: Mutex::new(BudgetWindow {
                started: Instant::now(),
                requests: 0,
                retries: 0,
            }),
        }
    }

    fn roll(&self, w: &mut BudgetWindow) {
        if w.started.elapsed() >= self.window {
            w.started = Instant::now();
            w.requests = 0;
            w.retries = 0;
        }
    }

    pub fn record_request(&self) {
        let mut w = self.counters.lock();
        self.roll(&mut w);
        w.requests = w.requests.saturating_add(1);
    }

    /// Consume one retry if the budget allows it.
    pub fn try_acquire_retry(&self) -> bool {
        let mut w = self.counters.lock();
        self.roll(&mut w);
        let allowed = ((w.requests as f64 * self.ratio) as u32).max(self.min_retries);
        if w.retries < allowed {
            w.retries += 1;
            true
        } else {
            false
        }
    }
}
