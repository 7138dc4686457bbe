//! Circuit breaker for upstream dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: one trial call tests whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → Half-Open: first call after reset_timeout
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails
//! ```
//!
//! # Design Decisions
//! - Per-service breaker (not global), owned by the registry
//! - Fail fast in Open state (no waiting for timeout)
//! - Single trial in Half-Open (prevents hammering a recovering provider)
//! - Expected error kinds (throttling, timeouts) are recorded but never trip the breaker
//! - The mutex is never held across an await

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::schema::CircuitBreakerConfig;
use crate::observability::metrics;
use crate::resilience::error::{CircuitBreakerError, Classify, ErrorKind};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding (0=Closed, 1=Open, 2=HalfOpen).
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Error kinds recorded without counting toward the threshold.
    pub expected_errors: Vec<ErrorKind>,
}

impl BreakerSettings {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            expected_errors: Vec::new(),
        }
    }

    pub fn with_expected(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.expected_errors = kinds.into_iter().collect();
        self
    }

    pub fn is_expected(&self, kind: ErrorKind) -> bool {
        self.expected_errors.contains(&kind)
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_millis(config.reset_timeout_ms))
            .with_expected(config.expected_errors.iter().copied())
    }
}

/// Emitted on every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTransition {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: &'static str,
}

/// Snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub expected_failure_count: u64,
    pub failure_threshold: u32,
    pub last_failure_ms_ago: Option<u64>,
    pub next_attempt_in_ms: Option<u64>,
    pub healthy: bool,
}

/// Rejected admission or the wrapped operation's own error.
#[derive(Debug)]
pub enum BreakerCallError<E> {
    Rejected(CircuitBreakerError),
    Failed(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    expected_failure_count: u64,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            expected_failure_count: 0,
            last_failure: None,
            next_attempt: None,
            trial_in_flight: false,
        }
    }
}

/// Per-service failure-isolation state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerState>,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    /// Create a breaker that publishes transitions on `events`.
    pub fn new(
        service: impl Into<String>,
        settings: BreakerSettings,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            service: service.into(),
            settings,
            inner: Mutex::new(BreakerState::new()),
            events,
        }
    }

    /// Create a breaker with its own transition channel.
    pub fn standalone(service: impl Into<String>, settings: BreakerSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self::new(service, settings, events)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `op` if admitted, recording its outcome.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let permit = self.try_acquire().map_err(BreakerCallError::Rejected)?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure(err.kind());
                Err(BreakerCallError::Failed(err))
            }
        }
    }

    /// Ask for admission. The returned permit must be resolved with
    /// [`CallPermit::success`] or [`CallPermit::failure`]; dropping it
    /// unresolved frees a half-open trial slot without a transition.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitBreakerError> {
        let now = Instant::now();
        let mut st = self.inner.lock();

        match st.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let due = st.next_attempt.map_or(true, |t| now >= t);
                if due {
                    self.transition(&mut st, CircuitState::HalfOpen, "reset timeout elapsed", now);
                    st.trial_in_flight = true;
                    Ok(CallPermit::new(self, true))
                } else {
                    Err(self.rejection(&st, now))
                }
            }
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    Err(self.rejection(&st, now))
                } else {
                    st.trial_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    fn rejection(&self, st: &BreakerState, now: Instant) -> CircuitBreakerError {
        metrics::record_breaker_rejection(&self.service);
        CircuitBreakerError {
            service: self.service.clone(),
            state: st.state,
            next_attempt_in: st
                .next_attempt
                .filter(|_| st.state == CircuitState::Open)
                .map(|t| t.saturating_duration_since(now)),
        }
    }

    fn on_success(&self, trial: bool) {
        let now = Instant::now();
        let mut st = self.inner.lock();
        st.success_count += 1;
        st.failure_count = 0;
        if trial {
            st.trial_in_flight = false;
            if st.state == CircuitState::HalfOpen {
                self.transition(&mut st, CircuitState::Closed, "trial call succeeded", now);
            }
        }
    }

    fn on_failure(&self, trial: bool, kind: ErrorKind) {
        let now = Instant::now();
        let mut st = self.inner.lock();
        st.last_failure = Some(now);

        if self.settings.is_expected(kind) {
            st.expected_failure_count += 1;
            if trial {
                st.trial_in_flight = false;
            }
            tracing::debug!(service = %self.service, kind = %kind, "Expected failure recorded");
            return;
        }

        st.failure_count = st.failure_count.saturating_add(1);
        if trial {
            st.trial_in_flight = false;
            if st.state == CircuitState::HalfOpen {
                self.transition(&mut st, CircuitState::Open, "trial call failed", now);
            }
        } else if st.state == CircuitState::Closed && st.failure_count >= self.settings.failure_threshold {
            self.transition(&mut st, CircuitState::Open, "failure threshold reached", now);
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// The only place state changes. No-op when already in `to`.
    fn transition(&self, st: &mut BreakerState, to: CircuitState, reason: &'static str, now: Instant) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        match to {
            CircuitState::Open => {
                st.next_attempt = Some(now + self.settings.reset_timeout);
                st.trial_in_flight = false;
            }
            CircuitState::Closed => {
                st.failure_count = 0;
                st.next_attempt = None;
                st.trial_in_flight = false;
            }
            CircuitState::HalfOpen => {}
        }

        match to {
            CircuitState::Open => tracing::warn!(
                service = %self.service,
                from = %from,
                failures = st.failure_count,
                reset_timeout_ms = self.settings.reset_timeout.as_millis() as u64,
                reason,
                "Circuit opened"
            ),
            _ => tracing::info!(service = %self.service, from = %from, to = %to, reason, "Circuit state changed"),
        }
        metrics::record_breaker_state(&self.service, to);

        let _ = self.events.send(BreakerTransition {
            service: self.service.clone(),
            from,
            to,
            reason,
        });
    }

    /// Open immediately, regardless of counts.
    pub fn force_open(&self) {
        let now = Instant::now();
        let mut st = self.inner.lock();
        self.transition(&mut st, CircuitState::Open, "forced open", now);
    }

    /// Close immediately and clear the failure count.
    pub fn force_close(&self) {
        let now = Instant::now();
        let mut st = self.inner.lock();
        self.transition(&mut st, CircuitState::Closed, "forced closed", now);
        st.failure_count = 0;
    }

    /// Return to the initial state, clearing all counters.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut st = self.inner.lock();
        self.transition(&mut st, CircuitState::Closed, "reset", now);
        *st = BreakerState::new();
    }

    pub fn status(&self) -> BreakerStatus {
        let now = Instant::now();
        let st = self.inner.lock();
        BreakerStatus {
            service: self.service.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            expected_failure_count: st.expected_failure_count,
            failure_threshold: self.settings.failure_threshold,
            last_failure_ms_ago: st
                .last_failure
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            next_attempt_in_ms: st
                .next_attempt
                .filter(|_| st.state == CircuitState::Open)
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
            healthy: st.state == CircuitState::Closed,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self, kind: ErrorKind) {
        self.resolved = true;
        self.breaker.on_failure(self.trial, kind);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::error::UpstreamError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::standalone(
            "dexscreener",
            BreakerSettings::new(threshold, Duration::from_millis(reset_ms)),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerCallError<UpstreamError>> {
        cb.execute(|| async { Err::<(), _>(UpstreamError::http(500, "boom")) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerCallError<UpstreamError>> {
        cb.execute(|| async { Ok::<_, UpstreamError>(1) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(3, 1000);
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(BreakerCallError::Failed(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, UpstreamError>(()) }
            })
            .await;
        match result {
            Err(BreakerCallError::Rejected(e)) => {
                assert_eq!(e.state, CircuitState::Open);
                assert_eq!(e.next_attempt_in, Some(Duration::from_millis(1000)));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_recovery_through_half_open() {
        let cb = breaker(3, 1000);
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(matches!(succeed(&cb).await, Err(BreakerCallError::Rejected(_))));

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_new_deadline() {
        let cb = breaker(1, 1000);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().next_attempt_in_ms, Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_in_half_open() {
        let cb = breaker(1, 100);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());

        drop(trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let second = cb.try_acquire().unwrap();
        second.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_errors_do_not_trip() {
        let cb = CircuitBreaker::standalone(
            "goplus",
            BreakerSettings::new(2, Duration::from_secs(1)).with_expected([ErrorKind::RateLimited]),
        );
        for _ in 0..10 {
            let _ = cb
                .execute(|| async { Err::<(), _>(UpstreamError::rate_limited(Some(1))) })
                .await;
        }
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.expected_failure_count, 10);
        assert!(status.last_failure_ms_ago.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_overrides_are_idempotent() {
        let cb = breaker(3, 1000);
        let mut events = cb.subscribe();

        cb.force_close();
        assert!(events.try_recv().is_err());

        cb.force_open();
        cb.force_open();
        let ev = events.try_recv().unwrap();
        assert_eq!((ev.from, ev.to), (CircuitState::Closed, CircuitState::Open));
        assert!(events.try_recv().is_err());

        cb.reset();
        let ev = events.try_recv().unwrap();
        assert_eq!(ev.to, CircuitState::Closed);
        cb.reset();
        assert!(events.try_recv().is_err());
        assert!(cb.status().healthy);
    }
}
