//! Per-service upstream rate limiting.
//!
//! Three policies compose per service and must all pass (logical AND):
//! a continuously refilled token bucket, sliding request-count windows
//! (trailing minute / hour), and an explicit timed block set after a 429.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::schema::{RateLimitConfig, RateLimiterSettings};
use crate::observability::metrics;
use crate::resilience::backoff::adaptive_block;
use crate::resilience::error::{RateLimitRejection, RejectReason};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Limits for one service. Unset fields impose no limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitPolicy {
    pub requests_per_second: Option<f64>,
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    /// Token bucket capacity; defaults to `ceil(requests_per_second)`.
    pub burst_size: Option<u32>,
}

impl RateLimitPolicy {
    pub fn per_second(rate: f64, burst: u32) -> Self {
        Self {
            requests_per_second: Some(rate),
            burst_size: Some(burst),
            ..Default::default()
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self {
            requests_per_minute: Some(limit),
            ..Default::default()
        }
    }

    fn bucket_params(&self) -> Option<(f64, f64)> {
        let rate = self.requests_per_second.filter(|r| *r > 0.0)?;
        let capacity = self
            .burst_size
            .map(f64::from)
            .unwrap_or_else(|| rate.ceil())
            .max(1.0);
        Some((capacity, rate))
    }

    fn retention(&self) -> Duration {
        if self.requests_per_hour.is_some() {
            HOUR
        } else {
            MINUTE
        }
    }

    fn history_cap(&self) -> usize {
        let limit = self
            .requests_per_hour
            .or(self.requests_per_minute)
            .unwrap_or(0) as usize;
        (limit * 2).max(1024)
    }
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_second: config.requests_per_second,
            requests_per_minute: config.requests_per_minute,
            requests_per_hour: config.requests_per_hour,
            burst_size: config.burst_size,
        }
    }
}

/// A simple token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn projected(&self, capacity: f64, rate: f64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * rate).min(capacity)
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        self.tokens = self.projected(capacity, rate, now);
        self.last_refill = now;
    }
}

/// Per-service limiter state.
#[derive(Debug)]
struct ServiceWindow {
    policy: RateLimitPolicy,
    bucket: Option<TokenBucket>,
    recent: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    recent_blocks: VecDeque<Instant>,
}

impl ServiceWindow {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        let bucket = policy.bucket_params().map(|(cap, _)| TokenBucket::new(cap, now));
        Self {
            policy,
            bucket,
            recent: VecDeque::new(),
            blocked_until: None,
            recent_blocks: VecDeque::new(),
        }
    }

    fn count_within(&self, window: Duration, now: Instant) -> usize {
        self.recent
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    fn oldest_within(&self, window: Duration, now: Instant) -> Option<Instant> {
        self.recent
            .iter()
            .find(|t| now.saturating_duration_since(**t) < window)
            .copied()
    }

    /// Non-mutating admission check.
    fn check(&self, now: Instant) -> Result<(), (RejectReason, Option<Duration>)> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Err((RejectReason::Blocked, Some(until - now)));
            }
        }

        if let (Some(bucket), Some((capacity, rate))) = (&self.bucket, self.policy.bucket_params()) {
            let tokens = bucket.projected(capacity, rate, now);
            if tokens < 1.0 {
                let wait = Duration::from_secs_f64((1.0 - tokens) / rate);
                return Err((RejectReason::TokensExhausted, Some(wait)));
            }
        }

        let windows = [
            (self.policy.requests_per_minute, MINUTE, RejectReason::MinuteWindow),
            (self.policy.requests_per_hour, HOUR, RejectReason::HourWindow),
        ];
        for (limit, window, reason) in windows {
            if let Some(limit) = limit {
                if self.count_within(window, now) >= limit as usize {
                    let wait = self
                        .oldest_within(window, now)
                        .map(|oldest| (oldest + window).saturating_duration_since(now));
                    return Err((reason, wait));
                }
            }
        }

        Ok(())
    }

    fn record(&mut self, now: Instant) {
        if let (Some(bucket), Some((capacity, rate))) = (&mut self.bucket, self.policy.bucket_params()) {
            bucket.refill(capacity, rate, now);
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        }
        self.recent.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let retention = self.policy.retention();
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) >= retention {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        let cap = self.policy.history_cap();
        while self.recent.len() > cap {
            self.recent.pop_front();
        }
        while let Some(front) = self.recent_blocks.front() {
            if now.saturating_duration_since(*front) >= HOUR {
                self.recent_blocks.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub service: String,
    pub tokens: Option<f64>,
    pub burst_size: Option<u32>,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub blocked_for_ms: Option<u64>,
    pub blocks_last_hour: usize,
    pub available: bool,
}

/// Rate limiter for every upstream service.
#[derive(Debug)]
pub struct RateLimiter {
    services: Mutex<HashMap<String, ServiceWindow>>,
    block_base: Duration,
    block_max: Duration,
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(settings: &RateLimiterSettings) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            block_base: Duration::from_secs(settings.block_base_secs),
            block_max: Duration::from_secs(settings.block_max_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
        }
    }

    /// Install or replace the policy for `service`, clearing its history.
    pub fn register(&self, service: &str, policy: RateLimitPolicy) {
        let now = Instant::now();
        tracing::debug!(service = %service, policy = ?policy, "Registering rate limit policy");
        self.services
            .lock()
            .insert(service.to_string(), ServiceWindow::new(policy, now));
    }

    /// Whether a request would be admitted now. Does not consume capacity.
    pub fn can_make_request(&self, service: &str) -> bool {
        let now = Instant::now();
        self.services
            .lock()
            .get(service)
            .map_or(true, |w| w.check(now).is_ok())
    }

    /// Account for a request made to `service`.
    pub fn record_request(&self, service: &str) {
        let now = Instant::now();
        let mut services = self.services.lock();
        services
            .entry(service.to_string())
            .or_insert_with(|| ServiceWindow::new(RateLimitPolicy::default(), now))
            .record(now);
    }

    /// Check and record in one step.
    pub fn try_acquire(&self, service: &str) -> Result<(), RateLimitRejection> {
        let now = Instant::now();
        let mut services = self.services.lock();
        let Some(window) = services.get_mut(service) else {
            return Ok(());
        };
        match window.check(now) {
            Ok(()) => {
                window.record(now);
                Ok(())
            }
            Err((reason, retry_after)) => {
                metrics::record_rate_limited(service, reason.as_str());
                tracing::debug!(service = %service, reason = reason.as_str(), "Rate limit rejected request");
                Err(RateLimitRejection {
                    service: service.to_string(),
                    reason,
                    retry_after,
                })
            }
        }
    }

    /// Poll until `service` would admit a request or `max_wait` elapses.
    pub async fn wait_for_availability(&self, service: &str, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let now = Instant::now();
            let hint = {
                let services = self.services.lock();
                match services.get(service).map(|w| w.check(now)) {
                    None | Some(Ok(())) => return true,
                    Some(Err((_, hint))) => hint,
                }
            };
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            let nap = hint
                .unwrap_or(self.poll_interval)
                .min(self.poll_interval)
                .min(remaining)
                .max(Duration::from_millis(1));
            tokio::time::sleep(nap).await;
        }
    }

    /// Block `service` after a 429. Uses the provider's `Retry-After` when
    /// given, otherwise `base × 2^min(blocks in last hour, 4)` capped at max.
    /// Returns the block duration applied.
    pub fn handle_429_response(&self, service: &str, retry_after_secs: Option<u64>) -> Duration {
        let now = Instant::now();
        let mut services = self.services.lock();
        let window = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceWindow::new(RateLimitPolicy::default(), now));
        window.prune(now);

        let duration = match retry_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => adaptive_block(self.block_base, window.recent_blocks.len(), self.block_max),
        };
        let until = now + duration;
        window.blocked_until = Some(window.blocked_until.map_or(until, |t| t.max(until)));
        window.recent_blocks.push_back(now);

        tracing::warn!(
            service = %service,
            block_secs = duration.as_secs(),
            provider_retry_after = ?retry_after_secs,
            blocks_last_hour = window.recent_blocks.len(),
            "Upstream returned 429, blocking service"
        );
        metrics::record_rate_limit_block(service);
        duration
    }

    /// Remaining explicit block on `service`, if any.
    pub fn blocked_for(&self, service: &str) -> Option<Duration> {
        let now = Instant::now();
        self.services
            .lock()
            .get(service)
            .and_then(|w| w.blocked_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Clear history, tokens and blocks for `service`.
    pub fn reset(&self, service: &str) {
        let now = Instant::now();
        let mut services = self.services.lock();
        if let Some(window) = services.get_mut(service) {
            *window = ServiceWindow::new(window.policy.clone(), now);
        }
    }

    pub fn status(&self, service: &str) -> Option<LimiterStatus> {
        let now = Instant::now();
        self.services
            .lock()
            .get(service)
            .map(|w| Self::snapshot(service, w, now))
    }

    pub fn statuses(&self) -> Vec<LimiterStatus> {
        let now = Instant::now();
        let services = self.services.lock();
        let mut out: Vec<_> = services
            .iter()
            .map(|(name, w)| Self::snapshot(name, w, now))
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    fn snapshot(service: &str, w: &ServiceWindow, now: Instant) -> LimiterStatus {
        LimiterStatus {
            service: service.to_string(),
            tokens: match (&w.bucket, w.policy.bucket_params()) {
                (Some(b), Some((cap, rate))) => Some(b.projected(cap, rate, now)),
                _ => None,
            },
            burst_size: w.policy.bucket_params().map(|(cap, _)| cap as u32),
            requests_last_minute: w.count_within(MINUTE, now),
            requests_last_hour: w.count_within(HOUR, now),
            blocked_for_ms: w
                .blocked_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_millis() as u64),
            blocks_last_hour: w
                .recent_blocks
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < HOUR)
                .count(),
            available: w.check(now).is_ok(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimiterSettings::default())
    }
}
