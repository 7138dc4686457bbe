//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound call to a dependency:
//!     → rate_limit.rs (token bucket, request windows, 429 blocks)
//!     → circuit_breaker.rs (fail fast while the dependency is down)
//!     → retries.rs (retry transient failures with backoff)
//!     → timeouts.rs (deadline per attempt)
//! ```
//!
//! `caller.rs` composes the four for one service. `registry.rs` owns one
//! breaker per service.
//!
//! # Design Decisions
//! - Every upstream attempt has a deadline
//! - Rejections (rate limit, open breaker) are never retried
//! - Failures are classified once into `UpstreamError`

pub mod backoff;
pub mod caller;
pub mod circuit_breaker;
pub mod error;
pub mod rate_limit;
pub mod registry;
pub mod retries;
pub mod timeouts;

pub use caller::{CallObserver, CallOutcome, CallerStatus, MetricsObserver, ResilientCaller};
pub use circuit_breaker::{BreakerSettings, BreakerStatus, BreakerTransition, CircuitBreaker, CircuitState};
pub use error::{
    CircuitBreakerError, ErrorKind, NetworkErrorKind, RateLimitRejection, ResilienceError, RetryExhaustedError,
    TimeoutError, UpstreamError,
};
pub use rate_limit::{LimiterStatus, RateLimitPolicy, RateLimiter};
pub use registry::CircuitBreakerRegistry;
pub use retries::{execute_with_retry, execute_with_retry_gated, RetryBudget, RetryOutcome, RetryPolicy};
pub use timeouts::{with_timeout, TimeoutOptions};
