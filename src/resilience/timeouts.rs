//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap one unit of upstream work with a hard deadline
//! - Notify an optional `on_timeout` hook when the deadline wins
//! - Drop the timer with the call so nothing outlives it
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors and carry the deadline
//! - The timed-out future is dropped; any late result is discarded

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::resilience::error::TimeoutError;

/// Hook invoked when the deadline fires first.
pub type TimeoutHook = Box<dyn FnOnce(&TimeoutError) + Send>;

/// Deadline settings for a single guarded call.
pub struct TimeoutOptions {
    pub timeout: Duration,
    pub name: String,
    pub on_timeout: Option<TimeoutHook>,
}

impl TimeoutOptions {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            timeout,
            name: name.into(),
            on_timeout: None,
        }
    }

    pub fn on_timeout(mut self, hook: impl FnOnce(&TimeoutError) + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for TimeoutOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutOptions")
            .field("timeout", &self.timeout)
            .field("name", &self.name)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

/// Race `op` against a timer.
///
/// Returns `TimeoutError` if the deadline elapses first. A panicking
/// `on_timeout` hook is logged and does not replace the timeout error.
pub async fn with_timeout<F, T>(op: F, options: TimeoutOptions) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(options.timeout, op).await {
        Ok(value) => Ok(value),
        Err(_) => {
            let err = TimeoutError {
                name: options.name,
                timeout: options.timeout,
            };
            tracing::warn!(
                operation = %err.name,
                timeout_ms = err.timeout.as_millis() as u64,
                "Operation timed out"
            );
            if let Some(hook) = options.on_timeout {
                if catch_unwind(AssertUnwindSafe(|| hook(&err))).is_err() {
                    tracing::error!(operation = %err.name, "on_timeout hook panicked");
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn timeout_named<F, T>(name: &str, timeout: Duration, op: F) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        with_timeout(op, TimeoutOptions::new(name, timeout)).await
    }
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_deadline() {
        let result = timeout_named("fast", Duration::from_millis(100), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_with_duration() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let options = TimeoutOptions::new("slow", Duration::from_millis(50))
            .on_timeout(move |_| flag.store(true, Ordering::SeqCst));

        let result = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                1
            },
            options,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.timeout, Duration::from_millis(50));
        assert_eq!(err.name, "slow");
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_hook_is_swallowed() {
        let options = TimeoutOptions::new("hook", Duration::from_millis(10))
            .on_timeout(|_| panic!("hook failure"));

        let result = with_timeout(std::future::pending::<()>(), options).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_is_discarded() {
        let completed = Arc::new(AtomicBool::new(false));
        let done = completed.clone();
        let result = timeout_named("late", Duration::from_millis(10), async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!completed.load(Ordering::SeqCst));
    }
}
