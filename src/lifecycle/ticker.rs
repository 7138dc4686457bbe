//! Periodic background tasks.
//!
//! A [`Ticker`] runs an async task on a fixed period until shutdown. Missed
//! ticks are skipped rather than bursted, so a stalled runtime produces one
//! late run instead of a backlog.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::lifecycle::shutdown::Shutdown;

pub struct Ticker;

impl Ticker {
    /// Run `task` every `period`, first after one full period.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, shutdown: &Shutdown, mut task: F) -> TickerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let paused = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());
        let mut shutdown_rx = shutdown.subscribe();

        let task_paused = paused.clone();
        let task_stop = stop.clone();
        let join = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::debug!(ticker = name, period_ms = period.as_millis() as u64, "Ticker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !task_paused.load(Ordering::Acquire) {
                            task().await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!(ticker = name, "Ticker received shutdown signal, exiting loop");
                        break;
                    }
                    _ = task_stop.notified() => {
                        tracing::debug!(ticker = name, "Ticker stopped");
                        break;
                    }
                }
            }
        });

        TickerHandle { paused, stop, join }
    }
}

/// Control handle for a spawned [`Ticker`].
#[derive(Debug)]
pub struct TickerHandle {
    paused: Arc<AtomicBool>,
    stop: Arc<Notify>,
    join: JoinHandle<()>,
}

impl TickerHandle {
    /// Skip runs until [`resume`](Self::resume). The ticker keeps its schedule.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Stop the ticker and wait for its task to exit.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.join.await;
    }

    /// Wait for the ticker to exit on shutdown.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting(shutdown: &Shutdown) -> (TickerHandle, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = Ticker::spawn("test", Duration::from_secs(10), shutdown, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (handle, runs)
    }

    async fn advance(secs: u64) {
        for _ in 0..secs {
            time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_each_period_and_honors_pause() {
        let shutdown = Shutdown::new();
        let (handle, runs) = counting(&shutdown);

        advance(25).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        handle.pause();
        assert!(handle.is_paused());
        advance(20).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        handle.resume();
        advance(10).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_on_shutdown() {
        let shutdown = Shutdown::new();
        let (handle, runs) = counting(&shutdown);

        shutdown.trigger();
        handle.join().await;
        advance(30).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
