//! Polling Scheduler
//!
//! Fixed-interval reconciliation timer. Runs as its own tokio task driven by
//! `tokio::time::interval` and stopped through a `CancellationToken`, so a
//! stop is observed before the next tick no matter which task requests it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// When the first tick fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FireMode {
    /// First tick immediately on start
    Immediate,
    /// First tick one interval after start
    #[default]
    AfterInterval,
}

/// Returned by the tick callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Stop the scheduler; no further ticks
    Stop,
}

/// Cancellable periodic task
pub struct PollingScheduler {
    period: Duration,
    cancel: CancellationToken,
    started: AtomicBool,
    ticks: Arc<AtomicU64>,
}

impl PollingScheduler {
    pub fn new(period: Duration) -> Self {
        Self::with_cancel(period, &CancellationToken::new())
    }

    /// Scheduler that also stops when `parent` is cancelled
    pub fn with_cancel(period: Duration, parent: &CancellationToken) -> Self {
        Self {
            // interval() rejects a zero period
            period: period.max(Duration::from_millis(1)),
            cancel: parent.child_token(),
            started: AtomicBool::new(false),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start ticking. Returns false if already started or stopped.
    pub fn start<F, Fut>(&self, mode: FireMode, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        if self.cancel.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let cancel = self.cancel.clone();
        let ticks = self.ticks.clone();
        let period = self.period;

        let first = match mode {
            FireMode::Immediate => Instant::now(),
            FireMode::AfterInterval => Instant::now() + period,
        };

        tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(target: "paywatch::scheduler", tick = n, "reconciliation tick");

                if tick().await == TickOutcome::Stop {
                    cancel.cancel();
                    break;
                }
            }

            debug!(target: "paywatch::scheduler", "scheduler stopped");
        });

        true
    }

    /// Stop the scheduler. Safe to call repeatedly and from within a tick.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Ticks fired so far
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}
