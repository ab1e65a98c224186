//! Periodic progress flusher.
//!
//! One ticker task at most. The controller starts it lazily when a
//! transfer spawns and stops it once the progress table empties, so an
//! idle process schedules nothing.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Flush closure run once per tick while the heartbeat is live.
pub type FlushFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Idempotent periodic scheduler around a flush closure.
pub struct Heartbeat {
    period: Duration,
    flush_fn: FlushFn,
    /// Cancellation token of the live ticker task; `None` when stopped.
    ticker: Mutex<Option<CancellationToken>>,
}

impl Heartbeat {
    pub fn new<F>(period: Duration, flush_fn: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            period,
            flush_fn: Arc::new(flush_fn),
            ticker: Mutex::new(None),
        }
    }

    /// Start the ticker task unless one is already live.
    pub fn ensure_running(&self) {
        let mut slot = self.ticker.lock();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let period = self.period;
        let flush_fn = Arc::clone(&self.flush_fn);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of an interval completes immediately; consume
            // it so flushes land one full period after start.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        flush_fn().await;
                    }
                }
            }
        });
    }

    /// Stop the ticker task. A flush already past its select point may
    /// still complete; the store-side status guard makes that harmless.
    pub fn stop(&self) {
        if let Some(token) = self.ticker.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }
}
