//! Adaptive Concurrency Controller (C6).
//!
//! A single `std::sync::Mutex`-guarded `ConcurrencyState` tracks the
//! exponentially-weighted average request latency and the current
//! permit target; a `tokio::sync::Semaphore` is resized to match by
//! forgetting or adding permits, mirroring the teacher's
//! `ContextState` shared-mutex shape.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

const INITIAL_EMA_MS: f64 = 800.0;
const ALPHA: f64 = 0.10;
const GROW_THRESHOLD_MS: f64 = 500.0;
const SHRINK_THRESHOLD_MS: f64 = 1500.0;

struct ConcurrencyState {
    current: usize,
    min: usize,
    max: usize,
    ema_ms: f64,
}

/// Owns the semaphore permits consumed by in-flight translation
/// tasks, growing or shrinking the available permit count in response
/// to observed latency.
pub struct ConcurrencyController {
    state: Mutex<ConcurrencyState>,
    semaphore: Arc<Semaphore>,
    // Mirrors `state.current` for lock-free metrics reads; the lock
    // remains the source of truth for adjustments.
    current_metric: AtomicUsize,
}

impl ConcurrencyController {
    pub fn new(min: usize, max: usize, initial: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let initial = initial.clamp(min, max);
        Self {
            state: Mutex::new(ConcurrencyState {
                current: initial,
                min,
                max,
                ema_ms: INITIAL_EMA_MS,
            }),
            semaphore: Arc::new(Semaphore::new(initial)),
            current_metric: AtomicUsize::new(initial),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("semaphore is never closed")
    }

    /// Records a completed request's observed latency and adjusts
    /// `current` per the EMA rule. Adjustments take effect for the
    /// next `acquire()` call, since they add/forget permits rather
    /// than touching ones already checked out.
    pub fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap();
        state.ema_ms = (1.0 - ALPHA) * state.ema_ms + ALPHA * latency_ms;

        if state.ema_ms < GROW_THRESHOLD_MS && state.current < state.max {
            state.current += 1;
            self.semaphore.add_permits(1);
        } else if state.ema_ms > SHRINK_THRESHOLD_MS && state.current > state.min {
            state.current -= 1;
            self.semaphore.forget_permits(1);
        }

        self.current_metric.store(state.current, Ordering::Relaxed);
    }

    /// Lock-free read for metrics/logging; may be briefly stale
    /// relative to a concurrent `record_latency` call.
    pub fn current(&self) -> usize {
        self.current_metric.load(Ordering::Relaxed)
    }

    pub fn ema_ms(&self) -> f64 {
        self.state.lock().unwrap().ema_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grows_when_latency_is_low() {
        let controller = ConcurrencyController::new(1, 10, 4);
        for _ in 0..5 {
            controller.record_latency(Duration::from_millis(100));
        }
        assert!(controller.current() > 4);
    }

    #[tokio::test]
    async fn shrinks_when_latency_is_high() {
        let controller = ConcurrencyController::new(1, 10, 4);
        for _ in 0..5 {
            controller.record_latency(Duration::from_millis(3000));
        }
        assert!(controller.current() < 4);
    }

    #[tokio::test]
    async fn never_exceeds_configured_bounds() {
        let controller = ConcurrencyController::new(2, 3, 2);
        for _ in 0..20 {
            controller.record_latency(Duration::from_millis(50));
        }
        assert!(controller.current() <= 3);
    }

    #[tokio::test]
    async fn acquire_yields_a_permit() {
        let controller = ConcurrencyController::new(1, 2, 1);
        let _permit = controller.acquire().await;
    }
}
