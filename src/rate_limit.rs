//! Shared rate limiter for the embedding API.
//!
//! Every worker holds an `Arc<RateLimiter>` and calls [`RateLimiter::acquire_slot`]
//! before each network round trip. Three limits apply to all workers together:
//!
//! 1. requests per window (fixed window, reset when the window elapses)
//! 2. minimum interval between any two requests
//! 3. maximum in-flight requests (counting semaphore)
//!
//! The concurrency slot is taken first. The window and interval gates are then
//! checked and the request is reserved under a single lock, so concurrent
//! callers can never overshoot the window budget or bunch up after a slot frees.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    requests_this_window: u64,
    last_request_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct LimiterCounters {
    requests_made: AtomicU64,
    blocked_rpm: AtomicU64,
    blocked_interval: AtomicU64,
    blocked_concurrent: AtomicU64,
    concurrency_timeouts: AtomicU64,
    total_wait_us: AtomicU64,
    longest_wait_us: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl LimiterCounters {
    fn record_wait(&self, wait: Duration) {
        let us = u64::try_from(wait.as_micros()).unwrap_or(u64::MAX);
        self.total_wait_us.fetch_add(us, Ordering::Relaxed);
        self.longest_wait_us.fetch_max(us, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<WindowState>,
    slots: Arc<Semaphore>,
    counters: Arc<LimiterCounters>,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub requests_made: u64,
    pub requests_blocked_rpm: u64,
    pub requests_blocked_interval: u64,
    pub requests_blocked_concurrent: u64,
    pub concurrency_timeouts: u64,
    pub total_wait_secs: f64,
    pub longest_wait_secs: f64,
    pub average_wait_secs: f64,
    pub active_requests: usize,
    pub peak_active_requests: usize,
    pub requests_this_window: u64,
    pub requests_per_minute_limit: u64,
    pub max_concurrent_limit: usize,
    pub min_request_interval_secs: f64,
    pub elapsed_secs: f64,
}

/// An in-flight request slot. Dropping it releases the concurrency slot,
/// which also happens when the guarded call errors or panics.
#[derive(Debug)]
pub struct RequestPermit {
    counters: Arc<LimiterCounters>,
    // None when the concurrency gate timed out and the request went through anyway.
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        // active 先减，信号量许可随后在字段析构时释放，计数不会超过上限
        let _ = self
            .counters
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }
}

enum Gate {
    Rpm(Duration),
    Interval(Duration),
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_concurrent = config.max_concurrent_requests.max(1);
        tracing::info!(
            rpm = config.requests_per_minute,
            min_interval_ms = config.min_request_interval.as_millis() as u64,
            max_concurrent,
            "Rate limiter initialized"
        );
        Self {
            window: Mutex::new(WindowState {
                window_start: Instant::now(),
                requests_this_window: 0,
                last_request_at: None,
            }),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            counters: Arc::new(LimiterCounters::default()),
            started_at: Instant::now(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Block until all three limits allow one more request, then reserve it.
    pub async fn acquire_slot(&self) -> RequestPermit {
        // 先拿并发槽位再登记时间戳，排队中的请求被放行时仍受最小间隔约束
        let permit = self.wait_for_concurrency().await;
        self.wait_for_window().await;

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_active.fetch_max(active, Ordering::SeqCst);
        self.counters.requests_made.fetch_add(1, Ordering::Relaxed);

        RequestPermit {
            counters: self.counters.clone(),
            _permit: permit,
        }
    }

    /// Run `call` while holding a request slot.
    pub async fn scoped<F, Fut, T>(&self, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire_slot().await;
        call().await
    }

    async fn wait_for_window(&self) {
        let mut blocked_rpm = false;
        let mut blocked_interval = false;

        loop {
            let gate = {
                let mut state = self.window.lock().await;
                let now = Instant::now();

                if now.duration_since(state.window_start) >= self.config.window {
                    state.window_start = now;
                    state.requests_this_window = 0;
                }

                let since_last = state.last_request_at.map(|last| now.duration_since(last));

                if state.requests_this_window >= self.config.requests_per_minute {
                    let reset_at = state.window_start + self.config.window;
                    Some(Gate::Rpm(reset_at.saturating_duration_since(now)))
                } else if let Some(remaining) = since_last
                    .map(|elapsed| self.config.min_request_interval.saturating_sub(elapsed))
                    .filter(|d| !d.is_zero())
                {
                    Some(Gate::Interval(remaining))
                } else {
                    state.requests_this_window += 1;
                    state.last_request_at = Some(now);
                    None
                }
            };

            let wait = match gate {
                None => return,
                Some(Gate::Rpm(wait)) => {
                    if !blocked_rpm {
                        blocked_rpm = true;
                        self.counters.blocked_rpm.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "RPM limit reached");
                    wait
                }
                Some(Gate::Interval(wait)) => {
                    if !blocked_interval {
                        blocked_interval = true;
                        self.counters.blocked_interval.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::trace!(wait_ms = wait.as_millis() as u64, "Interval limit");
                    wait
                }
            };

            // sleep outside the lock so other workers can observe the window
            self.counters.record_wait(wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn wait_for_concurrency(&self) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Some(permit);
        }

        self.counters
            .blocked_concurrent
            .fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let acquired = tokio::time::timeout(
            self.config.concurrency_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await;
        self.counters.record_wait(started.elapsed());

        match acquired {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_closed)) => {
                tracing::warn!("Concurrency semaphore closed, proceeding without a slot");
                None
            }
            Err(_) => {
                self.counters
                    .concurrency_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    timeout_secs = self.config.concurrency_timeout.as_secs(),
                    "Concurrency gate wait timed out, proceeding anyway"
                );
                None
            }
        }
    }

    pub fn active_requests(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn peak_active_requests(&self) -> usize {
        self.counters.peak_active.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let requests_this_window = self.window.lock().await.requests_this_window;
        let c = &self.counters;
        let requests_made = c.requests_made.load(Ordering::Relaxed);
        let total_wait_secs = c.total_wait_us.load(Ordering::Relaxed) as f64 / 1e6;

        RateLimiterStats {
            requests_made,
            requests_blocked_rpm: c.blocked_rpm.load(Ordering::Relaxed),
            requests_blocked_interval: c.blocked_interval.load(Ordering::Relaxed),
            requests_blocked_concurrent: c.blocked_concurrent.load(Ordering::Relaxed),
            concurrency_timeouts: c.concurrency_timeouts.load(Ordering::Relaxed),
            total_wait_secs,
            longest_wait_secs: c.longest_wait_us.load(Ordering::Relaxed) as f64 / 1e6,
            average_wait_secs: total_wait_secs / requests_made.max(1) as f64,
            active_requests: c.active.load(Ordering::SeqCst),
            peak_active_requests: c.peak_active.load(Ordering::SeqCst),
            requests_this_window,
            requests_per_minute_limit: self.config.requests_per_minute,
            max_concurrent_limit: self.config.max_concurrent_requests,
            min_request_interval_secs: self.config.min_request_interval.as_secs_f64(),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Zero the statistics and start a fresh window. Active slots are kept.
    pub async fn reset_stats(&self) {
        {
            let mut state = self.window.lock().await;
            state.window_start = Instant::now();
            state.requests_this_window = 0;
        }
        let c = &self.counters;
        for counter in [
            &c.requests_made,
            &c.blocked_rpm,
            &c.blocked_interval,
            &c.blocked_concurrent,
            &c.concurrency_timeouts,
            &c.total_wait_us,
            &c.longest_wait_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        c.peak_active
            .store(c.active.load(Ordering::SeqCst), Ordering::SeqCst);
        tracing::info!("Rate limiter statistics reset");
    }
}
