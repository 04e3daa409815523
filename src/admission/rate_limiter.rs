//! Request admission: a sliding-window rate gate followed by a concurrency
//! gate with bounded wait.
//!
//! The window holds the admission instants of the trailing `time_window` and is
//! purged lazily on every check. A request counts against the window as soon as
//! it passes the rate gate, even if it then times out on the concurrency gate.

use crate::error::{DbError, DbResult};
use crate::models::RateLimiterStats;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    pub max_requests: usize,
    pub time_window: Duration,
    pub max_concurrent: usize,
    pub max_wait: Duration,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            max_requests: crate::config::DEFAULT_MAX_REQUESTS,
            time_window: Duration::from_secs(crate::config::DEFAULT_RATE_WINDOW_SECS),
            max_concurrent: crate::config::DEFAULT_MAX_CONCURRENT,
            max_wait: Duration::from_secs(crate::config::DEFAULT_MAX_WAIT_SECS),
        }
    }
}

#[derive(Debug, Default)]
struct RateCounters {
    total_requests: AtomicU64,
    rejected_rate_limit: AtomicU64,
    rejected_timeout: AtomicU64,
    total_wait_micros: AtomicU64,
    max_concurrent_reached: AtomicUsize,
}

#[derive(Debug)]
pub struct RateLimiter {
    options: RateLimiterOptions,
    window: Mutex<VecDeque<Instant>>,
    semaphore: Arc<Semaphore>,
    /// Shared with every outstanding [`RatePermit`].
    current: Arc<AtomicUsize>,
    stats: RateCounters,
}

/// Admission slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
    current: Arc<AtomicUsize>,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(options.max_concurrent)),
            window: Mutex::new(VecDeque::new()),
            current: Arc::new(AtomicUsize::new(0)),
            stats: RateCounters::default(),
            options,
        }
    }

    pub fn options(&self) -> &RateLimiterOptions {
        &self.options
    }

    /// Admit one request.
    ///
    /// Fails with `RateLimitExceeded` when the window is full, or with
    /// `ConcurrencyTimeout` when no slot frees up within `max_wait`.
    pub async fn acquire(&self) -> DbResult<RatePermit> {
        self.admit()?;

        let start = Instant::now();
        let permit = match timeout(
            self.options.max_wait,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::internal("Rate limiter semaphore closed")),
            Err(_) => {
                self.stats.rejected_timeout.fetch_add(1, Ordering::Relaxed);
                let waited = start.elapsed();
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    max_concurrent = self.options.max_concurrent,
                    "Request rejected: no concurrency slot"
                );
                return Err(DbError::concurrency_timeout("rate limiter", waited));
            }
        };

        let waited = start.elapsed();
        self.stats
            .total_wait_micros
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);

        let current = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats
            .max_concurrent_reached
            .fetch_max(current, Ordering::Relaxed);

        Ok(RatePermit {
            _permit: permit,
            current: Arc::clone(&self.current),
        })
    }

    /// Rate gate only. Records the admission instant on success.
    ///
    /// For work that already runs under a held [`RatePermit`].
    pub fn admit(&self) -> DbResult<()> {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        Self::purge(&mut window, now, self.options.time_window);

        if window.len() >= self.options.max_requests {
            drop(window);
            self.stats.rejected_rate_limit.fetch_add(1, Ordering::Relaxed);
            warn!(
                max_requests = self.options.max_requests,
                window_secs = self.options.time_window.as_secs(),
                "Request rejected: rate limit exceeded"
            );
            return Err(DbError::rate_limit_exceeded(
                self.options.max_requests,
                self.options.time_window,
            ));
        }

        window.push_back(now);
        let in_window = window.len();
        drop(window);

        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        debug!(in_window, "Request admitted");
        Ok(())
    }

    fn purge(window: &mut VecDeque<Instant>, now: Instant, time_window: Duration) {
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= time_window {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_concurrent(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> RateLimiterStats {
        let current_requests = {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            Self::purge(&mut window, Instant::now(), self.options.time_window);
            window.len()
        };

        let window_secs = self.options.time_window.as_secs_f64();
        let current_rate = if window_secs > 0.0 {
            current_requests as f64 / window_secs
        } else {
            0.0
        };

        let total_requests = self.stats.total_requests.load(Ordering::Relaxed);
        let avg_wait_ms = if total_requests > 0 {
            self.stats.total_wait_micros.load(Ordering::Relaxed) as f64
                / total_requests as f64
                / 1000.0
        } else {
            0.0
        };

        RateLimiterStats {
            max_requests: self.options.max_requests,
            time_window_secs: self.options.time_window.as_secs(),
            max_concurrent: self.options.max_concurrent,
            max_wait_secs: self.options.max_wait.as_secs(),
            current_requests,
            current_rate,
            current_concurrent: self.current_concurrent(),
            max_concurrent_reached: self.stats.max_concurrent_reached.load(Ordering::Relaxed),
            total_requests,
            rejected_rate_limit: self.stats.rejected_rate_limit.load(Ordering::Relaxed),
            rejected_timeout: self.stats.rejected_timeout.load(Ordering::Relaxed),
            avg_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: usize, window_ms: u64, max_concurrent: usize) -> RateLimiter {
        RateLimiter::new(RateLimiterOptions {
            max_requests,
            time_window: Duration::from_millis(window_ms),
            max_concurrent,
            max_wait: Duration::from_millis(100),
        })
    }

    #[test]
    fn test_purge_keeps_only_trailing_window() {
        let now = Instant::now();
        let mut window: VecDeque<Instant> = VecDeque::new();
        window.push_back(now);
        window.push_back(now + Duration::from_millis(500));
        window.push_back(now + Duration::from_millis(900));

        RateLimiter::purge(
            &mut window,
            now + Duration::from_millis(1500),
            Duration::from_secs(1),
        );
        assert_eq!(window.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rejects_then_recovers() {
        let limiter = limiter(5, 1000, 10);
        for _ in 0..5 {
            drop(limiter.acquire().await.unwrap());
        }

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::RateLimitExceeded { .. }));
        assert!(err.is_rejection());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.acquire().await.is_ok());

        let stats = limiter.metrics();
        assert_eq!(stats.total_requests, 6);
        assert_eq!(stats.rejected_rate_limit, 1);
        assert_eq!(stats.current_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_gate_times_out() {
        let limiter = limiter(100, 60_000, 1);
        let held = limiter.acquire().await.unwrap();

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::ConcurrencyTimeout { .. }));
        assert_eq!(limiter.metrics().rejected_timeout, 1);

        drop(held);
        let _again = limiter.acquire().await.unwrap();
        assert_eq!(limiter.current_concurrent(), 1);
        assert_eq!(limiter.metrics().max_concurrent_reached, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_leak_slot() {
        let limiter = Arc::new(limiter(100, 60_000, 1));
        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert_eq!(limiter.current_concurrent(), 0);
        let _permit = limiter.acquire().await.unwrap();
        assert_eq!(limiter.current_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_rate_over_window() {
        let limiter = limiter(100, 10_000, 10);
        for _ in 0..20 {
            drop(limiter.acquire().await.unwrap());
        }
        let stats = limiter.metrics();
        assert_eq!(stats.current_requests, 20);
        assert!((stats.current_rate - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.current_concurrent, 0);
    }
}
