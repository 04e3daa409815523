//! Admission control.
//!
//! - [`RateLimiter`]: sliding-window rate gate plus a bounded-wait
//!   concurrency gate
//! - [`ConcurrencyManager`]: bounded concurrent transactions with named
//!   resource locks and deadlock detection
//! - [`RetryPolicy`]: bounded exponential backoff for transient failures

pub mod concurrency;
pub mod rate_limiter;
pub mod retry;

pub use concurrency::{ConcurrencyManager, ConcurrencyOptions, TransactionGuard};
pub use rate_limiter::{RateLimiter, RateLimiterOptions, RatePermit};
pub use retry::RetryPolicy;
