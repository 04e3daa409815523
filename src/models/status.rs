//! Serializable status snapshots.
//!
//! Each component reports its own section; [`StatusSnapshot`] groups them for
//! the status log line and for embedders exposing health endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Utilization and scaling counters of one adaptive pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    /// active / size
    pub utilization: f64,
    pub total_queries: u64,
    pub avg_query_ms: f64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub resize_failures: u64,
    pub acquire_timeouts: u64,
    pub last_scale_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub available: bool,
    /// Last observed replication lag in seconds. None until a probe succeeds.
    pub lag_secs: Option<u64>,
    pub max_lag_secs: u64,
    pub weight: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pool: PoolStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterMetrics {
    pub cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub force_master_keywords: Vec<String>,
    pub force_master_tables: Vec<String>,
    pub allow_replica_lag: u64,
    pub transaction_route_to_master: bool,
}

/// Per-session query counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total_queries: u64,
    pub read_queries: u64,
    pub write_queries: u64,
    pub primary_queries: u64,
    pub replica_queries: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConcurrencyStats {
    pub max_concurrent_transactions: usize,
    pub active_locks: usize,
    pub active_transactions: usize,
    pub total_transactions: u64,
    pub max_concurrent_reached: usize,
    pub lock_timeouts: u64,
    pub lock_conflicts: u64,
    pub deadlocks_detected: u64,
    pub slot_timeouts: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub max_requests: usize,
    pub time_window_secs: u64,
    pub max_concurrent: usize,
    pub max_wait_secs: u64,
    /// Admissions inside the trailing window
    pub current_requests: usize,
    /// Admissions per second over the window
    pub current_rate: f64,
    pub current_concurrent: usize,
    pub max_concurrent_reached: usize,
    pub total_requests: u64,
    pub rejected_rate_limit: u64,
    pub rejected_timeout: u64,
    pub avg_wait_ms: f64,
}

/// Everything the access layer reports about itself.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub pool: PoolStatus,
    pub replicas: BTreeMap<String, ReplicaStatus>,
    pub router: RouterMetrics,
    pub concurrency: ConcurrencyStats,
    pub rate_limiter: RateLimiterStats,
    pub taken_at: DateTime<Utc>,
}
