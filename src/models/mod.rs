//! Data models shared across db-router.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod status;

// Re-export commonly used types
pub use connection::{DatabaseType, mask_connection_string};
pub use query::{ExecuteResult, QueryParam, QueryResult};
pub use status::{
    ConcurrencyStats, PoolStatus, RateLimiterStats, ReplicaStatus, RouterMetrics, SessionStats,
    StatusSnapshot,
};
