//! db-router library.
//!
//! An adaptive database access layer over sqlx (SQLite, PostgreSQL, MySQL):
//! self-resizing connection pools, replica-aware read routing with failover,
//! session stickiness, and admission control (rate limiting, bounded
//! transaction concurrency with resource locks and deadlock detection).

pub mod admission;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{DbError, DbResult, ErrorKind};
pub use service::{AccessOptions, DataAccess, ExecuteOptions};
