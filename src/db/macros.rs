//! Database dispatch macros.
//!
//! Pools, connections and transactions are wrapped in one enum variant per
//! backend. These macros expand the repetitive three-way match.

/// Match a `DbPool` and evaluate the same body for every backend.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Same as [`impl_db_dispatch!`] for a body that is identical on every
/// backend, over any of the per-backend wrapper enums.
#[macro_export]
macro_rules! each_backend {
    ($enum:ident, $value:expr, $p:ident => $body:expr) => {
        match $value {
            $crate::db::pool::$enum::MySql($p) => $body,
            $crate::db::pool::$enum::Postgres($p) => $body,
            $crate::db::pool::$enum::SQLite($p) => $body,
        }
    };
}

pub use each_backend;
pub use impl_db_dispatch;
