//! Statement execution on a checked-out connection or an open transaction.
//!
//! Statements that produce rows (`SELECT`, `WITH`, `SHOW`, ... or anything
//! with a `RETURNING` clause) are fetched and decoded to JSON; everything else
//! reports the affected row count. Every statement runs under a timeout.
//!
//! Database-specific code lives in the `mysql`, `postgres` and `sqlite`
//! submodules, which are generated from one template.

use crate::db::pool::{DbConnection, DbTransaction};
use crate::db::rows::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteResult, QueryParam, QueryResult};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Leading keywords of statements that return a result set.
const ROW_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "PRAGMA", "EXPLAIN", "DESCRIBE", "DESC", "VALUES", "TABLE",
];

/// Whether `sql` returns rows rather than an affected-row count.
pub fn produces_rows(sql: &str) -> bool {
    let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let first = trimmed
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();

    if ROW_KEYWORDS
        .iter()
        .any(|keyword| first.eq_ignore_ascii_case(keyword))
    {
        return true;
    }

    sql.to_ascii_uppercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| word == "RETURNING")
}

/// Run a statement on a pooled connection.
pub async fn execute(
    conn: &mut DbConnection,
    sql: &str,
    params: &[QueryParam],
    query_timeout: Duration,
) -> DbResult<ExecuteResult> {
    debug!(sql = %sql, params = params.len(), "Executing statement");
    let start = Instant::now();
    match conn {
        DbConnection::MySql(c) => mysql::run(&mut **c, sql, params, query_timeout, start).await,
        DbConnection::Postgres(c) => {
            postgres::run(&mut **c, sql, params, query_timeout, start).await
        }
        DbConnection::SQLite(c) => sqlite::run(&mut **c, sql, params, query_timeout, start).await,
    }
}

/// Run a statement inside an open transaction.
pub async fn execute_in_transaction(
    tx: &mut DbTransaction,
    sql: &str,
    params: &[QueryParam],
    query_timeout: Duration,
) -> DbResult<ExecuteResult> {
    debug!(sql = %sql, params = params.len(), "Executing statement in transaction");
    let start = Instant::now();
    match tx {
        DbTransaction::MySql(t) => mysql::run(&mut **t, sql, params, query_timeout, start).await,
        DbTransaction::Postgres(t) => {
            postgres::run(&mut **t, sql, params, query_timeout, start).await
        }
        DbTransaction::SQLite(t) => sqlite::run(&mut **t, sql, params, query_timeout, start).await,
    }
}

fn rows_result<R: RowToJson>(rows: Vec<R>, start: Instant) -> ExecuteResult {
    let columns = rows.first().map(R::column_names).unwrap_or_default();
    let rows = rows.iter().map(R::to_json_map).collect();
    ExecuteResult::Rows(QueryResult {
        columns,
        rows,
        execution_time_ms: start.elapsed().as_millis() as u64,
    })
}

fn timeout_error(query_timeout: Duration) -> DbError {
    DbError::timeout("statement execution", query_timeout.as_secs() as u32)
}

/// Bind every parameter in order.
macro_rules! bind_params {
    ($query:expr, $params:expr, json => |$v:ident| $json:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Json($v) => query.bind($json),
            };
        }
        query
    }};
}

macro_rules! backend_executor {
    ($module:ident, $db:ty, $conn:ty, json => |$v:ident| $json:expr) => {
        mod $module {
            use super::*;
            use sqlx::Executor;

            pub async fn run(
                conn: &mut $conn,
                sql: &str,
                params: &[QueryParam],
                query_timeout: Duration,
                start: Instant,
            ) -> DbResult<ExecuteResult> {
                if produces_rows(sql) {
                    // Without parameters, send raw SQL so statements that cannot
                    // be prepared still run.
                    let fetched = if params.is_empty() {
                        timeout(query_timeout, (&mut *conn).fetch_all(sql)).await
                    } else {
                        let query =
                            bind_params!(sqlx::query::<$db>(sql), params, json => |$v| $json);
                        timeout(query_timeout, query.fetch_all(&mut *conn)).await
                    };
                    match fetched {
                        Ok(Ok(rows)) => Ok(rows_result(rows, start)),
                        Ok(Err(e)) => Err(DbError::from(e)),
                        Err(_) => Err(timeout_error(query_timeout)),
                    }
                } else {
                    let done = if params.is_empty() {
                        timeout(query_timeout, (&mut *conn).execute(sql)).await
                    } else {
                        let query =
                            bind_params!(sqlx::query::<$db>(sql), params, json => |$v| $json);
                        timeout(query_timeout, query.execute(&mut *conn)).await
                    };
                    match done {
                        Ok(Ok(done)) => Ok(ExecuteResult::RowsAffected {
                            rows_affected: done.rows_affected(),
                            execution_time_ms: start.elapsed().as_millis() as u64,
                        }),
                        Ok(Err(e)) => Err(DbError::from(e)),
                        Err(_) => Err(timeout_error(query_timeout)),
                    }
                }
            }
        }
    };
}

backend_executor!(mysql, sqlx::MySql, sqlx::MySqlConnection, json => |v| sqlx::types::Json(v));
backend_executor!(postgres, sqlx::Postgres, sqlx::PgConnection, json => |v| sqlx::types::Json(v));
// SQLite has no native JSON type; store the text form.
backend_executor!(sqlite, sqlx::Sqlite, sqlx::SqliteConnection, json => |v| v.to_string());
