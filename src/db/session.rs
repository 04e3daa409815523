//! Per-unit-of-work binding to the topology.
//!
//! A session is assigned a replica when it is created. Reads go to that
//! replica until the session first touches the primary; with sticky routing
//! enabled every later statement then stays on the primary, so a session
//! always reads its own writes. Inside a transaction everything runs on the
//! primary.

use crate::admission::{RateLimiter, RatePermit, TransactionGuard};
use crate::db::adaptive::{AdaptivePool, PooledTransaction};
use crate::db::executor;
use crate::db::router::Router;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteResult, QueryParam, SessionStats};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Keep using the primary once the session has used it.
    pub sticky_master: bool,
    pub track_queries: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sticky_master: true,
            track_queries: true,
        }
    }
}

#[derive(Debug)]
pub struct SessionBinding {
    id: String,
    router: Arc<Router>,
    primary: Arc<AdaptivePool>,
    replica: Option<Arc<AdaptivePool>>,
    options: SessionOptions,
    query_timeout: Duration,
    transaction: Option<PooledTransaction>,
    used_primary: bool,
    stats: SessionStats,
    limiter: Option<Arc<RateLimiter>>,
    // Released at commit, rollback, close or drop.
    permit: Option<RatePermit>,
    guard: Option<TransactionGuard>,
}

impl SessionBinding {
    pub fn new(router: Arc<Router>, options: SessionOptions, query_timeout: Duration) -> Self {
        let primary = router.topology().write_pool();
        let read = router.topology().read_pool();
        let replica = (!Arc::ptr_eq(&read, &primary)).then_some(read);

        let id = uuid::Uuid::new_v4().to_string();
        debug!(
            session_id = %id,
            replica = replica.as_ref().map(|p| p.name()).unwrap_or("none"),
            "Session opened"
        );

        Self {
            id,
            router,
            primary,
            replica,
            options,
            query_timeout,
            transaction: None,
            used_primary: false,
            stats: SessionStats::default(),
            limiter: None,
            permit: None,
            guard: None,
        }
    }

    /// Admit every statement of this session through `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Hand the admission permit and resource locks to the session.
    pub(crate) fn hold(&mut self, permit: RatePermit, guard: TransactionGuard) {
        self.permit = Some(permit);
        self.guard = Some(guard);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn used_primary(&self) -> bool {
        self.used_primary
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// The replica assigned at creation, if any.
    pub fn replica(&self) -> Option<&Arc<AdaptivePool>> {
        self.replica.as_ref()
    }

    /// Pool serving read-only work right now.
    pub fn active_pool(&self) -> &Arc<AdaptivePool> {
        if self.transaction.is_some() {
            return &self.primary;
        }
        if self.options.sticky_master && self.used_primary {
            return &self.primary;
        }
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    /// Admission for one statement. A session holding a permit only passes
    /// the rate gate; otherwise the statement takes its own permit.
    async fn admit(&self) -> DbResult<Option<RatePermit>> {
        match &self.limiter {
            None => Ok(None),
            Some(limiter) if self.permit.is_some() => limiter.admit().map(|()| None),
            Some(limiter) => limiter.acquire().await.map(Some),
        }
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        let _permit = self.admit().await?;
        let is_write = self.router.is_write(sql);
        let pool = if is_write {
            Arc::clone(&self.primary)
        } else {
            Arc::clone(self.active_pool())
        };
        let on_primary = Arc::ptr_eq(&pool, &self.primary);

        if self.options.track_queries {
            self.stats.total_queries += 1;
            if is_write {
                self.stats.write_queries += 1;
            } else {
                self.stats.read_queries += 1;
            }
            if on_primary {
                self.stats.primary_queries += 1;
            } else {
                self.stats.replica_queries += 1;
            }
        }
        if on_primary {
            self.used_primary = true;
        }

        debug!(
            session_id = %self.id,
            is_write,
            pool = %pool.name(),
            in_transaction = self.transaction.is_some(),
            "Session statement"
        );

        let start = Instant::now();
        let result = match self.transaction.as_mut() {
            Some(tx) => {
                executor::execute_in_transaction(
                    tx.transaction_mut(),
                    sql,
                    params,
                    self.query_timeout,
                )
                .await
            }
            None => {
                let mut conn = pool.acquire().await?;
                executor::execute(conn.connection_mut(), sql, params, self.query_timeout).await
            }
        };
        pool.record_query(start.elapsed());
        result
    }

    /// Open a transaction on the primary.
    pub async fn begin(&mut self) -> DbResult<()> {
        if self.transaction.is_some() {
            return Err(DbError::transaction(
                "A transaction is already open",
                &self.id,
            ));
        }
        self.transaction = Some(self.primary.begin().await?);
        self.used_primary = true;
        info!(session_id = %self.id, "Transaction started");
        Ok(())
    }

    fn take_transaction(&mut self) -> DbResult<PooledTransaction> {
        self.transaction
            .take()
            .ok_or_else(|| DbError::transaction("No open transaction", &self.id))
    }

    fn release_admission(&mut self) {
        self.guard.take();
        self.permit.take();
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let tx = self.take_transaction()?;
        let result = tx.commit().await;
        self.release_admission();
        match &result {
            Ok(()) => info!(session_id = %self.id, "Transaction committed"),
            Err(e) => warn!(session_id = %self.id, error = %e, "Commit failed"),
        }
        result
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        let tx = self.take_transaction()?;
        let result = tx.rollback().await;
        self.release_admission();
        info!(session_id = %self.id, "Transaction rolled back");
        result
    }

    /// End the session, rolling back an open transaction.
    pub async fn close(mut self) -> DbResult<()> {
        let result = match self.transaction.take() {
            Some(tx) => {
                warn!(session_id = %self.id, "Closing session with open transaction, rolling back");
                tx.rollback().await
            }
            None => Ok(()),
        };
        self.release_admission();
        debug!(session_id = %self.id, stats = ?self.stats, "Session closed");
        result
    }
}
