//! Read replica: an [`AdaptivePool`] plus replication-lag tracking.

use crate::admission::RetryPolicy;
use crate::config::ReplicaConfig;
use crate::db::adaptive::AdaptivePool;
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::ReplicaStatus;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, PgPool, Row};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Replication lag of a PostgreSQL standby in seconds. 0 on a primary.
const PG_LAG_QUERY: &str = "SELECT CASE WHEN pg_is_in_recovery() \
     THEN COALESCE(EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())), 0)::float8 \
     ELSE 0::float8 END";

#[derive(Debug, Clone)]
struct ProbeState {
    available: bool,
    lag_secs: Option<u64>,
    last_probe_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct ReplicaNode {
    name: String,
    pool: Arc<AdaptivePool>,
    weight: u32,
    max_lag_secs: u64,
    state: RwLock<ProbeState>,
}

impl ReplicaNode {
    /// Connect the replica's pool.
    ///
    /// Connection failures are reported as `ReplicaUnavailable`.
    pub async fn start(config: &ReplicaConfig, retry: RetryPolicy) -> DbResult<Arc<Self>> {
        let pool = AdaptivePool::start(config.database.clone(), retry)
            .await
            .map_err(|e| DbError::replica_unavailable(config.name(), e.to_string()))?;
        info!(
            replica = %config.name(),
            weight = config.weight,
            max_lag_secs = config.max_lag_secs,
            "Replica started"
        );
        Ok(Arc::new(Self::new(pool, config.weight, config.max_lag_secs)))
    }

    /// Wrap an existing pool. The node is available until a probe says
    /// otherwise.
    pub fn new(pool: Arc<AdaptivePool>, weight: u32, max_lag_secs: u64) -> Self {
        Self {
            name: pool.name().to_string(),
            pool,
            weight,
            max_lag_secs,
            state: RwLock::new(ProbeState {
                available: true,
                lag_secs: None,
                last_probe_at: None,
                last_error: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<AdaptivePool> {
        &self.pool
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_lag_secs(&self) -> u64 {
        self.max_lag_secs
    }

    fn state(&self) -> ProbeState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_available(&self) -> bool {
        self.state().available
    }

    /// Last observed lag. None until the first successful probe.
    pub fn lag_secs(&self) -> Option<u64> {
        self.state().lag_secs
    }

    /// Whether the observed lag is within `bound` seconds. A node never probed
    /// counts as lag 0.
    pub fn lag_within(&self, bound: u64) -> bool {
        self.lag_secs().unwrap_or(0) <= bound
    }

    /// Record the outcome of a probe and return the new availability.
    pub fn record_probe(&self, outcome: &DbResult<u64>) -> bool {
        let (was, now) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let was = state.available;
            state.last_probe_at = Some(Utc::now());
            match outcome {
                Ok(lag) => {
                    state.lag_secs = Some(*lag);
                    state.available = *lag <= self.max_lag_secs;
                    state.last_error = None;
                }
                Err(e) => {
                    state.available = false;
                    state.last_error = Some(e.to_string());
                }
            }
            (was, state.available)
        };

        match (was, now) {
            (false, true) => info!(replica = %self.name, "Replica available again"),
            (true, false) => match outcome {
                Ok(lag) => warn!(
                    replica = %self.name,
                    lag_secs = *lag,
                    max_lag_secs = self.max_lag_secs,
                    "Replica lagging, taken out of rotation"
                ),
                Err(e) => warn!(replica = %self.name, error = %e, "Replica unavailable"),
            },
            _ => {}
        }
        now
    }

    /// Query the replication lag once.
    pub async fn probe_lag(&self) -> DbResult<u64> {
        let lag = match self.pool.physical() {
            DbPool::MySql(p) => mysql_lag(&p).await,
            DbPool::Postgres(p) => postgres_lag(&p).await,
            DbPool::SQLite(p) => sqlx::query("SELECT 1").execute(&p).await.map(|_| 0),
        };
        lag.map_err(|e| DbError::replica_unavailable(&self.name, e.to_string()))
    }

    /// Probe under `retry` and record the final outcome.
    pub async fn check_health(&self, retry: &RetryPolicy) -> bool {
        let outcome = retry.run("replica probe", || self.probe_lag()).await;
        if let Ok(lag) = &outcome {
            debug!(replica = %self.name, lag_secs = *lag, "Replica probed");
        }
        self.record_probe(&outcome)
    }

    pub fn status(&self) -> ReplicaStatus {
        let state = self.state();
        ReplicaStatus {
            available: state.available,
            lag_secs: state.lag_secs,
            max_lag_secs: self.max_lag_secs,
            weight: self.weight,
            last_probe_at: state.last_probe_at,
            last_error: state.last_error,
            pool: self.pool.status(),
        }
    }

    pub async fn stop(&self) {
        self.pool.stop().await;
        info!(replica = %self.name, "Replica stopped");
    }
}

async fn mysql_lag(pool: &MySqlPool) -> Result<u64, sqlx::Error> {
    use sqlx::Executor;

    // Not a replica: no status row.
    let Some(row) = pool.fetch_optional("SHOW SLAVE STATUS").await? else {
        return Ok(0);
    };
    let lag = match row.try_get::<Option<u64>, _>("Seconds_Behind_Master") {
        Ok(lag) => lag,
        Err(_) => row
            .try_get::<Option<i64>, _>("Seconds_Behind_Master")?
            .map(|secs| secs.max(0) as u64),
    };
    Ok(lag.unwrap_or(0))
}

async fn postgres_lag(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let secs: f64 = sqlx::query_scalar(PG_LAG_QUERY).fetch_one(pool).await?;
    Ok(secs.max(0.0) as u64)
}
