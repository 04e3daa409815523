//! The access layer as one context object.
//!
//! [`DataAccess`] owns the topology, the router and both admission gates. It
//! is built once and passed explicitly to whatever needs database access;
//! there is no process-wide instance.

use crate::admission::{
    ConcurrencyManager, ConcurrencyOptions, RateLimiter, RateLimiterOptions, RetryPolicy,
};
use crate::config::{Config, DatabaseConfig, ReplicaConfig};
use crate::db::executor;
use crate::db::router::{Router, RouterOptions, Statement};
use crate::db::session::{SessionBinding, SessionOptions};
use crate::db::topology::{Topology, TopologyOptions};
use crate::error::DbResult;
use crate::models::{ExecuteResult, QueryParam, StatusSnapshot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Settings for every component of the access layer.
#[derive(Debug, Clone)]
pub struct AccessOptions {
    pub topology: TopologyOptions,
    pub router: RouterOptions,
    pub session: SessionOptions,
    pub rate_limiter: RateLimiterOptions,
    pub concurrency: ConcurrencyOptions,
    pub retry: RetryPolicy,
    pub query_timeout: Duration,
}

impl Default for AccessOptions {
    fn default() -> Self {
        Self {
            topology: TopologyOptions::default(),
            router: RouterOptions::default(),
            session: SessionOptions::default(),
            rate_limiter: RateLimiterOptions::default(),
            concurrency: ConcurrencyOptions::default(),
            retry: RetryPolicy::default(),
            query_timeout: Duration::from_secs(crate::config::DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }
}

impl From<&Config> for AccessOptions {
    fn from(config: &Config) -> Self {
        Self {
            topology: TopologyOptions {
                read_strategy: config.read_strategy,
                health_check_interval: config.health_check_interval_duration(),
            },
            router: RouterOptions {
                force_master_keywords: config.force_master_keywords.clone(),
                force_master_tables: config.force_master_tables.clone(),
                allow_replica_lag: config.allow_replica_lag,
                transaction_route_to_master: config.transaction_route_to_master,
            },
            session: SessionOptions {
                sticky_master: config.sticky_master,
                track_queries: config.track_queries,
            },
            rate_limiter: RateLimiterOptions {
                max_requests: config.max_requests,
                time_window: Duration::from_secs(config.rate_window),
                max_concurrent: config.max_concurrent,
                max_wait: Duration::from_secs(config.max_wait),
            },
            concurrency: ConcurrencyOptions {
                max_concurrent_transactions: config.max_transactions,
                lock_timeout: Duration::from_secs(config.lock_timeout),
                slot_wait: Duration::from_secs(config.slot_wait),
            },
            retry: RetryPolicy::new(
                config.retry_attempts,
                Duration::from_millis(config.retry_initial_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            query_timeout: config.query_timeout_duration(),
        }
    }
}

/// Per-call options for [`DataAccess::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Route as if inside a transaction.
    pub in_transaction: bool,
    /// Resources locked for the duration of the call.
    pub resource_keys: Vec<String>,
    pub lock_timeout: Option<Duration>,
    /// Skip classification when the caller already knows.
    pub is_write: Option<bool>,
}

impl ExecuteOptions {
    pub fn write() -> Self {
        Self {
            is_write: Some(true),
            ..Default::default()
        }
    }

    pub fn read() -> Self {
        Self {
            is_write: Some(false),
            ..Default::default()
        }
    }

    pub fn with_resources<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug)]
pub struct DataAccess {
    topology: Arc<Topology>,
    router: Arc<Router>,
    rate_limiter: Arc<RateLimiter>,
    concurrency: ConcurrencyManager,
    options: AccessOptions,
}

impl DataAccess {
    /// Connect the primary and the replicas and start the background tasks.
    pub async fn start(
        options: AccessOptions,
        primary: DatabaseConfig,
        replicas: Vec<ReplicaConfig>,
    ) -> DbResult<Self> {
        let topology = Topology::start(
            primary,
            replicas,
            options.topology.clone(),
            options.retry,
        )
        .await?;

        match Self::with_topology(Arc::clone(&topology), options) {
            Ok(access) => Ok(access),
            Err(e) => {
                topology.stop().await;
                Err(e)
            }
        }
    }

    /// Build on an already started topology.
    pub fn with_topology(topology: Arc<Topology>, options: AccessOptions) -> DbResult<Self> {
        let router = Arc::new(Router::new(Arc::clone(&topology), options.router.clone())?);
        info!(
            max_requests = options.rate_limiter.max_requests,
            max_concurrent = options.rate_limiter.max_concurrent,
            max_transactions = options.concurrency.max_concurrent_transactions,
            "Data access ready"
        );
        Ok(Self {
            topology,
            router,
            rate_limiter: Arc::new(RateLimiter::new(options.rate_limiter.clone())),
            concurrency: ConcurrencyManager::new(options.concurrency.clone()),
            options,
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    pub fn options(&self) -> &AccessOptions {
        &self.options
    }

    /// Run one statement: admission, optional resource locks, routing,
    /// execution.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: ExecuteOptions,
    ) -> DbResult<ExecuteResult> {
        let _permit = self.rate_limiter.acquire().await?;

        let _guard = if options.resource_keys.is_empty() {
            None
        } else {
            let transaction_id = uuid::Uuid::new_v4().to_string();
            let guard = self
                .concurrency
                .acquire(
                    &transaction_id,
                    options.resource_keys.iter().cloned(),
                    options.lock_timeout,
                )
                .await
                .inspect_err(|e| {
                    // One-shot id: forget its wait-for edges.
                    self.concurrency.release(&transaction_id);
                    warn!(
                        transaction_id = %transaction_id,
                        resources = ?options.resource_keys,
                        error = %e,
                        "Statement refused"
                    );
                })?;
            Some(guard)
        };

        let statement = match options.is_write {
            Some(is_write) => Statement::Preclassified { is_write },
            None => Statement::Sql(sql),
        };
        let pool = self.router.route(statement, options.in_transaction);

        let mut conn = pool.acquire().await?;
        let start = Instant::now();
        let result =
            executor::execute(conn.connection_mut(), sql, params, self.options.query_timeout)
                .await;
        pool.record_query(start.elapsed());

        if let Err(e) = &result {
            debug!(pool = %pool.name(), error = %e, "Statement failed");
        }
        result
    }

    /// A session bound to a replica chosen now. Each of its statements passes
    /// the rate limiter.
    pub fn session(&self) -> SessionBinding {
        SessionBinding::new(
            Arc::clone(&self.router),
            self.options.session.clone(),
            self.options.query_timeout,
        )
        .with_rate_limiter(Arc::clone(&self.rate_limiter))
    }

    /// Open a session with a transaction on the primary.
    ///
    /// The session holds an admission permit and a transaction slot with
    /// `resource_keys` locked until it commits, rolls back, closes or drops.
    pub async fn begin_transaction<I, S>(&self, resource_keys: I) -> DbResult<SessionBinding>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permit = self.rate_limiter.acquire().await?;
        let mut session = self.session();
        let guard = self
            .concurrency
            .acquire(session.id(), resource_keys, None)
            .await
            .inspect_err(|_| {
                self.concurrency.release(session.id());
            })?;
        session.hold(permit, guard);
        session.begin().await?;
        Ok(session)
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            pool: self.topology.primary().status(),
            replicas: self.topology.replica_status(),
            router: self.router.metrics(),
            concurrency: self.concurrency.stats(),
            rate_limiter: self.rate_limiter.metrics(),
            taken_at: chrono::Utc::now(),
        }
    }

    pub async fn stop(&self) {
        self.topology.stop().await;
        info!("Data access stopped");
    }
}
