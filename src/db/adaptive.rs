//! Self-resizing connection pool.
//!
//! An [`AdaptivePool`] is one logical endpoint. It owns the current generation
//! of a physical [`DbPool`] and a background scaler that grows or shrinks it by
//! `scale_step` connections based on utilization (active / size).
//!
//! sqlx pools cannot change their maximum size after creation, so a resize
//! builds a new generation at the target size, swaps it in and closes the old
//! one in the background. `DbPool::close` waits for checked-out connections to
//! come back, so nothing is closed under a caller.

use crate::admission::RetryPolicy;
use crate::config::{DatabaseConfig, PoolOptions};
use crate::db::pool::{DbConnection, DbPool, DbTransaction};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, PoolStatus};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Scaling bounds and thresholds of one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_size: u32,
    pub max_size: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_step: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Grow(u32),
    Shrink(u32),
}

impl ScalingPolicy {
    pub fn from_options(options: &PoolOptions) -> Self {
        let max_size = options.max_connections_or_default();
        Self {
            min_size: options.min_connections_or_default().min(max_size),
            max_size,
            scale_up_threshold: options.scale_up_threshold_or_default(),
            scale_down_threshold: options.scale_down_threshold_or_default(),
            scale_step: options.scale_step_or_default().max(1),
            cooldown: options.scale_cooldown_or_default(),
        }
    }

    pub fn clamp(&self, size: u32) -> u32 {
        size.clamp(self.min_size, self.max_size)
    }

    pub fn utilization(active: usize, size: u32) -> f64 {
        if size == 0 {
            0.0
        } else {
            active as f64 / size as f64
        }
    }

    /// Decide the next size.
    ///
    /// `since_last_scale` is None when the pool never resized; the cooldown is
    /// then considered elapsed.
    pub fn decide(
        &self,
        active: usize,
        size: u32,
        since_last_scale: Option<Duration>,
    ) -> ScaleDecision {
        let cooled_down = since_last_scale.is_none_or(|elapsed| elapsed > self.cooldown);
        if !cooled_down {
            return ScaleDecision::Hold;
        }

        let utilization = Self::utilization(active, size);
        if utilization >= self.scale_up_threshold && size < self.max_size {
            ScaleDecision::Grow(size.saturating_add(self.scale_step).min(self.max_size))
        } else if utilization <= self.scale_down_threshold && size > self.min_size {
            ScaleDecision::Shrink(size.saturating_sub(self.scale_step).max(self.min_size))
        } else {
            ScaleDecision::Hold
        }
    }
}

#[derive(Debug)]
struct Generation {
    pool: DbPool,
    size: u32,
}

#[derive(Debug, Default)]
struct PoolCounters {
    total_queries: AtomicU64,
    total_query_micros: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    resize_failures: AtomicU64,
    acquire_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct LastScale {
    at: Instant,
    wall: DateTime<Utc>,
}

/// Counts one checked-out connection for as long as it lives.
#[derive(Debug)]
struct ActiveLease {
    active: Arc<AtomicUsize>,
}

impl ActiveLease {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        // Saturating decrement
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// A connection checked out of an [`AdaptivePool`]. Returned on drop.
#[derive(Debug)]
pub struct PooledConnection {
    conn: DbConnection,
    _lease: ActiveLease,
}

impl PooledConnection {
    pub fn connection_mut(&mut self) -> &mut DbConnection {
        &mut self.conn
    }

    pub fn db_type(&self) -> DatabaseType {
        self.conn.db_type()
    }
}

/// A transaction on an [`AdaptivePool`]. Rolled back on drop unless committed.
#[derive(Debug)]
pub struct PooledTransaction {
    tx: DbTransaction,
    _lease: ActiveLease,
}

impl PooledTransaction {
    pub fn transaction_mut(&mut self) -> &mut DbTransaction {
        &mut self.tx
    }

    pub fn db_type(&self) -> DatabaseType {
        self.tx.db_type()
    }

    pub async fn commit(self) -> DbResult<()> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> DbResult<()> {
        self.tx.rollback().await
    }
}

#[derive(Debug)]
pub struct AdaptivePool {
    name: String,
    config: DatabaseConfig,
    policy: ScalingPolicy,
    interval: Duration,
    retry: RetryPolicy,
    generation: RwLock<Arc<Generation>>,
    active: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    /// Held for the duration of a resize.
    resize_lock: tokio::sync::Mutex<()>,
    last_scale: Mutex<Option<LastScale>>,
    counters: PoolCounters,
    shutdown: watch::Sender<bool>,
    scaler: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptivePool {
    /// Build the physical pool at `min_size` and start the auto-scaler.
    pub async fn start(config: DatabaseConfig, retry: RetryPolicy) -> DbResult<Arc<Self>> {
        let pool = Self::connect(config, retry).await?;
        pool.spawn_scaler();
        Ok(pool)
    }

    /// Build the physical pool without starting the auto-scaler.
    ///
    /// Scaling is then driven by [`autoscale_once`](Self::autoscale_once).
    pub async fn connect(config: DatabaseConfig, retry: RetryPolicy) -> DbResult<Arc<Self>> {
        config
            .pool_options
            .validate()
            .map_err(DbError::configuration)?;

        let policy = ScalingPolicy::from_options(&config.pool_options);
        let size = policy.min_size;
        let pool = retry
            .run("build pool", || DbPool::connect(&config, size))
            .await?;

        info!(
            pool = %config.name,
            db_type = %pool.db_type(),
            size,
            min_size = policy.min_size,
            max_size = policy.max_size,
            "Pool started"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            name: config.name.clone(),
            interval: config.pool_options.scale_interval_or_default(),
            generation: RwLock::new(Arc::new(Generation { pool, size })),
            config,
            policy,
            retry,
            active: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
            resize_lock: tokio::sync::Mutex::new(()),
            last_scale: Mutex::new(None),
            counters: PoolCounters::default(),
            shutdown,
            scaler: Mutex::new(None),
        }))
    }

    /// Spawn the auto-scaler.
    ///
    /// The task holds a Weak reference and exits once the pool is dropped or
    /// stopped.
    fn spawn_scaler(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.interval;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let Some(pool) = weak.upgrade() else {
                    break;
                };
                // Failures are counted and logged by resize.
                let _ = pool.autoscale_once().await;
            }
            debug!(pool = %name, "Auto-scaler exiting");
        });

        *self.scaler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn current(&self) -> Arc<Generation> {
        Arc::clone(&*self.generation.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn since_last_scale(&self) -> Option<Duration> {
        self.last_scale
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|last| last.at.elapsed())
    }

    /// Run one scaling check. Returns the size after the check.
    pub async fn autoscale_once(&self) -> DbResult<u32> {
        let size = self.size();
        let active = self.active();
        match self.policy.decide(active, size, self.since_last_scale()) {
            ScaleDecision::Hold => Ok(size),
            ScaleDecision::Grow(target) | ScaleDecision::Shrink(target) => {
                debug!(
                    pool = %self.name,
                    active,
                    size,
                    target,
                    utilization = ScalingPolicy::utilization(active, size),
                    "Scaling triggered"
                );
                self.resize(target).await?;
                Ok(self.size())
            }
        }
    }

    /// Resize to `target` (clamped to the pool bounds).
    ///
    /// Returns false when the resize was skipped: another resize is in flight
    /// or the size is unchanged. On failure the current generation keeps
    /// serving.
    pub async fn resize(&self, target: u32) -> DbResult<bool> {
        let Ok(_guard) = self.resize_lock.try_lock() else {
            debug!(pool = %self.name, target, "Resize already in flight, skipping");
            return Ok(false);
        };

        let target = self.policy.clamp(target);
        let old = self.current();
        if old.size == target {
            return Ok(false);
        }

        let built = self
            .retry
            .run("resize pool", || DbPool::connect(&self.config, target))
            .await;

        let pool = match built {
            Ok(pool) => pool,
            Err(e) => {
                self.counters.resize_failures.fetch_add(1, Ordering::Relaxed);
                let err = DbError::resize_failed(&self.name, target, e.to_string());
                error!(pool = %self.name, from = old.size, target, error = %e, "Resize failed");
                return Err(err);
            }
        };

        {
            let mut generation = self
                .generation
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *generation = Arc::new(Generation { pool, size: target });
        }
        *self.last_scale.lock().unwrap_or_else(PoisonError::into_inner) = Some(LastScale {
            at: Instant::now(),
            wall: Utc::now(),
        });

        if target > old.size {
            self.counters.scale_ups.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.scale_downs.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            pool = %self.name,
            from = old.size,
            to = target,
            active = self.active(),
            "Pool resized"
        );

        let retired = old.pool.clone();
        tokio::spawn(async move {
            retired.close().await;
        });

        Ok(true)
    }

    /// Run `f` against the current generation, retrying once on the next
    /// generation if `f` hit a pool closed by a concurrent resize.
    async fn checkout<T, F, Fut>(&self, f: F) -> DbResult<(T, ActiveLease)>
    where
        F: Fn(DbPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let _waiting = WaitingGuard::enter(&self.waiting);
        let start = Instant::now();
        let generation = self.current();

        let result = match f(generation.pool.clone()).await {
            Err(sqlx::Error::PoolClosed) => {
                let latest = self.current();
                if Arc::ptr_eq(&latest, &generation) {
                    Err(sqlx::Error::PoolClosed)
                } else {
                    debug!(pool = %self.name, "Generation swapped during acquire, retrying");
                    f(latest.pool.clone()).await
                }
            }
            other => other,
        };

        match result {
            Ok(value) => Ok((value, ActiveLease::new(&self.active))),
            Err(sqlx::Error::PoolTimedOut) => {
                self.counters
                    .acquire_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                let waited = start.elapsed();
                warn!(
                    pool = %self.name,
                    waited_ms = waited.as_millis() as u64,
                    size = generation.size,
                    "Pool exhausted"
                );
                Err(DbError::pool_timeout(&self.name, waited))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check out a connection. Fails with `PoolTimeout` after the configured
    /// acquire timeout.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let (conn, lease) = self
            .checkout(|pool| async move { pool.acquire().await })
            .await?;
        Ok(PooledConnection {
            conn,
            _lease: lease,
        })
    }

    pub async fn begin(&self) -> DbResult<PooledTransaction> {
        let (tx, lease) = self
            .checkout(|pool| async move { pool.begin().await })
            .await?;
        Ok(PooledTransaction { tx, _lease: lease })
    }

    /// Round-trip `SELECT 1` on the current generation.
    pub async fn ping(&self) -> DbResult<()> {
        self.current().pool.ping().await
    }

    /// The current physical pool.
    pub fn physical(&self) -> DbPool {
        self.current().pool.clone()
    }

    pub fn record_query(&self, elapsed: Duration) {
        self.counters.total_queries.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_query_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_type(&self) -> DatabaseType {
        self.current().pool.db_type()
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn size(&self) -> u32 {
        self.current().size
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        let generation = self.current();
        let active = self.active();
        let total_queries = self.counters.total_queries.load(Ordering::Relaxed);
        let avg_query_ms = if total_queries > 0 {
            self.counters.total_query_micros.load(Ordering::Relaxed) as f64
                / total_queries as f64
                / 1000.0
        } else {
            0.0
        };
        let last_scale_at = self
            .last_scale
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|last| last.wall);

        PoolStatus {
            name: self.name.clone(),
            size: generation.size,
            min_size: self.policy.min_size,
            max_size: self.policy.max_size,
            active,
            idle: generation.pool.num_idle(),
            waiting: self.waiting.load(Ordering::Acquire),
            utilization: ScalingPolicy::utilization(active, generation.size),
            total_queries,
            avg_query_ms,
            scale_ups: self.counters.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.counters.scale_downs.load(Ordering::Relaxed),
            resize_failures: self.counters.resize_failures.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
            last_scale_at,
        }
    }

    /// Stop the auto-scaler and close the physical pool.
    ///
    /// Waits for checked-out connections to be returned.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .scaler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Wait out an in-flight resize so its generation is the one closed.
        let _guard = self.resize_lock.lock().await;
        self.current().pool.close().await;
        info!(pool = %self.name, "Pool stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.current().pool.is_closed()
    }
}
