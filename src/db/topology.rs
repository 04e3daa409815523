//! Read/write topology: one primary pool and the read replicas.
//!
//! Writes always go to the primary. Reads are spread over the replicas that
//! are currently available according to the configured [`ReadStrategy`]; when
//! no replica qualifies, reads fail over to the primary.

use crate::admission::RetryPolicy;
use crate::config::{DatabaseConfig, ReadStrategy, ReplicaConfig};
use crate::db::adaptive::AdaptivePool;
use crate::db::replica::ReplicaNode;
use crate::error::{DbError, DbResult};
use crate::models::ReplicaStatus;
use futures_util::future::join_all;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TopologyOptions {
    pub read_strategy: ReadStrategy,
    pub health_check_interval: Duration,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            read_strategy: ReadStrategy::default(),
            health_check_interval: Duration::from_secs(
                crate::config::DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            ),
        }
    }
}

impl TopologyOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.health_check_interval.is_zero() {
            return Err("health_check_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Pick an index among `weights.len()` candidates.
///
/// `cursor` is the persistent round-robin position. Callers guarantee at
/// least one candidate.
pub fn pick_index<R: Rng + ?Sized>(
    strategy: ReadStrategy,
    weights: &[u32],
    cursor: &AtomicUsize,
    rng: &mut R,
) -> usize {
    let count = weights.len();
    if count <= 1 {
        return 0;
    }

    match strategy {
        ReadStrategy::Random => 0,
        ReadStrategy::RoundRobin => {
            let previous = cursor
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % count))
                .unwrap_or_else(|c| c);
            (previous + 1) % count
        }
        ReadStrategy::Weighted => {
            let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
            if total == 0 {
                return 0;
            }
            let mut remaining = rng.gen_range(0.0..total as f64);
            for (idx, &weight) in weights.iter().enumerate() {
                remaining -= f64::from(weight);
                if remaining < 0.0 {
                    return idx;
                }
            }
            count - 1
        }
    }
}

#[derive(Debug)]
pub struct Topology {
    primary: Arc<AdaptivePool>,
    replicas: Vec<Arc<ReplicaNode>>,
    options: TopologyOptions,
    retry: RetryPolicy,
    cursor: AtomicUsize,
    failed_over: AtomicBool,
    shutdown: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Topology {
    /// Connect the primary and every replica, probe once, and start the
    /// health monitor.
    ///
    /// The primary failing aborts startup. A replica that cannot be connected
    /// is skipped.
    pub async fn start(
        primary: DatabaseConfig,
        replicas: Vec<ReplicaConfig>,
        options: TopologyOptions,
        retry: RetryPolicy,
    ) -> DbResult<Arc<Self>> {
        options.validate().map_err(DbError::configuration)?;
        let primary = AdaptivePool::start(primary, retry).await?;

        let mut nodes = Vec::with_capacity(replicas.len());
        for config in &replicas {
            match ReplicaNode::start(config, retry).await {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(replica = %config.name(), error = %e, "Skipping replica"),
            }
        }

        let topology = Arc::new(Self::from_parts(primary, nodes, options, retry));
        topology.probe_all().await;
        topology.spawn_monitor();

        info!(
            replicas = topology.replicas.len(),
            read_strategy = %topology.options.read_strategy,
            "Topology started"
        );
        Ok(topology)
    }

    /// Assemble a topology from started pools. No monitor is spawned.
    pub fn from_parts(
        primary: Arc<AdaptivePool>,
        replicas: Vec<Arc<ReplicaNode>>,
        options: TopologyOptions,
        retry: RetryPolicy,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            primary,
            replicas,
            options,
            retry,
            cursor: AtomicUsize::new(0),
            failed_over: AtomicBool::new(false),
            shutdown,
            monitor: Mutex::new(None),
        }
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.options.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(topology) = weak.upgrade() else {
                    break;
                };
                topology.probe_all().await;
            }
            debug!("Health monitor exiting");
        });

        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Run one health round: ping the primary and probe every replica.
    pub async fn probe_all(&self) {
        if let Err(e) = self.primary.ping().await {
            warn!(pool = %self.primary.name(), error = %e, "Primary health check failed");
        }
        join_all(
            self.replicas
                .iter()
                .map(|replica| replica.check_health(&self.retry)),
        )
        .await;
    }

    pub fn primary(&self) -> &Arc<AdaptivePool> {
        &self.primary
    }

    pub fn replicas(&self) -> &[Arc<ReplicaNode>] {
        &self.replicas
    }

    pub fn replica(&self, name: &str) -> Option<&Arc<ReplicaNode>> {
        self.replicas.iter().find(|r| r.name() == name)
    }

    pub fn read_strategy(&self) -> ReadStrategy {
        self.options.read_strategy
    }

    pub fn write_pool(&self) -> Arc<AdaptivePool> {
        Arc::clone(&self.primary)
    }

    /// Choose an available replica, optionally restricted to those whose
    /// observed lag is at most `max_lag` seconds.
    pub fn select_replica(&self, max_lag: Option<u64>) -> Option<Arc<ReplicaNode>> {
        let candidates: Vec<&Arc<ReplicaNode>> = self
            .replicas
            .iter()
            .filter(|r| r.is_available())
            .filter(|r| max_lag.is_none_or(|bound| r.lag_within(bound)))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<u32> = candidates.iter().map(|r| r.weight()).collect();
        let idx = pick_index(
            self.options.read_strategy,
            &weights,
            &self.cursor,
            &mut rand::thread_rng(),
        );
        candidates.get(idx).map(|r| Arc::clone(r))
    }

    /// Pool for read-only work. Falls back to the primary when no replica is
    /// available.
    pub fn read_pool(&self) -> Arc<AdaptivePool> {
        match self.select_replica(None) {
            Some(replica) => {
                if self.failed_over.swap(false, Ordering::AcqRel) {
                    info!("Replica reads restored");
                }
                Arc::clone(replica.pool())
            }
            None => {
                if !self.replicas.is_empty() && !self.failed_over.swap(true, Ordering::AcqRel) {
                    warn!(
                        replicas = self.replicas.len(),
                        "No replica available, reads fail over to primary"
                    );
                }
                self.write_pool()
            }
        }
    }

    pub fn replica_status(&self) -> BTreeMap<String, ReplicaStatus> {
        self.replicas
            .iter()
            .map(|r| (r.name().to_string(), r.status()))
            .collect()
    }

    /// Stop the monitor and every pool.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => warn!(error = %e, "Health monitor panicked"),
                Err(_) => {}
            }
        }

        join_all(self.replicas.iter().map(|r| r.stop())).await;
        self.primary.stop().await;
        info!("Topology stopped");
    }
}
