//! Transaction admission and named-resource locking.
//!
//! A transaction takes one of `max_concurrent_transactions` slots the first
//! time it acquires, then holds exclusive locks on the resource keys it named.
//! All requested keys are locked together or none are. A conflicting request
//! fails fast; it is never queued behind the holder.
//!
//! Deadlocks are detected on a wait-for graph built from refused requests: a
//! transaction refused on resource R records that it waits for R's holder. A
//! later request that would close a cycle back to the requester is refused with
//! `DeadlockDetected` instead of `LockConflict`.

use crate::error::{DbError, DbResult};
use crate::models::ConcurrencyStats;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ConcurrencyOptions {
    pub max_concurrent_transactions: usize,
    /// Default lifetime of a lock.
    pub lock_timeout: Duration,
    /// How long a new transaction waits for a free slot.
    pub slot_wait: Duration,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            max_concurrent_transactions: crate::config::DEFAULT_MAX_TRANSACTIONS,
            lock_timeout: Duration::from_secs(crate::config::DEFAULT_LOCK_TIMEOUT_SECS),
            slot_wait: Duration::from_secs(crate::config::DEFAULT_SLOT_WAIT_SECS),
        }
    }
}

#[derive(Debug)]
struct ResourceLock {
    transaction_id: String,
    acquired: Instant,
    acquired_at: DateTime<Utc>,
    timeout: Duration,
}

impl ResourceLock {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.acquired) > self.timeout
    }
}

#[derive(Debug)]
struct TransactionEntry {
    resources: BTreeSet<String>,
    /// Distinguishes registrations that reuse an id.
    epoch: u64,
    /// Live guards for this registration.
    guards: usize,
    _slot: OwnedSemaphorePermit,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<String, ResourceLock>,
    transactions: HashMap<String, TransactionEntry>,
    /// transaction -> resources it was refused on
    waiting: HashMap<String, BTreeSet<String>>,
}

impl LockTable {
    /// Drop expired locks. A transaction left without locks is unregistered
    /// and its slot returned. Returns the number of locks dropped.
    fn clean_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.is_expired(now))
            .map(|(resource, _)| resource.clone())
            .collect();

        for resource in &expired {
            let Some(lock) = self.locks.remove(resource) else {
                continue;
            };
            warn!(
                resource = %resource,
                transaction_id = %lock.transaction_id,
                acquired_at = %lock.acquired_at,
                "Lock expired"
            );

            let now_empty = match self.transactions.get_mut(&lock.transaction_id) {
                Some(entry) => {
                    entry.resources.remove(resource);
                    entry.resources.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.transactions.remove(&lock.transaction_id);
                self.waiting.remove(&lock.transaction_id);
            }
        }

        expired.len()
    }

    /// Whether following wait-for edges from `holder` leads back to `requester`.
    fn reaches(&self, holder: &str, requester: &str) -> bool {
        let mut stack = vec![holder];
        let mut visited = HashSet::new();

        while let Some(tx) = stack.pop() {
            if tx == requester {
                return true;
            }
            if !visited.insert(tx) {
                continue;
            }
            if let Some(resources) = self.waiting.get(tx) {
                for resource in resources {
                    if let Some(lock) = self.locks.get(resource) {
                        stack.push(lock.transaction_id.as_str());
                    }
                }
            }
        }
        false
    }

    fn release(&mut self, transaction_id: &str) -> Option<TransactionEntry> {
        self.waiting.remove(transaction_id);
        let entry = self.transactions.remove(transaction_id)?;
        for resource in &entry.resources {
            if self
                .locks
                .get(resource)
                .is_some_and(|lock| lock.transaction_id == transaction_id)
            {
                self.locks.remove(resource);
            }
        }
        Some(entry)
    }

    /// Drop one guard of registration `epoch`. The transaction is released
    /// with its last guard.
    fn release_guard(&mut self, transaction_id: &str, epoch: u64) -> Option<TransactionEntry> {
        let entry = self
            .transactions
            .get_mut(transaction_id)
            .filter(|entry| entry.epoch == epoch)?;
        entry.guards = entry.guards.saturating_sub(1);
        if entry.guards > 0 {
            return None;
        }
        self.release(transaction_id)
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_transactions: AtomicU64,
    max_concurrent_reached: AtomicUsize,
    lock_timeouts: AtomicU64,
    lock_conflicts: AtomicU64,
    deadlocks_detected: AtomicU64,
    slot_timeouts: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    options: ConcurrencyOptions,
    table: Mutex<LockTable>,
    slots: Arc<Semaphore>,
    next_epoch: AtomicU64,
    stats: Counters,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clean_expired(&self, table: &mut LockTable) {
        let expired = table.clean_expired(Instant::now());
        if expired > 0 {
            self.stats
                .lock_timeouts
                .fetch_add(expired as u64, Ordering::Relaxed);
        }
    }

    fn release(&self, transaction_id: &str) -> bool {
        let released = self.table().release(transaction_id);
        Self::log_release(transaction_id, released)
    }

    fn release_guard(&self, transaction_id: &str, epoch: u64) -> bool {
        let released = self.table().release_guard(transaction_id, epoch);
        Self::log_release(transaction_id, released)
    }

    fn log_release(transaction_id: &str, released: Option<TransactionEntry>) -> bool {
        match released {
            Some(entry) => {
                debug!(
                    transaction_id = %transaction_id,
                    resources = entry.resources.len(),
                    "Transaction released"
                );
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyManager {
    shared: Arc<Shared>,
}

/// Registration of a transaction with the manager.
///
/// Every successful [`ConcurrencyManager::acquire`] returns a guard, including
/// re-entrant calls for an id already registered. The locks and the slot are
/// released when the last guard of the transaction goes away.
#[derive(Debug)]
pub struct TransactionGuard {
    shared: Arc<Shared>,
    transaction_id: String,
    epoch: u64,
    released: bool,
}

impl TransactionGuard {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Give up this guard now instead of on drop. Returns true when it was
    /// the last one and the transaction was released.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.shared.release_guard(&self.transaction_id, self.epoch)
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.shared.release_guard(&self.transaction_id, self.epoch);
        }
    }
}

impl ConcurrencyManager {
    pub fn new(options: ConcurrencyOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Arc::new(Semaphore::new(options.max_concurrent_transactions)),
                table: Mutex::new(LockTable::default()),
                next_epoch: AtomicU64::new(1),
                stats: Counters::default(),
                options,
            }),
        }
    }

    pub fn options(&self) -> &ConcurrencyOptions {
        &self.shared.options
    }

    /// Register `transaction_id` and lock every key in `resources`.
    ///
    /// `lock_timeout` overrides the default lock lifetime. A transaction that
    /// already holds a slot may call this again to extend its lock set; locks
    /// it already holds are refreshed. Each call returns its own guard and the
    /// whole lock set stays held until every one of them is dropped.
    pub async fn acquire<I, S>(
        &self,
        transaction_id: &str,
        resources: I,
        lock_timeout: Option<Duration>,
    ) -> DbResult<TransactionGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shared = &self.shared;
        let resources: BTreeSet<String> = resources.into_iter().map(Into::into).collect();
        let lock_timeout = lock_timeout.unwrap_or(shared.options.lock_timeout);

        let registered = {
            let mut table = shared.table();
            shared.clean_expired(&mut table);
            table.transactions.contains_key(transaction_id)
        };

        let mut slot = if registered {
            None
        } else {
            Some(self.take_slot(transaction_id).await?)
        };

        let mut table = shared.table();
        shared.clean_expired(&mut table);

        let conflicts: Vec<(String, String)> = resources
            .iter()
            .filter_map(|resource| {
                table
                    .locks
                    .get(resource)
                    .filter(|lock| lock.transaction_id != transaction_id)
                    .map(|lock| (resource.clone(), lock.transaction_id.clone()))
            })
            .collect();

        if !conflicts.is_empty() {
            if let Some((resource, holder)) = conflicts
                .iter()
                .find(|(_, holder)| table.reaches(holder, transaction_id))
            {
                shared
                    .stats
                    .deadlocks_detected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    transaction_id = %transaction_id,
                    resource = %resource,
                    holder = %holder,
                    "Deadlock detected"
                );
                return Err(DbError::deadlock(transaction_id, resource.clone()));
            }

            let (resource, holder) = conflicts[0].clone();
            table
                .waiting
                .entry(transaction_id.to_string())
                .or_default()
                .extend(conflicts.into_iter().map(|(resource, _)| resource));
            shared.stats.lock_conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(
                transaction_id = %transaction_id,
                resource = %resource,
                holder = %holder,
                "Lock conflict"
            );
            return Err(DbError::lock_conflict(resource, holder));
        }

        // The registration may have expired between the two table locks.
        if !table.transactions.contains_key(transaction_id) && slot.is_none() {
            slot = Some(
                Arc::clone(&shared.slots)
                    .try_acquire_owned()
                    .map_err(|_| DbError::concurrency_timeout("transaction", Duration::ZERO))?,
            );
        }

        let now = Instant::now();
        let acquired_at = Utc::now();
        for resource in &resources {
            table.locks.insert(
                resource.clone(),
                ResourceLock {
                    transaction_id: transaction_id.to_string(),
                    acquired: now,
                    acquired_at,
                    timeout: lock_timeout,
                },
            );
        }

        let (epoch, newly_registered) = match table.transactions.get_mut(transaction_id) {
            Some(entry) => {
                entry.resources.extend(resources.iter().cloned());
                entry.guards += 1;
                (entry.epoch, false)
            }
            None => match slot.take() {
                Some(permit) => {
                    let epoch = shared.next_epoch.fetch_add(1, Ordering::Relaxed);
                    table.transactions.insert(
                        transaction_id.to_string(),
                        TransactionEntry {
                            resources: resources.clone(),
                            epoch,
                            guards: 1,
                            _slot: permit,
                        },
                    );
                    (epoch, true)
                }
                None => (0, false),
            },
        };
        table.waiting.remove(transaction_id);
        let active = table.transactions.len();
        drop(table);

        if newly_registered {
            shared
                .stats
                .total_transactions
                .fetch_add(1, Ordering::Relaxed);
            shared
                .stats
                .max_concurrent_reached
                .fetch_max(active, Ordering::Relaxed);
        }

        info!(
            transaction_id = %transaction_id,
            resources = resources.len(),
            lock_timeout_secs = lock_timeout.as_secs(),
            "Locks acquired"
        );

        Ok(TransactionGuard {
            shared: Arc::clone(shared),
            transaction_id: transaction_id.to_string(),
            epoch,
            released: false,
        })
    }

    async fn take_slot(&self, transaction_id: &str) -> DbResult<OwnedSemaphorePermit> {
        let shared = &self.shared;
        if let Ok(permit) = Arc::clone(&shared.slots).try_acquire_owned() {
            return Ok(permit);
        }

        let start = Instant::now();
        match timeout(
            shared.options.slot_wait,
            Arc::clone(&shared.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DbError::internal("Transaction slot semaphore closed")),
            Err(_) => {
                shared.stats.slot_timeouts.fetch_add(1, Ordering::Relaxed);
                let waited = start.elapsed();
                warn!(
                    transaction_id = %transaction_id,
                    waited_ms = waited.as_millis() as u64,
                    max_concurrent_transactions = shared.options.max_concurrent_transactions,
                    "No transaction slot available"
                );
                Err(DbError::concurrency_timeout("transaction", waited))
            }
        }
    }

    /// Release every lock and the slot held by `transaction_id`.
    ///
    /// Returns false when the transaction is not registered.
    pub fn release(&self, transaction_id: &str) -> bool {
        self.shared.release(transaction_id)
    }

    /// Drop expired locks now rather than on the next acquire.
    pub fn clean_expired(&self) {
        let mut table = self.shared.table();
        self.shared.clean_expired(&mut table);
    }

    /// Current holder of `resource`, if locked.
    pub fn holder(&self, resource: &str) -> Option<String> {
        self.shared
            .table()
            .locks
            .get(resource)
            .map(|lock| lock.transaction_id.clone())
    }

    pub fn is_registered(&self, transaction_id: &str) -> bool {
        self.shared.table().transactions.contains_key(transaction_id)
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let (active_locks, active_transactions) = {
            let table = self.shared.table();
            (table.locks.len(), table.transactions.len())
        };
        let stats = &self.shared.stats;

        ConcurrencyStats {
            max_concurrent_transactions: self.shared.options.max_concurrent_transactions,
            active_locks,
            active_transactions,
            total_transactions: stats.total_transactions.load(Ordering::Relaxed),
            max_concurrent_reached: stats.max_concurrent_reached.load(Ordering::Relaxed),
            lock_timeouts: stats.lock_timeouts.load(Ordering::Relaxed),
            lock_conflicts: stats.lock_conflicts.load(Ordering::Relaxed),
            deadlocks_detected: stats.deadlocks_detected.load(Ordering::Relaxed),
            slot_timeouts: stats.slot_timeouts.load(Ordering::Relaxed),
        }
    }
}
