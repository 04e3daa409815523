//! Statement classification and routing.
//!
//! A statement is a write when it runs in a transaction (and transactions are
//! pinned to the primary), contains a write keyword or a forced-primary
//! keyword anywhere (case-insensitive substring), or names a forced-primary
//! table as a whole word. Everything else is a read.
//!
//! Classifications outside a transaction are cached per raw statement text.
//! The cache is unbounded and only emptied by [`Router::clear_cache`], so
//! callers issuing ad hoc SQL with inlined literals should clear it
//! periodically.

use crate::db::adaptive::AdaptivePool;
use crate::db::topology::Topology;
use crate::error::{DbError, DbResult};
use crate::models::RouterMetrics;
use aho_corasick::{AhoCorasick, MatchKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

pub const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "GRANT", "TRUNCATE", "REPLACE",
    "LOCK",
];

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub force_master_keywords: Vec<String>,
    pub force_master_tables: Vec<String>,
    /// Lag bound used by [`Router::suitable_replica`] when the caller gives none.
    pub allow_replica_lag: u64,
    pub transaction_route_to_master: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            force_master_keywords: Vec::new(),
            force_master_tables: Vec::new(),
            allow_replica_lag: crate::config::DEFAULT_ALLOW_REPLICA_LAG_SECS,
            transaction_route_to_master: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteReason {
    TransactionContext,
    WriteKeyword(String),
    ForcedKeyword(String),
    ForcedTable(String),
    Preclassified,
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub is_write: bool,
    pub reason: RouteReason,
}

impl RouteDecision {
    fn write(reason: RouteReason) -> Self {
        Self {
            is_write: true,
            reason,
        }
    }
}

/// What the caller knows about a statement.
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    /// Raw SQL, classified by keyword and table matching.
    Sql(&'a str),
    /// The caller already knows whether the statement writes.
    Preclassified { is_write: bool },
}

#[derive(Debug)]
pub struct Router {
    topology: Arc<Topology>,
    options: RouterOptions,
    /// Write keywords first, then forced keywords.
    keywords: AhoCorasick,
    tables: Option<AhoCorasick>,
    cache: RwLock<HashMap<String, RouteDecision>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Router {
    pub fn new(topology: Arc<Topology>, mut options: RouterOptions) -> DbResult<Self> {
        // An empty pattern would match every statement.
        options.force_master_keywords.retain(|k| !k.trim().is_empty());
        options.force_master_tables.retain(|t| !t.trim().is_empty());

        let keywords = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(
                WRITE_KEYWORDS
                    .iter()
                    .copied()
                    .chain(options.force_master_keywords.iter().map(String::as_str)),
            )
            .map_err(|e| DbError::configuration(format!("Invalid forced keywords: {e}")))?;

        let tables = if options.force_master_tables.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&options.force_master_tables)
                    .map_err(|e| DbError::configuration(format!("Invalid forced tables: {e}")))?,
            )
        };

        Ok(Self {
            topology,
            options,
            keywords,
            tables,
            cache: RwLock::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Classify `sql`. Results outside a transaction are cached.
    pub fn classify(&self, sql: &str, in_transaction: bool) -> RouteDecision {
        if in_transaction && self.options.transaction_route_to_master {
            return RouteDecision::write(RouteReason::TransactionContext);
        }

        let cached = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sql)
            .cloned();
        if let Some(decision) = cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return decision;
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let decision = self.match_statement(sql);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sql.to_string(), decision.clone());
        decision
    }

    pub fn is_write(&self, sql: &str) -> bool {
        self.classify(sql, false).is_write
    }

    fn match_statement(&self, sql: &str) -> RouteDecision {
        if let Some(m) = self.keywords.find(sql) {
            let keyword = sql[m.start()..m.end()].to_ascii_uppercase();
            let reason = if m.pattern().as_usize() < WRITE_KEYWORDS.len() {
                RouteReason::WriteKeyword(keyword)
            } else {
                RouteReason::ForcedKeyword(keyword)
            };
            return RouteDecision::write(reason);
        }

        if let Some(table) = self.forced_table(sql) {
            return RouteDecision::write(RouteReason::ForcedTable(table));
        }

        RouteDecision {
            is_write: false,
            reason: RouteReason::ReadOnly,
        }
    }

    /// First forced table named in `sql` as a whole word.
    fn forced_table(&self, sql: &str) -> Option<String> {
        let tables = self.tables.as_ref()?;
        let bytes = sql.as_bytes();
        let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

        tables
            .find_overlapping_iter(sql)
            .find(|m| {
                let before = m.start().checked_sub(1).map(|i| bytes[i]);
                let after = bytes.get(m.end()).copied();
                !before.is_some_and(is_word) && !after.is_some_and(is_word)
            })
            .map(|m| self.options.force_master_tables[m.pattern().as_usize()].clone())
    }

    /// Decide where `statement` goes.
    pub fn decide(&self, statement: Statement<'_>, in_transaction: bool) -> RouteDecision {
        match statement {
            Statement::Sql(sql) => self.classify(sql, in_transaction),
            Statement::Preclassified { .. }
                if in_transaction && self.options.transaction_route_to_master =>
            {
                RouteDecision::write(RouteReason::TransactionContext)
            }
            Statement::Preclassified { is_write } => RouteDecision {
                is_write,
                reason: RouteReason::Preclassified,
            },
        }
    }

    /// Primary for writes, otherwise the topology's read pool.
    pub fn pool_for(&self, decision: &RouteDecision) -> Arc<AdaptivePool> {
        if decision.is_write {
            self.topology.write_pool()
        } else {
            self.topology.read_pool()
        }
    }

    pub fn route(&self, statement: Statement<'_>, in_transaction: bool) -> Arc<AdaptivePool> {
        let decision = self.decide(statement, in_transaction);
        let pool = self.pool_for(&decision);
        debug!(
            is_write = decision.is_write,
            reason = ?decision.reason,
            pool = %pool.name(),
            "Statement routed"
        );
        pool
    }

    /// A replica whose observed lag is at most `required_lag` seconds
    /// (default: `allow_replica_lag`), chosen by the read strategy.
    pub fn suitable_replica(&self, required_lag: Option<u64>) -> Option<Arc<AdaptivePool>> {
        let bound = required_lag.unwrap_or(self.options.allow_replica_lag);
        self.topology
            .select_replica(Some(bound))
            .map(|replica| Arc::clone(replica.pool()))
    }

    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn metrics(&self) -> RouterMetrics {
        RouterMetrics {
            cache_size: self
                .cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            force_master_keywords: self.options.force_master_keywords.clone(),
            force_master_tables: self.options.force_master_tables.clone(),
            allow_replica_lag: self.options.allow_replica_lag,
            transaction_route_to_master: self.options.transaction_route_to_master,
        }
    }
}
