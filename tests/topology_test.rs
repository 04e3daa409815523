//! Integration tests for replica selection, failover and read routing.
//!
//! Primary and replicas are separate SQLite files. Each holds a `marker`
//! table naming the endpoint, so a read shows where it was served.

use db_router::admission::RetryPolicy;
use db_router::config::{DatabaseConfig, PoolOptions, ReadStrategy, ReplicaConfig};
use db_router::db::executor::execute;
use db_router::db::{AdaptivePool, ReplicaNode, Topology, TopologyOptions};
use db_router::error::DbError;
use db_router::{AccessOptions, DataAccess, ExecuteOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn sqlite_config(name: &str, file: &NamedTempFile) -> DatabaseConfig {
    DatabaseConfig::new(
        name,
        format!("sqlite://{}", file.path().display()),
        PoolOptions {
            min_connections: Some(1),
            max_connections: Some(4),
            acquire_timeout_secs: Some(2),
            ..Default::default()
        },
    )
}

async fn marked_pool(name: &str, file: &NamedTempFile) -> Arc<AdaptivePool> {
    let pool = AdaptivePool::connect(sqlite_config(name, file), RetryPolicy::none())
        .await
        .unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let limit = Duration::from_secs(5);
    execute(
        conn.connection_mut(),
        "CREATE TABLE marker (endpoint TEXT)",
        &[],
        limit,
    )
    .await
    .unwrap();
    execute(
        conn.connection_mut(),
        "INSERT INTO marker (endpoint) VALUES (?)",
        &[name.into()],
        limit,
    )
    .await
    .unwrap();
    drop(conn);
    pool
}

fn topology(
    primary: Arc<AdaptivePool>,
    replicas: Vec<Arc<ReplicaNode>>,
    read_strategy: ReadStrategy,
) -> Arc<Topology> {
    Arc::new(Topology::from_parts(
        primary,
        replicas,
        TopologyOptions {
            read_strategy,
            ..Default::default()
        },
        RetryPolicy::none(),
    ))
}

async fn served_by(access: &DataAccess) -> String {
    let result = access
        .execute("SELECT endpoint FROM marker", &[], ExecuteOptions::default())
        .await
        .unwrap();
    result.rows()[0]["endpoint"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_reads_stay_on_replica_until_it_fails() {
    let primary_file = NamedTempFile::new().unwrap();
    let replica_file = NamedTempFile::new().unwrap();
    let primary = marked_pool("primary", &primary_file).await;
    let replica = Arc::new(ReplicaNode::new(
        marked_pool("replica_0", &replica_file).await,
        1,
        5,
    ));

    let topology = topology(
        Arc::clone(&primary),
        vec![Arc::clone(&replica)],
        ReadStrategy::Random,
    );
    let access = DataAccess::with_topology(topology, AccessOptions::default()).unwrap();

    for _ in 0..100 {
        assert_eq!(served_by(&access).await, "replica_0");
    }
    assert_eq!(primary.status().total_queries, 0);
    assert_eq!(replica.pool().status().total_queries, 100);

    replica.record_probe(&Err(DbError::replica_unavailable("replica_0", "link down")));

    for _ in 0..100 {
        assert_eq!(served_by(&access).await, "primary");
    }
    assert_eq!(primary.status().total_queries, 100);
    assert_eq!(replica.pool().status().total_queries, 100);

    // Back in rotation after a successful probe.
    assert!(replica.check_health(&RetryPolicy::none()).await);
    assert_eq!(served_by(&access).await, "replica_0");
}

#[tokio::test]
async fn test_writes_always_go_to_primary() {
    let primary_file = NamedTempFile::new().unwrap();
    let replica_file = NamedTempFile::new().unwrap();
    let primary = marked_pool("primary", &primary_file).await;
    let replica = Arc::new(ReplicaNode::new(
        marked_pool("replica_0", &replica_file).await,
        1,
        5,
    ));
    let access = DataAccess::with_topology(
        topology(primary, vec![Arc::clone(&replica)], ReadStrategy::Random),
        AccessOptions::default(),
    )
    .unwrap();

    let done = access
        .execute(
            "UPDATE marker SET endpoint = 'primary-updated'",
            &[],
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(done.rows_affected(), Some(1));

    // The replica file is untouched.
    assert_eq!(served_by(&access).await, "replica_0");

    let on_primary = access
        .execute("SELECT endpoint FROM marker", &[], ExecuteOptions::write())
        .await
        .unwrap();
    assert_eq!(on_primary.rows()[0]["endpoint"], "primary-updated");
}

#[tokio::test]
async fn test_transaction_reads_route_to_primary() {
    let primary_file = NamedTempFile::new().unwrap();
    let replica_file = NamedTempFile::new().unwrap();
    let primary = marked_pool("primary", &primary_file).await;
    let replica = Arc::new(ReplicaNode::new(
        marked_pool("replica_0", &replica_file).await,
        1,
        5,
    ));
    let access = DataAccess::with_topology(
        topology(primary, vec![replica], ReadStrategy::Random),
        AccessOptions::default(),
    )
    .unwrap();

    let result = access
        .execute(
            "SELECT endpoint FROM marker",
            &[],
            ExecuteOptions {
                in_transaction: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.rows()[0]["endpoint"], "primary");
}

#[tokio::test]
async fn test_lagging_replica_is_skipped() {
    let files: Vec<NamedTempFile> = (0..3).map(|_| NamedTempFile::new().unwrap()).collect();
    let primary = marked_pool("primary", &files[0]).await;
    let slow = Arc::new(ReplicaNode::new(marked_pool("slow", &files[1]).await, 1, 5));
    let fast = Arc::new(ReplicaNode::new(marked_pool("fast", &files[2]).await, 1, 5));

    let topology = topology(
        primary,
        vec![Arc::clone(&slow), Arc::clone(&fast)],
        ReadStrategy::Random,
    );

    slow.record_probe(&Ok(30));
    fast.record_probe(&Ok(1));
    assert!(!slow.is_available());

    for _ in 0..20 {
        assert_eq!(topology.select_replica(None).unwrap().name(), "fast");
    }

    // Within max_lag but above the caller's bound.
    slow.record_probe(&Ok(4));
    assert!(slow.is_available());
    assert_eq!(topology.select_replica(Some(2)).unwrap().name(), "fast");
    fast.record_probe(&Ok(3));
    assert!(topology.select_replica(Some(2)).is_none());
}

#[tokio::test]
async fn test_weighted_selection_follows_weights() {
    let files: Vec<NamedTempFile> = (0..3).map(|_| NamedTempFile::new().unwrap()).collect();
    let primary = marked_pool("primary", &files[0]).await;
    let light = Arc::new(ReplicaNode::new(marked_pool("light", &files[1]).await, 1, 5));
    let heavy = Arc::new(ReplicaNode::new(marked_pool("heavy", &files[2]).await, 3, 5));
    let topology = topology(primary, vec![light, heavy], ReadStrategy::Weighted);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..8_000 {
        let node = topology.select_replica(None).unwrap();
        *counts.entry(node.name().to_string()).or_default() += 1;
    }
    let ratio = f64::from(counts["heavy"]) / f64::from(counts["light"]);
    assert!((2.5..3.5).contains(&ratio), "ratio was {ratio}");
}

#[tokio::test]
async fn test_round_robin_alternates() {
    let files: Vec<NamedTempFile> = (0..3).map(|_| NamedTempFile::new().unwrap()).collect();
    let primary = marked_pool("primary", &files[0]).await;
    let a = Arc::new(ReplicaNode::new(marked_pool("a", &files[1]).await, 1, 5));
    let b = Arc::new(ReplicaNode::new(marked_pool("b", &files[2]).await, 1, 5));
    let topology = topology(primary, vec![a, b], ReadStrategy::RoundRobin);

    let picks: Vec<String> = (0..4)
        .map(|_| topology.select_replica(None).unwrap().name().to_string())
        .collect();
    assert_ne!(picks[0], picks[1]);
    assert_eq!(picks[0], picks[2]);
    assert_eq!(picks[1], picks[3]);
}

#[tokio::test]
async fn test_start_skips_unreachable_replica() {
    let primary_file = NamedTempFile::new().unwrap();
    let replica_file = NamedTempFile::new().unwrap();
    let missing_dir = tempfile::tempdir().unwrap();

    let replicas = vec![
        ReplicaConfig {
            database: sqlite_config("good", &replica_file),
            weight: 1,
            max_lag_secs: 5,
        },
        ReplicaConfig {
            database: DatabaseConfig::new(
                "broken",
                format!(
                    "sqlite://{}/no/such/dir/replica.db",
                    missing_dir.path().display()
                ),
                PoolOptions {
                    min_connections: Some(1),
                    max_connections: Some(1),
                    ..Default::default()
                },
            ),
            weight: 1,
            max_lag_secs: 5,
        },
    ];

    let topology = Topology::start(
        sqlite_config("primary", &primary_file),
        replicas,
        TopologyOptions::default(),
        RetryPolicy::none(),
    )
    .await
    .unwrap();

    assert_eq!(topology.replicas().len(), 1);
    assert!(topology.replica("good").is_some());
    assert!(topology.replica("broken").is_none());

    let status = topology.replica_status();
    assert!(status["good"].available);
    assert_eq!(status["good"].lag_secs, Some(0));

    topology.stop().await;
    assert!(topology.primary().is_stopped());
}

#[tokio::test]
async fn test_start_rejects_zero_health_check_interval() {
    let primary_file = NamedTempFile::new().unwrap();

    let err = Topology::start(
        sqlite_config("primary", &primary_file),
        Vec::new(),
        TopologyOptions {
            health_check_interval: Duration::ZERO,
            ..Default::default()
        },
        RetryPolicy::none(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }), "{err}");
}

#[tokio::test]
async fn test_monitor_marks_dead_replica_unavailable() {
    let primary_file = NamedTempFile::new().unwrap();
    let replica_file = NamedTempFile::new().unwrap();

    let topology = Topology::start(
        sqlite_config("primary", &primary_file),
        vec![ReplicaConfig {
            database: sqlite_config("ro", &replica_file),
            weight: 1,
            max_lag_secs: 5,
        }],
        TopologyOptions {
            health_check_interval: Duration::from_millis(100),
            ..Default::default()
        },
        RetryPolicy::none(),
    )
    .await
    .unwrap();

    let replica = Arc::clone(topology.replica("ro").unwrap());
    assert!(replica.is_available());

    replica.pool().stop().await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(!replica.is_available());
    assert!(Arc::ptr_eq(&topology.read_pool(), topology.primary()));
    topology.stop().await;
}

#[tokio::test]
async fn test_read_pool_without_replicas_is_primary() {
    let primary_file = NamedTempFile::new().unwrap();
    let primary = marked_pool("primary", &primary_file).await;
    let topology = topology(Arc::clone(&primary), Vec::new(), ReadStrategy::Random);

    assert!(Arc::ptr_eq(&topology.read_pool(), &primary));
    assert!(topology.select_replica(None).is_none());
}
