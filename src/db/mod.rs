//! Database layer.
//!
//! - Per-backend pool, connection and transaction wrappers
//! - Adaptive pools that resize with load
//! - Replica nodes and the primary/replica topology
//! - Statement routing and per-session bindings
//! - Statement execution and row decoding

pub mod adaptive;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod pool;
pub mod replica;
pub mod router;
pub mod rows;
pub mod session;
pub mod topology;

pub use adaptive::{AdaptivePool, PooledConnection, PooledTransaction, ScaleDecision, ScalingPolicy};
pub use pool::{DbConnection, DbPool, DbTransaction};
pub use replica::ReplicaNode;
pub use router::{RouteDecision, RouteReason, Router, RouterOptions, Statement};
pub use session::{SessionBinding, SessionOptions};
pub use topology::{Topology, TopologyOptions};
