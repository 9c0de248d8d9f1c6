//! # manifold-pool
//!
//! Egress connection pool for the Manifold RPC client: multiplexes logical
//! command requests over a bounded set of persistent connections per remote
//! host, amortizing dial and handshake costs while enforcing per-host limits
//! and failure isolation.
//!
//! ## Features
//!
//! - **Per-host pools**: acquisition, deadline-ordered queueing, refresh,
//!   eviction, backpressure and idle shutdown, one state machine per
//!   `(host, TLS mode)` pair
//! - **Generation invalidation**: one failure invalidates every connection a
//!   host pool handed out, without yanking them mid-command
//! - **Replica-set warming**: pools of one replica set share a
//!   minimum-connection budget, so traffic on one member keeps its siblings
//!   warm for failover
//! - **Live tunables**: the six sizing/timing knobs are atomics, adjustable
//!   at runtime
//! - **Transport-agnostic**: the pool drives [`ConnectionFactory`] /
//!   [`ClientConnection`] traits and never touches sockets itself
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use manifold_pool::{ConnectionPool, HostAndPort, PoolOptions, SslMode};
//! use std::time::Duration;
//!
//! # async fn example(factory: std::sync::Arc<dyn manifold_pool::ConnectionFactory>) -> manifold_pool::Result<()> {
//! let pool = ConnectionPool::new(PoolOptions::default().with_max_connections(16), factory);
//!
//! let host = HostAndPort::new("db-a.internal", 7300);
//! let conn = pool.get(&host, SslMode::Global, Duration::from_secs(5)).await?;
//!
//! // ... run commands on conn.connection() ...
//!
//! conn.indicate_success();
//! drop(conn); // returns the connection to the pool
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `metrics` - counters through the `metrics` facade

mod club;
mod conn;
mod specific;

pub mod error;
pub mod host;
pub mod manager;
pub mod notifier;
pub mod options;
pub mod pool;
pub mod stats;
pub mod transport;

pub use conn::{ConnectionHandle, ConnectionStatus};
pub use error::{Error, Result};
pub use host::{ConnectionString, HostAndPort};
pub use manager::EgressTagCloserManager;
pub use notifier::{ChangeHook, ReplicaSetChangeListener, ReplicaSetChangeNotifier};
pub use options::{PoolOptions, TunableOptions, WarmingPolicy};
pub use pool::ConnectionPool;
pub use stats::{ConnectionPoolStats, HostConnectionStats};
pub use transport::{
    ClientConnection, ConnectionFactory, SslMode, TagMask, Timer, TokioTimer,
};
