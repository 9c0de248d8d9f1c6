//! Pool configuration.
//!
//! [`PoolOptions`] is the plain construction-time config. The six sizing and
//! timing knobs are re-read on every pool decision through
//! [`TunableOptions`], an atomic view that can be adjusted at runtime without
//! taking the pool lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manager::EgressTagCloserManager;

/// How a club turns sibling traffic into a minimum-connection budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingPolicy {
    /// `min_conns = max(default, max over siblings of in-use)`: traffic on
    /// any member of a replica set warms connections on all of them.
    MaxOverSiblings,
    /// Only checkouts against the recorded primary raise the budget.
    PrimaryOnly,
}

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Pool name, used in stats and log output
    pub name: String,

    /// Minimum number of connections to keep alive per host while the pool
    /// is in operation
    pub min_connections: usize,

    /// Maximum number of connections per host, counting ready, in-setup and
    /// checked-out connections alike
    pub max_connections: usize,

    /// Cap on concurrent setup/refresh operations per host. Rate-limits
    /// connection storms rather than steady state (which `max_connections`
    /// bounds).
    pub max_connecting: usize,

    /// Time limit for a single connection setup or refresh attempt
    pub refresh_timeout: Duration,

    /// Maximum idle interval before a connection must be revalidated before
    /// it can be handed to a user again
    pub refresh_requirement: Duration,

    /// Maximum idle interval for a host pool before it becomes eligible for
    /// shutdown
    pub host_timeout: Duration,

    /// Sibling-warming rule for replica-set clubs
    pub warming_policy: WarmingPolicy,

    /// Registry for tag-based broadcast drops, shared across pools
    #[serde(skip)]
    pub manager: Option<Arc<EgressTagCloserManager>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            name: "manifold".to_string(),
            min_connections: 1,
            max_connections: usize::MAX,
            max_connecting: usize::MAX,
            refresh_timeout: Duration::from_secs(20),
            refresh_requirement: Duration::from_secs(60),
            host_timeout: Duration::from_secs(300),
            warming_policy: WarmingPolicy::MaxOverSiblings,
            manager: None,
        }
    }
}

impl PoolOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Profile used by the sharded-cluster task executors: identical to the
    /// defaults except that connection storms are throttled hard.
    pub fn sharded_cluster() -> Self {
        Self {
            max_connecting: 2,
            ..Self::default()
        }
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the per-host minimum connection count
    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the per-host maximum connection count
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the concurrent setup/refresh cap
    pub fn with_max_connecting(mut self, max: usize) -> Self {
        self.max_connecting = max;
        self
    }

    /// Set the setup/refresh time limit
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Set the idle interval after which a connection must be revalidated
    pub fn with_refresh_requirement(mut self, requirement: Duration) -> Self {
        self.refresh_requirement = requirement;
        self
    }

    /// Set the host-pool idle timeout
    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = timeout;
        self
    }

    /// Set the sibling-warming policy
    pub fn with_warming_policy(mut self, policy: WarmingPolicy) -> Self {
        self.warming_policy = policy;
        self
    }

    /// Set the tag-closer manager this pool registers with
    pub fn with_manager(mut self, manager: Arc<EgressTagCloserManager>) -> Self {
        self.manager = Some(manager);
        self
    }
}

/// Live-tunable view of the sizing and timing knobs.
///
/// Every decision in the pool reads through this, so adjustments take effect
/// on the next acquisition, spawn, return or timer re-arm without restarting
/// anything.
#[derive(Debug)]
pub struct TunableOptions {
    min_connections: AtomicUsize,
    max_connections: AtomicUsize,
    max_connecting: AtomicUsize,
    refresh_timeout_ms: AtomicU64,
    refresh_requirement_ms: AtomicU64,
    host_timeout_ms: AtomicU64,
}

impl TunableOptions {
    pub(crate) fn from_options(options: &PoolOptions) -> Self {
        Self {
            min_connections: AtomicUsize::new(options.min_connections),
            max_connections: AtomicUsize::new(options.max_connections),
            max_connecting: AtomicUsize::new(options.max_connecting),
            refresh_timeout_ms: AtomicU64::new(options.refresh_timeout.as_millis() as u64),
            refresh_requirement_ms: AtomicU64::new(
                options.refresh_requirement.as_millis() as u64
            ),
            host_timeout_ms: AtomicU64::new(options.host_timeout.as_millis() as u64),
        }
    }

    /// Current per-host minimum connection count
    pub fn min_connections(&self) -> usize {
        self.min_connections.load(Ordering::Relaxed)
    }

    /// Current per-host maximum connection count
    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    /// Current concurrent setup/refresh cap
    pub fn max_connecting(&self) -> usize {
        self.max_connecting.load(Ordering::Relaxed)
    }

    /// Current setup/refresh time limit
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms.load(Ordering::Relaxed))
    }

    /// Current revalidation idle interval
    pub fn refresh_requirement(&self) -> Duration {
        Duration::from_millis(self.refresh_requirement_ms.load(Ordering::Relaxed))
    }

    /// Current host-pool idle timeout
    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms.load(Ordering::Relaxed))
    }

    /// Adjust the per-host minimum connection count
    pub fn set_min_connections(&self, min: usize) {
        self.min_connections.store(min, Ordering::Relaxed);
    }

    /// Adjust the per-host maximum connection count
    pub fn set_max_connections(&self, max: usize) {
        self.max_connections.store(max, Ordering::Relaxed);
    }

    /// Adjust the concurrent setup/refresh cap
    pub fn set_max_connecting(&self, max: usize) {
        self.max_connecting.store(max, Ordering::Relaxed);
    }

    /// Adjust the setup/refresh time limit
    pub fn set_refresh_timeout(&self, timeout: Duration) {
        self.refresh_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Adjust the revalidation idle interval
    pub fn set_refresh_requirement(&self, requirement: Duration) {
        self.refresh_requirement_ms
            .store(requirement.as_millis() as u64, Ordering::Relaxed);
    }

    /// Adjust the host-pool idle timeout
    pub fn set_host_timeout(&self, timeout: Duration) {
        self.host_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }
}
