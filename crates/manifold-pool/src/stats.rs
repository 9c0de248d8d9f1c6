//! Pool observability: per-host connection counts and optional counters
//! through the `metrics` facade (enabled with the `metrics` feature).

use std::collections::HashMap;

use crate::host::HostAndPort;

/// Connection counts for one host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostConnectionStats {
    /// Connections checked out to users
    pub in_use: usize,
    /// Validated idle connections
    pub available: usize,
    /// Total connections ever created for this host
    pub created: u64,
    /// Connections currently in setup or refresh
    pub refreshing: usize,
}

/// Aggregated connection stats across one or more pools
#[derive(Debug, Default)]
pub struct ConnectionPoolStats {
    hosts: HashMap<HostAndPort, HostConnectionStats>,
    /// Sum of in-use counts across hosts
    pub total_in_use: usize,
    /// Sum of available counts across hosts
    pub total_available: usize,
    /// Sum of created counts across hosts
    pub total_created: u64,
    /// Sum of refreshing counts across hosts
    pub total_refreshing: usize,
}

impl ConnectionPoolStats {
    /// Create an empty stats collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge counts for one host; multiple pools reporting the same host
    /// accumulate.
    pub fn update_stats_for_host(&mut self, host: &HostAndPort, stats: HostConnectionStats) {
        let entry = self.hosts.entry(host.clone()).or_default();
        entry.in_use += stats.in_use;
        entry.available += stats.available;
        entry.created += stats.created;
        entry.refreshing += stats.refreshing;

        self.total_in_use += stats.in_use;
        self.total_available += stats.available;
        self.total_created += stats.created;
        self.total_refreshing += stats.refreshing;
    }

    /// Counts for a specific host
    pub fn host(&self, host: &HostAndPort) -> Option<&HostConnectionStats> {
        self.hosts.get(host)
    }

    /// All hosts with counts
    pub fn hosts(&self) -> impl Iterator<Item = (&HostAndPort, &HostConnectionStats)> {
        self.hosts.iter()
    }

    /// Number of hosts reported
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_connection_created(host: &HostAndPort) {
    metrics::counter!(
        "manifold_pool_connections_created_total",
        "host" => host.to_string()
    )
    .increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_connection_created(_host: &HostAndPort) {}

#[cfg(feature = "metrics")]
pub(crate) fn record_acquire_timeout(host: &HostAndPort) {
    metrics::counter!(
        "manifold_pool_acquire_timeouts_total",
        "host" => host.to_string()
    )
    .increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_acquire_timeout(_host: &HostAndPort) {}
