//! The root connection pool: owner of the host → pool map and the club
//! table, dispatcher of all public operations.
//!
//! # Locking
//!
//! One mutex guards the whole map and every per-host pool. It is held only
//! for state mutation, never across connection setup/refresh, waiter
//! fulfilment, user callbacks or `.await` points. Work that must happen
//! without the lock (delivering handles, launching transport I/O, spawn
//! sweeps) is collected into [`Effects`] and run after the guard drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::club::{ClubId, PoolClub};
use crate::conn::{ConnectionHandle, PooledConn};
use crate::error::{Error, Result};
use crate::host::{ConnectionString, HostAndPort};
use crate::manager::EgressTagCloserManager;
use crate::notifier::ReplicaSetChangeListener;
use crate::options::{PoolOptions, TunableOptions, WarmingPolicy};
use crate::specific::{launch_refresh, spawn_connections, PoolState, SpecificPool};
use crate::stats::{ConnectionPoolStats, HostConnectionStats};
use crate::transport::{ConnectionFactory, SslMode, TagMask};

/// Everything the pool's tasks and timers share.
pub(crate) struct PoolShared {
    pub(crate) name: String,
    pub(crate) warming_policy: WarmingPolicy,
    pub(crate) tunables: TunableOptions,
    pub(crate) factory: Arc<dyn ConnectionFactory>,
    pub(crate) manager: Option<Arc<EgressTagCloserManager>>,
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) shutdown: AtomicBool,
    next_conn_id: AtomicU64,
}

impl PoolShared {
    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Lock-guarded state: the host pools and their clubs.
pub(crate) struct PoolInner {
    pub(crate) pools: HashMap<HostAndPort, SpecificPool>,
    pub(crate) clubs: HashMap<ClubId, PoolClub>,
    pub(crate) clubs_by_set: HashMap<String, ClubId>,
    next_club_id: ClubId,
}

impl PoolInner {
    fn new() -> Self {
        Self {
            pools: HashMap::new(),
            clubs: HashMap::new(),
            clubs_by_set: HashMap::new(),
            next_club_id: 0,
        }
    }

    pub(crate) fn alloc_club_id(&mut self) -> ClubId {
        let id = self.next_club_id;
        self.next_club_id += 1;
        id
    }

    /// Locate or lazily create the pool for a host. A new pool starts in its
    /// own solitary club and immediately runs the state update so its
    /// host-idle timer is armed even if it never sees a request.
    pub(crate) fn get_or_create_pool(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        ssl_mode: SslMode,
    ) {
        if self.pools.contains_key(host) {
            return;
        }
        let club = self.make_solitary_club(shared);
        let pool = SpecificPool::new(host.clone(), club, ssl_mode, shared.factory.make_timer());
        self.pools.insert(host.clone(), pool);
        self.attach_pool_to_club(host, club);
        self.update_pool_state(shared, host);
    }
}

/// Deferred work collected under the lock and run after it is released.
#[derive(Default)]
pub(crate) struct Effects {
    fulfill: Vec<(oneshot::Sender<Result<ConnectionHandle>>, Result<ConnectionHandle>)>,
    refreshes: Vec<Arc<PooledConn>>,
    spawns: Vec<HostAndPort>,
}

impl Effects {
    pub(crate) fn push_fulfill_ok(
        &mut self,
        tx: oneshot::Sender<Result<ConnectionHandle>>,
        handle: ConnectionHandle,
    ) {
        self.fulfill.push((tx, Ok(handle)));
    }

    pub(crate) fn push_fulfill_err(
        &mut self,
        tx: oneshot::Sender<Result<ConnectionHandle>>,
        error: Error,
    ) {
        self.fulfill.push((tx, Err(error)));
    }

    pub(crate) fn push_refresh(&mut self, conn: Arc<PooledConn>) {
        self.refreshes.push(conn);
    }

    pub(crate) fn push_spawn(&mut self, host: HostAndPort) {
        if !self.spawns.contains(&host) {
            self.spawns.push(host);
        }
    }

    pub(crate) fn run(self, shared: &Arc<PoolShared>) {
        // A waiter that gave up drops the returned handle, which schedules a
        // normal return; nothing extra to do on a failed send.
        for (tx, result) in self.fulfill {
            let _ = tx.send(result);
        }

        // During process teardown there is no runtime left; the connections
        // involved simply close.
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        for conn in self.refreshes {
            launch_refresh(shared, conn);
        }
        for host in self.spawns {
            let shared = shared.clone();
            tokio::spawn(async move {
                spawn_connections(&shared, &host);
            });
        }
    }
}

/// Run `body` under the pool lock with the host's active-client count bumped
/// for the duration, then refresh the pool state and run the deferred
/// effects. No-op if the host pool has been delisted.
pub(crate) fn enter_guarded(
    shared: &Arc<PoolShared>,
    host: HostAndPort,
    body: impl FnOnce(&mut PoolInner, &Arc<PoolShared>, &HostAndPort, &mut Effects),
) {
    let mut effects = Effects::default();
    {
        let mut inner = shared.inner.lock();
        let Some(pool) = inner.pools.get_mut(&host) else {
            return;
        };
        pool.active_clients += 1;

        body(&mut *inner, shared, &host, &mut effects);

        if let Some(pool) = inner.pools.get_mut(&host) {
            pool.active_clients -= 1;
        }
        inner.update_pool_state(shared, &host);
    }
    effects.run(shared);
}

/// An egress connection pool: one bounded, self-refreshing pool of
/// transport connections per remote host, federated per replica set.
///
/// Callers acquire with [`get`](ConnectionPool::get) and give the connection
/// back by dropping the returned [`ConnectionHandle`], reporting the outcome
/// through the handle first. Everything else (spawning toward the budget,
/// refreshing idle connections, expiring waiters, tearing down idle hosts)
/// happens inside the pool.
///
/// Must be used from within a tokio runtime.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool driving the given transport factory.
    pub fn new(options: PoolOptions, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let tunables = TunableOptions::from_options(&options);
        let pool = Arc::new(Self {
            shared: Arc::new(PoolShared {
                name: options.name.clone(),
                warming_policy: options.warming_policy,
                tunables,
                factory,
                manager: options.manager.clone(),
                inner: Mutex::new(PoolInner::new()),
                shutdown: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(1),
            }),
        });
        if let Some(manager) = &pool.shared.manager {
            manager.add(&pool);
        }
        pool
    }

    /// The pool name used in stats and logs
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Live view of the sizing and timing knobs
    pub fn tunables(&self) -> &TunableOptions {
        &self.shared.tunables
    }

    /// Acquire a connection to `host`, waiting up to `timeout` (clamped to
    /// the refresh timeout) for one to become available.
    ///
    /// # Panics
    ///
    /// Panics if `ssl_mode` differs from the mode pinned by the first
    /// acquisition against this host.
    pub async fn get(
        &self,
        host: &HostAndPort,
        ssl_mode: SslMode,
        timeout: Duration,
    ) -> Result<ConnectionHandle> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::pool_shutdown("pool is shut down"));
        }

        let rx = {
            let mut effects = Effects::default();
            let outcome = {
                let mut inner = self.shared.inner.lock();
                inner.get_or_create_pool(&self.shared, host, ssl_mode);

                let pool = inner.pools.get_mut(host).expect("pool was just created");
                if pool.state == PoolState::InShutdown {
                    return Err(Error::pool_shutdown("host pool is shutting down"));
                }
                pool.set_or_check_ssl_mode(ssl_mode);

                if let Some(conn) = pool.try_checkout() {
                    let handle = ConnectionHandle::new(conn, Arc::downgrade(&self.shared));
                    inner.update_pool_state(&self.shared, host);
                    Ok(handle)
                } else {
                    let timeout = timeout.min(self.shared.tunables.refresh_timeout());
                    let expires_at = self.shared.factory.now() + timeout;
                    let (tx, rx) = oneshot::channel();
                    let pool = inner.pools.get_mut(host).expect("pool exists");
                    pool.queue_waiter(expires_at, tx);
                    inner.update_pool_state(&self.shared, host);
                    effects.push_spawn(host.clone());
                    Err(rx)
                }
            };
            effects.run(&self.shared);

            match outcome {
                Ok(handle) => return Ok(handle),
                Err(rx) => rx,
            }
        };

        rx.await
            .map_err(|_| Error::pool_shutdown("pool dropped while waiting for a connection"))?
    }

    /// Take a ready connection right now, if one exists and nobody is queued
    /// ahead (queued waiters keep earliest-deadline-first fairness).
    ///
    /// # Panics
    ///
    /// Panics on an SSL mode mismatch against the pinned mode.
    pub fn try_get(&self, host: &HostAndPort, ssl_mode: SslMode) -> Option<ConnectionHandle> {
        let mut inner = self.shared.inner.lock();
        let pool = inner.pools.get_mut(host)?;

        pool.assert_ssl_mode(ssl_mode);

        if pool.state == PoolState::InShutdown || !pool.requests.is_empty() {
            return None;
        }

        let conn = pool.try_checkout()?;
        let handle = ConnectionHandle::new(conn, Arc::downgrade(&self.shared));
        inner.update_pool_state(&self.shared, host);
        Some(handle)
    }

    /// Drop every pooled connection to `host` and fail its queued waiters.
    /// Checked-out connections lapse when returned.
    pub fn drop_connections(&self, host: &HostAndPort) {
        let mut effects = Effects::default();
        {
            let mut inner = self.shared.inner.lock();
            if inner.pools.contains_key(host) {
                inner.process_failure(
                    &self.shared,
                    host,
                    Error::connections_dropped("pooled connections dropped"),
                    &mut effects,
                );
            }
        }
        effects.run(&self.shared);
    }

    /// Drop pooled connections on every host pool whose tags match `tags`.
    pub fn drop_connections_by_tag(&self, tags: TagMask) {
        let mut effects = Effects::default();
        {
            let mut inner = self.shared.inner.lock();
            let matching: Vec<HostAndPort> = inner
                .pools
                .iter()
                .filter(|(_, pool)| pool.matches_tags(tags))
                .map(|(host, _)| host.clone())
                .collect();
            for host in matching {
                inner.process_failure(
                    &self.shared,
                    &host,
                    Error::connections_dropped("pooled connections dropped"),
                    &mut effects,
                );
            }
        }
        effects.run(&self.shared);
    }

    /// Atomically transform the tag mask of a host pool
    pub fn mutate_tags(&self, host: &HostAndPort, mutate: impl FnOnce(TagMask) -> TagMask) {
        let mut inner = self.shared.inner.lock();
        if let Some(pool) = inner.pools.get_mut(host) {
            pool.tags = mutate(pool.tags);
        }
    }

    /// Rewire the club for a replica set to exactly the hosts in `config`.
    ///
    /// Listed hosts get pools (created on demand) attached to the set's
    /// club; previous members no longer listed are detached into solitary
    /// clubs; the club budget is reset and recomputed. A standalone seed
    /// list (no set name) just ensures each host has a pool in a solitary
    /// club of its own.
    pub fn handle_config(&self, config: &ConnectionString) {
        let mut inner = self.shared.inner.lock();

        let Some(set_name) = config.set_name() else {
            for host in config.servers() {
                inner.get_or_create_pool(&self.shared, host, SslMode::Global);
            }
            return;
        };

        let club = inner.club_for_set(&self.shared, set_name);

        // Save what used to be the club for later; most members usually stay.
        let mut previous = match inner.clubs.get_mut(&club) {
            Some(club_state) => std::mem::take(&mut club_state.members),
            None => return,
        };

        for host in config.servers() {
            inner.get_or_create_pool(&self.shared, host, SslMode::Global);
            inner.attach_pool_to_club(host, club);
            previous.remove(host);
        }

        // Anything left was removed from the set.
        for host in previous {
            inner.detach_pool_to_solitary(&self.shared, &host);
        }

        let members: Vec<HostAndPort> = match inner.clubs.get_mut(&club) {
            Some(club_state) => {
                club_state.min_conns = club_state.default_min_conns;
                club_state.members.iter().cloned().collect()
            }
            None => return,
        };
        for member in &members {
            inner.update_controller(&self.shared, member);
        }
    }

    /// Record the new primary of a replica set and re-run the controller
    /// update for its pool.
    pub fn handle_primary(&self, set_name: &str, primary: &HostAndPort) {
        let mut inner = self.shared.inner.lock();
        let club = inner.club_for_set(&self.shared, set_name);

        let changed = match inner.clubs.get_mut(&club) {
            Some(club_state) if club_state.primary.as_ref() != Some(primary) => {
                club_state.primary = Some(primary.clone());
                true
            }
            _ => false,
        };

        if changed && inner.pools.contains_key(primary) {
            inner.update_controller(&self.shared, primary);
        }
    }

    /// Report per-host `{in_use, available, created, refreshing}` into
    /// `stats`
    pub fn append_connection_stats(&self, stats: &mut ConnectionPoolStats) {
        let inner = self.shared.inner.lock();
        for (host, pool) in &inner.pools {
            stats.update_stats_for_host(
                host,
                HostConnectionStats {
                    in_use: pool.in_use_connections(),
                    available: pool.available_connections(),
                    created: pool.created_connections(),
                    refreshing: pool.refreshing_connections(),
                },
            );
        }
    }

    /// Total open connections (ready + processing + checked out) for a host
    pub fn get_num_connections_per_host(&self, host: &HostAndPort) -> usize {
        let inner = self.shared.inner.lock();
        inner
            .pools
            .get(host)
            .map_or(0, |pool| pool.open_connections())
    }

    /// Shut the factory, then every host pool. Idempotent. Waiters receive
    /// [`Error::PoolShutdown`]; pools delist as their in-flight work drains.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pool = %self.shared.name, "shutting down connection pool");

        self.shared.factory.shutdown();
        if let Some(manager) = &self.shared.manager {
            manager.remove(self);
        }

        let mut effects = Effects::default();
        {
            let mut inner = self.shared.inner.lock();
            let hosts: Vec<HostAndPort> = inner.pools.keys().cloned().collect();
            for host in hosts {
                if inner.pools.contains_key(&host) {
                    inner.trigger_shutdown(
                        &self.shared,
                        &host,
                        Error::pool_shutdown("shutting down the connection pool"),
                        &mut effects,
                    );
                }
            }
        }
        effects.run(&self.shared);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReplicaSetChangeListener for ConnectionPool {
    fn handle_config(&self, config: &ConnectionString) {
        ConnectionPool::handle_config(self, config);
    }

    fn handle_primary(&self, set_name: &str, primary: &HostAndPort) {
        ConnectionPool::handle_primary(self, set_name, primary);
    }
}
