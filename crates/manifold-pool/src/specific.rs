//! Per-host pool state machine.
//!
//! Each `(host, TLS mode)` pair gets one [`SpecificPool`] holding four
//! disjoint connection collections (ready / processing / dropped-processing /
//! checked-out), a deadline-ordered waiter heap, and a single request timer
//! that rotates between three roles: firing request deadlines, lying dormant
//! while connections are checked out, and counting down the host idle
//! timeout.
//!
//! All state here is guarded by the root pool mutex. Functions that fulfil
//! waiters or launch transport I/O record those actions as effects and the
//! caller runs them after the lock is released; re-entry from timers and
//! completed I/O goes through [`crate::pool::enter_guarded`], which brackets
//! the pool's active-client count around the callback body.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::club::ClubId;
use crate::conn::{ConnectionHandle, PooledConn};
use crate::error::{Error, Result};
use crate::host::HostAndPort;
use crate::pool::{enter_guarded, Effects, PoolInner, PoolShared};
use crate::stats;
use crate::transport::{SslMode, TagMask, Timer};

/// Lifecycle of a host pool.
///
/// The pool begins running. It moves to idle when no requests are pending
/// and no connections are checked out, and to host-timed-out when the idle
/// timer elapses. Shutdown is entered on command (or when every club sibling
/// has timed out) and the pool delists itself once in-flight work drains.
/// Any new request moves an idle or timed-out pool back to running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolState {
    Running,
    Idle,
    HostTimedOut,
    InShutdown,
}

/// A queued acquisition: deadline plus the channel the handle is delivered on.
pub(crate) struct Waiter {
    pub(crate) expires_at: Instant,
    seq: u64,
    pub(crate) tx: oneshot::Sender<Result<ConnectionHandle>>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Reversed so the binary heap pops the earliest deadline first, with
    // insertion order breaking ties.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// All pool state for a single host.
pub(crate) struct SpecificPool {
    pub(crate) host: HostAndPort,
    pub(crate) ssl_mode: SslMode,
    pub(crate) club: ClubId,

    /// Idle validated connections, most recently used first
    pub(crate) ready: VecDeque<Arc<PooledConn>>,
    /// Connections in setup or refresh
    pub(crate) processing: HashMap<u64, Arc<PooledConn>>,
    /// Processing connections from an invalidated generation, kept only so a
    /// late completion can tell "expected" from "already torn down"
    pub(crate) dropped_processing: HashMap<u64, Arc<PooledConn>>,
    /// Connections handed to users
    pub(crate) checked_out: HashMap<u64, Arc<PooledConn>>,

    pub(crate) requests: BinaryHeap<Waiter>,
    pub(crate) request_timer: Box<dyn Timer>,
    pub(crate) request_timer_expiration: Option<Instant>,
    next_waiter_seq: u64,

    /// Callbacks currently inside this pool; blocks delisting while nonzero
    pub(crate) active_clients: usize,
    /// Reservations for connections being manufactured outside the lock
    pub(crate) pending_spawns: usize,

    pub(crate) generation: u64,
    pub(crate) created: u64,
    pub(crate) tags: TagMask,
    pub(crate) state: PoolState,
}

impl SpecificPool {
    pub(crate) fn new(
        host: HostAndPort,
        club: ClubId,
        ssl_mode: SslMode,
        request_timer: Box<dyn Timer>,
    ) -> Self {
        Self {
            host,
            ssl_mode,
            club,
            ready: VecDeque::new(),
            processing: HashMap::new(),
            dropped_processing: HashMap::new(),
            checked_out: HashMap::new(),
            requests: BinaryHeap::new(),
            request_timer,
            request_timer_expiration: None,
            next_waiter_seq: 0,
            active_clients: 0,
            pending_spawns: 0,
            generation: 0,
            created: 0,
            tags: TagMask::default(),
            state: PoolState::Running,
        }
    }

    pub(crate) fn in_use_connections(&self) -> usize {
        self.checked_out.len()
    }

    pub(crate) fn available_connections(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn refreshing_connections(&self) -> usize {
        self.processing.len()
    }

    pub(crate) fn created_connections(&self) -> u64 {
        self.created
    }

    /// Open connections: ready + processing + checked out.
    pub(crate) fn open_connections(&self) -> usize {
        self.ready.len() + self.processing.len() + self.checked_out.len()
    }

    pub(crate) fn matches_tags(&self, tags: TagMask) -> bool {
        self.tags.matches(tags)
    }

    /// Pin the TLS mode on first use; mixing modes for one host afterwards is
    /// a caller bug severe enough to abort on.
    pub(crate) fn set_or_check_ssl_mode(&mut self, desired: SslMode) {
        if self.created == 0 {
            self.ssl_mode = desired;
            return;
        }
        self.assert_ssl_mode(desired);
    }

    pub(crate) fn assert_ssl_mode(&self, desired: SslMode) {
        if self.created > 0 && desired != self.ssl_mode {
            panic!(
                "mixing ssl modes for a single host is not supported (host {})",
                self.host
            );
        }
    }

    /// Take the most recently used healthy ready connection, checking it out.
    /// Unhealthy connections at the head are discarded and the scan goes on.
    pub(crate) fn try_checkout(&mut self) -> Option<Arc<PooledConn>> {
        while let Some(conn) = self.ready.pop_front() {
            conn.cancel_timeout();

            if !conn.is_healthy() {
                info!(host = %self.host, "dropping unhealthy pooled connection");
                continue;
            }

            self.checked_out.insert(conn.id(), conn.clone());
            conn.reset_to_unknown();
            return Some(conn);
        }
        None
    }

    pub(crate) fn queue_waiter(
        &mut self,
        expires_at: Instant,
        tx: oneshot::Sender<Result<ConnectionHandle>>,
    ) {
        let seq = self.next_waiter_seq;
        self.next_waiter_seq += 1;
        self.requests.push(Waiter {
            expires_at,
            seq,
            tx,
        });
    }
}

impl PoolInner {
    /// Put a validated connection back into the ready pool as the MRU entry,
    /// arm its refresh-due timer, and try to satisfy queued waiters.
    pub(crate) fn add_to_ready(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        conn: Arc<PooledConn>,
        effects: &mut Effects,
    ) {
        let conn_id = conn.id();
        {
            let Some(pool) = self.pools.get_mut(host) else {
                return;
            };
            pool.ready.push_front(conn.clone());
        }

        // Refresh strategy: when the requirement elapses, check the
        // connection out and immediately return it, which funnels it through
        // the refresh branch of return_connection exactly once.
        let weak = Arc::downgrade(shared);
        let host_cb = host.clone();
        conn.set_timeout(
            shared.tunables.refresh_requirement(),
            Box::new(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                enter_guarded(&shared, host_cb, move |inner, shared, host, effects| {
                    inner.refresh_due(shared, host, conn_id, effects);
                });
            }),
        );

        self.fulfill_requests(shared, host, effects);
    }

    /// A ready connection hit its refresh requirement: run it through the
    /// checkout/return cycle so the refresh branch fires.
    pub(crate) fn refresh_due(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        conn_id: u64,
        effects: &mut Effects,
    ) {
        let conn = {
            let Some(pool) = self.pools.get_mut(host) else {
                return;
            };
            let Some(pos) = pool.ready.iter().position(|c| c.id() == conn_id) else {
                // Already checked out; its user will trigger the refresh path
                // on return if still needed.
                return;
            };
            let conn = pool.ready.remove(pos).expect("position is in range");
            if pool.state == PoolState::InShutdown {
                return;
            }
            pool.checked_out.insert(conn_id, conn.clone());
            conn
        };

        conn.indicate_success();
        self.return_connection(shared, host, conn, effects);
    }

    /// Take a connection back from a user (or from the refresh-due cycle).
    pub(crate) fn return_connection(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        conn: Arc<PooledConn>,
        effects: &mut Effects,
    ) {
        let conn_id = conn.id();

        let (generation, club, open) = {
            let Some(pool) = self.pools.get_mut(host) else {
                return;
            };
            if pool.checked_out.remove(&conn_id).is_none() {
                warn!(host = %host, "returned connection was not checked out");
                return;
            }
            (pool.generation, pool.club, pool.open_connections())
        };
        self.update_pool_state(shared, host);

        if conn.generation() != generation {
            // From an invalidated generation; let it lapse.
            return;
        }

        if !conn.status().is_ok() {
            info!(
                host = %host,
                open_connections = open,
                "ending connection due to bad connection status"
            );
            return;
        }

        let now = shared.factory.now();
        if conn.last_used() + shared.tunables.refresh_requirement() <= now {
            let min_conns = self.clubs.get(&club).map_or(0, |c| c.min_conns);
            let Some(pool) = self.pools.get_mut(host) else {
                return;
            };
            if pool.open_connections() >= min_conns {
                debug!(
                    host = %host,
                    open_connections = pool.open_connections(),
                    "ending idle connection because the pool meets constraints"
                );
            } else {
                pool.processing.insert(conn_id, conn.clone());
                effects.push_refresh(conn);
            }
        } else {
            self.add_to_ready(shared, host, conn, effects);
        }

        self.update_pool_state(shared, host);
    }

    /// Completion of a connection setup or refresh.
    pub(crate) fn finish_refresh(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        conn: Arc<PooledConn>,
        status: Result<()>,
        effects: &mut Effects,
    ) {
        let conn_id = conn.id();
        {
            let Some(pool) = self.pools.get_mut(host) else {
                return;
            };
            let taken = pool
                .processing
                .remove(&conn_id)
                .or_else(|| pool.dropped_processing.remove(&conn_id));
            if taken.is_none() {
                // Cleared by an intervening shutdown.
                return;
            }
            if pool.state == PoolState::InShutdown {
                return;
            }
        }

        match status {
            Ok(()) => {
                let generation = match self.pools.get(host) {
                    Some(pool) => pool.generation,
                    None => return,
                };
                if conn.generation() != generation {
                    // The host was dropped while this connection was in
                    // flight; replace rather than reuse.
                    effects.push_spawn(host.clone());
                    return;
                }
                self.add_to_ready(shared, host, conn, effects);
            }
            Err(error) if error.is_deadline() => {
                // Callers carry their own deadlines; missing the connect
                // timeout is not a host failure, so try a fresh connection.
                warn!(
                    host = %host,
                    "pending connection did not complete within the connection timeout, \
                     retrying with a new connection"
                );
                effects.push_spawn(host.clone());
            }
            Err(error) => {
                self.process_failure(shared, host, error, effects);
            }
        }
    }

    /// Fulfil as many queued waiters as ready connections allow, then let the
    /// club know about the new checkout level and nudge every member's spawn
    /// loop, since one pool's recomputed budget may raise a sibling's target.
    pub(crate) fn fulfill_requests(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        effects: &mut Effects,
    ) {
        loop {
            {
                let Some(pool) = self.pools.get_mut(host) else {
                    return;
                };
                if pool.requests.is_empty() {
                    break;
                }
                let Some(conn) = pool.try_checkout() else {
                    break;
                };
                let waiter = pool.requests.pop().expect("requests is non-empty");
                let handle = ConnectionHandle::new(conn, Arc::downgrade(shared));
                effects.push_fulfill_ok(waiter.tx, handle);
            }
            self.update_pool_state(shared, host);
        }

        self.update_controller(shared, host);

        let members = {
            let Some(pool) = self.pools.get(host) else {
                return;
            };
            self.clubs
                .get(&pool.club)
                .map(|club| club.members.iter().cloned().collect::<Vec<_>>())
        };
        for member in members.into_iter().flatten() {
            effects.push_spawn(member);
        }
    }

    /// Fail all pending waiters on `host`. The timer fires at the earliest
    /// deadline; anything at or past it is expired in one sweep.
    pub(crate) fn expire_waiters(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        effects: &mut Effects,
    ) {
        let now = shared.factory.now();
        let Some(pool) = self.pools.get_mut(host) else {
            return;
        };
        while let Some(head) = pool.requests.peek() {
            if head.expires_at > now {
                break;
            }
            let waiter = pool.requests.pop().expect("requests is non-empty");
            stats::record_acquire_timeout(host);
            effects.push_fulfill_err(
                waiter.tx,
                Error::deadline_exceeded("couldn't get a connection within the time limit"),
            );
        }
    }

    /// Cascade a failure: invalidate the generation, drop pooled
    /// connections, park in-flight processing in the dropped map, and fail
    /// every pending waiter with `status`.
    ///
    /// Checked-out connections are not touched; their eventual return finds
    /// the generation bumped and lapses.
    pub(crate) fn process_failure(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        status: Error,
        effects: &mut Effects,
    ) {
        {
            let Some(pool) = self.pools.get_mut(host) else {
                return;
            };
            pool.generation += 1;

            if !pool.ready.is_empty() || !pool.processing.is_empty() {
                warn!(host = %host, error = %status, "dropping all pooled connections");
            }

            pool.ready.clear();

            if pool.state != PoolState::InShutdown {
                // Keep in-flight completions addressable; they will not be
                // reused.
                let processing: Vec<(u64, Arc<PooledConn>)> = pool.processing.drain().collect();
                for (id, conn) in processing {
                    pool.dropped_processing.insert(id, conn);
                }
            } else {
                pool.processing.clear();
            }

            let waiters = std::mem::take(&mut pool.requests);
            for waiter in waiters {
                effects.push_fulfill_err(waiter.tx, status.clone());
            }
        }

        self.update_pool_state(shared, host);
    }

    /// Enter shutdown and run the failure cascade. The pool delists itself
    /// once processing drains and the last callback leaves.
    pub(crate) fn trigger_shutdown(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        status: Error,
        effects: &mut Effects,
    ) {
        {
            let Some(pool) = self.pools.get_mut(host) else {
                return;
            };
            pool.state = PoolState::InShutdown;
            pool.dropped_processing.clear();
        }
        self.process_failure(shared, host, status, effects);
    }

    /// A host pool timed out idle. Tear the club down only when every member
    /// has: a quiet pool must not be destroyed while its siblings still serve
    /// traffic that might route to it next.
    pub(crate) fn check_shutdown(
        &mut self,
        shared: &Arc<PoolShared>,
        host: &HostAndPort,
        effects: &mut Effects,
    ) {
        let members = {
            let Some(pool) = self.pools.get(host) else {
                return;
            };
            let Some(club) = self.clubs.get(&pool.club) else {
                return;
            };
            club.members.iter().cloned().collect::<Vec<_>>()
        };

        for member in &members {
            if let Some(pool) = self.pools.get(member) {
                if pool.state != PoolState::HostTimedOut {
                    return;
                }
            }
        }

        for member in &members {
            self.trigger_shutdown(
                shared,
                member,
                Error::deadline_exceeded(
                    "connection pool has been idle for longer than the host timeout",
                ),
                effects,
            );
        }
    }

    /// Recompute the pool's lifecycle state and (re)arm the request timer for
    /// whichever of its three roles applies. In shutdown, delist the pool
    /// once nothing can re-enter it.
    pub(crate) fn update_pool_state(&mut self, shared: &Arc<PoolShared>, host: &HostAndPort) {
        let Some(pool) = self.pools.get_mut(host) else {
            return;
        };

        if pool.state == PoolState::InShutdown {
            if pool.processing.is_empty() && pool.pending_spawns == 0 && pool.active_clients == 0 {
                debug!(host = %host, "delisting connection pool");
                let club = pool.club;
                self.pools.remove(host);
                let mut drop_club = false;
                if let Some(club_state) = self.clubs.get_mut(&club) {
                    club_state.members.remove(host);
                    drop_club = club_state.set_name.is_none() && club_state.members.is_empty();
                }
                if drop_club {
                    self.clubs.remove(&club);
                }
            }
            return;
        }

        if let Some(head) = pool.requests.peek().map(|w| w.expires_at) {
            // Waiters outstanding: the timer fires at the earliest deadline.
            if pool.state == PoolState::Running && pool.request_timer_expiration == Some(head) {
                return;
            }

            pool.state = PoolState::Running;
            pool.request_timer.cancel_timeout();
            pool.request_timer_expiration = Some(head);

            let delay = head.saturating_duration_since(shared.factory.now());
            let weak = Arc::downgrade(shared);
            let host_cb = host.clone();
            pool.request_timer.set_timeout(
                delay,
                Box::new(move || {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    enter_guarded(&shared, host_cb, |inner, shared, host, effects| {
                        inner.expire_waiters(shared, host, effects);
                    });
                }),
            );
        } else if !pool.checked_out.is_empty() {
            // Connections in use but nobody waiting: stay running, no timer.
            pool.request_timer.cancel_timeout();
            pool.state = PoolState::Running;
            pool.request_timer_expiration = None;
        } else {
            // Nothing pending and nothing checked out: count down the host
            // timeout. Any new request resets this.
            if pool.state == PoolState::Idle {
                return;
            }
            pool.state = PoolState::Idle;
            pool.request_timer.cancel_timeout();

            let timeout = shared.tunables.host_timeout();
            pool.request_timer_expiration = Some(shared.factory.now() + timeout);

            let weak = Arc::downgrade(shared);
            let host_cb = host.clone();
            pool.request_timer.set_timeout(
                timeout,
                Box::new(move || {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    let mut effects = Effects::default();
                    {
                        let mut inner = shared.inner.lock();
                        let timed_out = match inner.pools.get_mut(&host_cb) {
                            Some(pool) if pool.state == PoolState::Idle => {
                                pool.state = PoolState::HostTimedOut;
                                true
                            }
                            _ => false,
                        };
                        if timed_out {
                            inner.check_shutdown(&shared, &host_cb, &mut effects);
                        }
                    }
                    effects.run(&shared);
                }),
            );
        }
    }
}

enum IoKind {
    Setup,
    Refresh,
}

/// Spawn connections until the pool meets its target:
/// `max(club.min_conns, min(waiters + checked_out, max_connections))`,
/// rate-limited by `max_connecting`. The connection object is manufactured
/// with the lock released; a reservation keeps the caps honest meanwhile.
pub(crate) fn spawn_connections(shared: &Arc<PoolShared>, host: &HostAndPort) {
    loop {
        let (generation, ssl_mode) = {
            let mut guard = shared.inner.lock();
            let inner = &mut *guard;
            let Some(pool) = inner.pools.get_mut(host) else {
                return;
            };
            if pool.state == PoolState::InShutdown {
                return;
            }

            let min_conns = inner.clubs.get(&pool.club).map_or(0, |c| c.min_conns);
            let target = min_conns.max(
                (pool.requests.len() + pool.checked_out.len())
                    .min(shared.tunables.max_connections()),
            );
            let open = pool.open_connections() + pool.pending_spawns;
            let connecting = pool.processing.len() + pool.pending_spawns;

            if open >= target || connecting >= shared.tunables.max_connecting() {
                return;
            }

            if pool.ready.is_empty() && pool.processing.is_empty() && pool.pending_spawns == 0 {
                info!(host = %host, "connecting");
            }

            pool.pending_spawns += 1;
            pool.created += 1;
            (pool.generation, pool.ssl_mode)
        };

        // Construct the connection object outside the lock.
        let transport = shared.factory.make_connection(host, ssl_mode, generation);
        let conn = Arc::new(PooledConn::new(
            shared.next_conn_id(),
            generation,
            transport,
            shared.factory.make_timer(),
            shared.factory.clone(),
        ));
        stats::record_connection_created(host);

        {
            let mut inner = shared.inner.lock();
            let Some(pool) = inner.pools.get_mut(host) else {
                return;
            };
            pool.pending_spawns -= 1;
            if pool.state == PoolState::InShutdown {
                return;
            }
            pool.processing.insert(conn.id(), conn.clone());
        }

        launch_io(shared, conn, IoKind::Setup);
    }
}

fn launch_io(shared: &Arc<PoolShared>, conn: Arc<PooledConn>, kind: IoKind) {
    let weak = Arc::downgrade(shared);
    let limit = shared.tunables.refresh_timeout();
    tokio::spawn(async move {
        let transport = conn.transport();
        let io = async {
            match kind {
                IoKind::Setup => transport.setup(limit).await,
                IoKind::Refresh => transport.refresh(limit).await,
            }
        };
        // The transport gets the limit for its own bookkeeping, but the pool
        // enforces it regardless.
        let status = match tokio::time::timeout(limit, io).await {
            Ok(status) => status,
            Err(_) => Err(Error::deadline_exceeded(
                "connection did not complete setup/refresh within the refresh timeout",
            )),
        };

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let host = conn.host().clone();
        enter_guarded(&shared, host, move |inner, shared, host, effects| {
            inner.finish_refresh(shared, host, conn, status, effects);
        });
    });
}

/// Launch a refresh for a connection already parked in processing.
pub(crate) fn launch_refresh(shared: &Arc<PoolShared>, conn: Arc<PooledConn>) {
    launch_io(shared, conn, IoKind::Refresh);
}

/// Entry point for the handle deleter: runs on the runtime, re-enters the
/// pool under the lock.
pub(crate) fn return_connection_entry(shared: &Arc<PoolShared>, conn: Arc<PooledConn>) {
    let host = conn.host().clone();
    enter_guarded(shared, host, move |inner, shared, host, effects| {
        inner.return_connection(shared, host, conn, effects);
    });
}
