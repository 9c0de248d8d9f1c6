//! Pooled connection state and the user-facing checkout handle.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Error;
use crate::host::HostAndPort;
use crate::pool::PoolShared;
use crate::transport::{ClientConnection, ConnectionFactory, Timer};

/// User-visible status of a checked-out connection.
///
/// A connection is `Unknown` from checkout until the user reports an outcome.
/// Returning a connection that is not `Ok` discards it.
#[derive(Debug, Clone)]
pub enum ConnectionStatus {
    /// The last command on this connection succeeded
    Ok,
    /// Checked out, no outcome reported yet
    Unknown,
    /// The user reported a failure
    Failed(Error),
}

impl ConnectionStatus {
    /// Whether the connection was reported healthy by its last user
    pub fn is_ok(&self) -> bool {
        matches!(self, ConnectionStatus::Ok)
    }

    /// Whether the user reported a failure
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionStatus::Failed(_))
    }
}

struct ConnState {
    status: ConnectionStatus,
    last_used: Instant,
}

/// A transport connection plus the bookkeeping the pool hangs off it: the
/// generation stamp, the last-used time, the user-status slot and the single
/// owned timer that alternates between refresh-due and deadline roles.
///
/// Owned by exactly one host pool at a time, in exactly one of its four
/// collections.
pub(crate) struct PooledConn {
    id: u64,
    generation: u64,
    transport: Arc<dyn ClientConnection>,
    timer: Box<dyn Timer>,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<ConnState>,
}

impl PooledConn {
    pub(crate) fn new(
        id: u64,
        generation: u64,
        transport: Arc<dyn ClientConnection>,
        timer: Box<dyn Timer>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let now = factory.now();
        Self {
            id,
            generation,
            transport,
            timer,
            factory,
            state: Mutex::new(ConnState {
                status: ConnectionStatus::Unknown,
                last_used: now,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn host(&self) -> &HostAndPort {
        self.transport.host()
    }

    pub(crate) fn transport(&self) -> Arc<dyn ClientConnection> {
        self.transport.clone()
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.state.lock().status.clone()
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.state.lock().last_used
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    pub(crate) fn indicate_success(&self) {
        self.state.lock().status = ConnectionStatus::Ok;
    }

    pub(crate) fn indicate_failure(&self, error: Error) {
        self.state.lock().status = ConnectionStatus::Failed(error);
    }

    pub(crate) fn indicate_used(&self) {
        let mut state = self.state.lock();
        // Using a connection after reporting failure on it is a caller bug.
        debug_assert!(!state.status.is_failed());
        state.last_used = self.factory.now();
    }

    pub(crate) fn reset_to_unknown(&self) {
        self.state.lock().status = ConnectionStatus::Unknown;
    }

    pub(crate) fn set_timeout(&self, after: Duration, callback: Box<dyn FnOnce() + Send>) {
        self.timer.set_timeout(after, callback);
    }

    pub(crate) fn cancel_timeout(&self) {
        self.timer.cancel_timeout();
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.timer.cancel_timeout();
    }
}

/// A checked-out connection.
///
/// Move-only: dropping the handle schedules the connection's return to its
/// host pool on the runtime. Between checkout and drop the user reports the
/// outcome of whatever commands ran through [`indicate_success`] /
/// [`indicate_failure`]; a connection returned without a success report is
/// discarded rather than reused.
///
/// [`indicate_success`]: ConnectionHandle::indicate_success
/// [`indicate_failure`]: ConnectionHandle::indicate_failure
pub struct ConnectionHandle {
    conn: Option<Arc<PooledConn>>,
    pool: Weak<PoolShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(conn: Arc<PooledConn>, pool: Weak<PoolShared>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    fn conn(&self) -> &Arc<PooledConn> {
        self.conn.as_ref().expect("connection already returned")
    }

    /// The host this connection targets
    pub fn host(&self) -> &HostAndPort {
        self.conn().host()
    }

    /// The pool generation this connection was created under
    pub fn generation(&self) -> u64 {
        self.conn().generation()
    }

    /// The current user-status of the connection
    pub fn status(&self) -> ConnectionStatus {
        self.conn().status()
    }

    /// Access the transport connection to issue commands
    pub fn connection(&self) -> &dyn ClientConnection {
        &*self.conn().transport
    }

    /// Report that commands on this connection succeeded. Required for the
    /// connection to be eligible for reuse after return.
    pub fn indicate_success(&self) {
        self.conn().indicate_success();
    }

    /// Report a command failure; the connection will be discarded on return
    pub fn indicate_failure(&self, error: Error) {
        self.conn().indicate_failure(error);
    }

    /// Record that the connection carried traffic just now, pushing back its
    /// refresh deadline
    pub fn indicate_used(&self) {
        self.conn().indicate_used();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Some(shared) = self.pool.upgrade() else {
            // Pool is gone; the connection just closes.
            return;
        };
        // Return on the runtime rather than on whichever thread dropped us.
        // With no runtime left (process teardown) the connection closes here.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                crate::specific::return_connection_entry(&shared, conn);
            });
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("host", self.conn().host())
            .field("generation", &self.conn().generation())
            .finish()
    }
}
