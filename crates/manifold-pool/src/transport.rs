//! Transport-facing seams.
//!
//! The pool never opens sockets itself: it drives a [`ConnectionFactory`]
//! that manufactures [`ClientConnection`]s and reactor-bound [`Timer`]s, and
//! it decides *when* to set up, refresh, hand out or discard each connection.
//! Everything below the factory (dialing, authentication handshakes, wire
//! encoding) belongs to the transport implementation.

use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::host::HostAndPort;

/// TLS mode requested for connections to a host.
///
/// The first acquisition against a host pins its mode; mixing modes for a
/// single host is a caller bug and aborts the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SslMode {
    /// Follow the process-wide TLS setting
    #[default]
    Global,
    /// Force TLS on
    Enabled,
    /// Force TLS off
    Disabled,
}

/// Bitmask of session tags used to scope broadcast connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagMask(u32);

impl TagMask {
    /// Tag carried by pools that have not been classified yet
    pub const PENDING: TagMask = TagMask(1 << 0);
    /// Pools that should survive broad administrative drops
    pub const KEEP_OPEN: TagMask = TagMask(1 << 1);
    /// Pools serving cluster-internal traffic
    pub const INTERNAL_CLIENT: TagMask = TagMask(1 << 2);

    /// An empty mask, matching nothing
    pub const fn empty() -> Self {
        TagMask(0)
    }

    /// Build a mask from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        TagMask(bits)
    }

    /// The raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Whether this mask shares any bit with `other`
    pub const fn matches(&self, other: TagMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for TagMask {
    fn default() -> Self {
        TagMask::PENDING
    }
}

impl BitOr for TagMask {
    type Output = TagMask;

    fn bitor(self, rhs: TagMask) -> TagMask {
        TagMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for TagMask {
    fn bitor_assign(&mut self, rhs: TagMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TagMask {
    type Output = TagMask;

    fn bitand(self, rhs: TagMask) -> TagMask {
        TagMask(self.0 & rhs.0)
    }
}

/// A one-shot timer bound to the I/O reactor.
///
/// Each connection owns exactly one and each host pool owns exactly one; the
/// pool re-arms them between roles, always cancelling before arming.
pub trait Timer: Send + Sync {
    /// Schedule `callback` to run once after `after`. Replaces any previously
    /// scheduled callback.
    fn set_timeout(&self, after: Duration, callback: Box<dyn FnOnce() + Send>);

    /// Cancel the pending callback, if any
    fn cancel_timeout(&self);
}

/// Stock [`Timer`] backed by a tokio task.
///
/// Must be armed from within a tokio runtime; under a paused test clock the
/// deadline advances deterministically with the rest of the runtime.
pub struct TokioTimer {
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TokioTimer {
    /// Create an unarmed timer
    pub fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TokioTimer {
    fn set_timeout(&self, after: Duration, callback: Box<dyn FnOnce() + Send>) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            callback();
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_timeout(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}

/// A single physical connection as the pool sees it.
///
/// `setup` runs the dial plus whatever handshake the transport needs before
/// the connection can carry commands; `refresh` revalidates a connection that
/// sat idle past the refresh requirement. Both are driven with the pool lock
/// released and report back exactly once.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// The remote this connection targets
    fn host(&self) -> &HostAndPort;

    /// The pool generation this connection was stamped with at creation
    fn generation(&self) -> u64;

    /// Establish the connection. `timeout` is advisory; the pool also
    /// enforces it from the outside.
    async fn setup(&self, timeout: Duration) -> Result<()>;

    /// Revalidate an idle connection
    async fn refresh(&self, timeout: Duration) -> Result<()>;

    /// Cheap liveness probe, consulted before handing the connection out
    fn is_healthy(&self) -> bool;
}

/// Creates connections and timers, and owns the monotonic clock.
pub trait ConnectionFactory: Send + Sync {
    /// Synchronously construct a connection object for `host`. No I/O happens
    /// here; dialing is deferred to [`ClientConnection::setup`].
    fn make_connection(
        &self,
        host: &HostAndPort,
        ssl_mode: SslMode,
        generation: u64,
    ) -> Arc<dyn ClientConnection>;

    /// Make a one-shot reactor timer
    fn make_timer(&self) -> Box<dyn Timer>;

    /// Monotonic now
    fn now(&self) -> Instant;

    /// Stop creating connections; called once when the owning pool shuts down
    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tag_mask_matching() {
        let tags = TagMask::PENDING | TagMask::KEEP_OPEN;
        assert!(tags.matches(TagMask::KEEP_OPEN));
        assert!(tags.matches(TagMask::PENDING | TagMask::INTERNAL_CLIENT));
        assert!(!tags.matches(TagMask::INTERNAL_CLIENT));
        assert!(!tags.matches(TagMask::empty()));
        assert_eq!((tags & TagMask::KEEP_OPEN).bits(), TagMask::KEEP_OPEN.bits());
    }

    #[test]
    fn test_tag_mask_default_is_pending() {
        assert_eq!(TagMask::default(), TagMask::PENDING);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = TokioTimer::new();

        let fired_clone = fired.clone();
        timer.set_timeout(
            Duration::from_millis(50),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_cancel_then_arm() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = TokioTimer::new();

        let first = fired.clone();
        timer.set_timeout(
            Duration::from_millis(50),
            Box::new(move || {
                first.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.cancel_timeout();

        let second = fired.clone();
        timer.set_timeout(
            Duration::from_millis(20),
            Box::new(move || {
                second.fetch_add(10, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_rearm_replaces() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = TokioTimer::new();

        let first = fired.clone();
        timer.set_timeout(
            Duration::from_millis(10),
            Box::new(move || {
                first.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let second = fired.clone();
        timer.set_timeout(
            Duration::from_millis(30),
            Box::new(move || {
                second.fetch_add(10, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
