//! Registry for tag-scoped broadcast operations across pools.
//!
//! A process typically runs several independent connection pools (one per
//! task-executor). Administrative actions like "drop every connection that
//! isn't keep-open" need to reach all of them; pools register here at
//! construction and deregister on shutdown.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::host::HostAndPort;
use crate::pool::ConnectionPool;
use crate::transport::TagMask;

/// Weak registry of pools participating in tag-based broadcasts.
#[derive(Default)]
pub struct EgressTagCloserManager {
    pools: Mutex<Vec<Weak<ConnectionPool>>>,
}

impl EgressTagCloserManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, pool: &Arc<ConnectionPool>) {
        self.pools.lock().push(Arc::downgrade(pool));
    }

    pub(crate) fn remove(&self, pool: &ConnectionPool) {
        self.pools
            .lock()
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), pool) && weak.strong_count() > 0);
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionPool>> {
        let mut pools = self.pools.lock();
        pools.retain(|weak| weak.strong_count() > 0);
        pools.iter().filter_map(Weak::upgrade).collect()
    }

    /// Drop pooled connections on every registered pool whose host pools
    /// match `tags`
    pub fn drop_connections(&self, tags: TagMask) {
        for pool in self.snapshot() {
            pool.drop_connections_by_tag(tags);
        }
    }

    /// Mutate the tag mask for `host` across every registered pool
    pub fn mutate_tags(&self, host: &HostAndPort, mutate: &dyn Fn(TagMask) -> TagMask) {
        for pool in self.snapshot() {
            pool.mutate_tags(host, mutate);
        }
    }
}

impl fmt::Debug for EgressTagCloserManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EgressTagCloserManager")
            .field("pools", &self.pools.lock().len())
            .finish()
    }
}
