//! Replica-set change notifications.
//!
//! Topology monitors publish config and primary changes here; listeners
//! (connection pools, cursor managers, …) react to them. Listener callbacks
//! are never invoked while the notifier lock is held (the listener set and
//! the change data are snapshotted first), so a listener is free to take its
//! own locks or call back into the notifier.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::host::{ConnectionString, HostAndPort};

/// A party interested in replica-set topology changes.
pub trait ReplicaSetChangeListener: Send + Sync {
    /// The member list of a set changed
    fn handle_config(&self, config: &ConnectionString);

    /// The primary of a set changed
    fn handle_primary(&self, set_name: &str, primary: &HostAndPort);
}

/// Hook invoked with each confirmed (and unconfirmed) config change.
pub type ChangeHook = Arc<dyn Fn(ConnectionString) + Send + Sync>;

#[derive(Default, Clone)]
struct LastChange {
    config: Option<ConnectionString>,
    primary: Option<HostAndPort>,
}

#[derive(Default)]
struct NotifierState {
    listeners: Vec<Arc<dyn ReplicaSetChangeListener>>,
    last_change: HashMap<String, LastChange>,
    sync_hook: Option<ChangeHook>,
    async_hook: Option<ChangeHook>,
}

/// Fan-out point for replica-set topology updates.
#[derive(Default)]
pub struct ReplicaSetChangeNotifier {
    state: Mutex<NotifierState>,
}

impl ReplicaSetChangeNotifier {
    /// Create a notifier with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and replay the last known config and primary of
    /// every set to it.
    pub fn add_listener(&self, listener: Arc<dyn ReplicaSetChangeListener>) {
        let replay: Vec<(String, LastChange)> = {
            let mut state = self.state.lock();
            state.listeners.push(listener.clone());
            state
                .last_change
                .iter()
                .map(|(set, data)| (set.clone(), data.clone()))
                .collect()
        };

        for (set_name, data) in replay {
            if let Some(config) = &data.config {
                listener.handle_config(config);
            }
            if let Some(primary) = &data.primary {
                listener.handle_primary(&set_name, primary);
            }
        }
    }

    /// Register the synchronous config hook. May be registered once.
    pub fn register_sync_hook(&self, hook: ChangeHook) {
        let mut state = self.state.lock();
        debug_assert!(state.sync_hook.is_none(), "sync hook already registered");
        state.sync_hook = Some(hook);
    }

    /// Register the asynchronous config hook, run on a spawned task so a
    /// slow hook (it may go over the network) never blocks the publisher.
    /// May be registered once.
    pub fn register_async_hook(&self, hook: ChangeHook) {
        let mut state = self.state.lock();
        debug_assert!(state.async_hook.is_none(), "async hook already registered");
        state.async_hook = Some(hook);
    }

    /// Publish a confirmed config change
    pub fn update_config(&self, config: ConnectionString) {
        debug!(config = %config, "replica set config changed");

        let (sync_hook, async_hook, listeners) = {
            let mut state = self.state.lock();
            if let Some(set_name) = config.set_name() {
                state
                    .last_change
                    .entry(set_name.to_string())
                    .or_default()
                    .config = Some(config.clone());
            }
            (
                state.sync_hook.clone(),
                state.async_hook.clone(),
                state.listeners.clone(),
            )
        };

        if let Some(hook) = sync_hook {
            hook(config.clone());
        }
        if let Some(hook) = async_hook {
            let config = config.clone();
            tokio::spawn(async move {
                hook(config);
            });
        }

        for listener in listeners {
            listener.handle_config(&config);
        }
    }

    /// Publish a primary change
    pub fn update_primary(&self, set_name: &str, primary: HostAndPort) {
        debug!(set = set_name, primary = %primary, "replica set primary changed");

        let listeners = {
            let mut state = self.state.lock();
            state
                .last_change
                .entry(set_name.to_string())
                .or_default()
                .primary = Some(primary.clone());
            state.listeners.clone()
        };

        for listener in listeners {
            listener.handle_primary(set_name, &primary);
        }
    }

    /// Publish a config seen but not yet confirmed by the set; only the
    /// hooks care about these.
    pub fn update_unconfirmed_config(&self, config: ConnectionString) {
        let sync_hook = self.state.lock().sync_hook.clone();
        if let Some(hook) = sync_hook {
            hook(config);
        }
    }
}

impl std::fmt::Debug for ReplicaSetChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReplicaSetChangeNotifier")
            .field("listeners", &state.listeners.len())
            .field("sets", &state.last_change.len())
            .finish()
    }
}
