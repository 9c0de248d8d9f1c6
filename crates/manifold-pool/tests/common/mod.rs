//! Scriptable mock transport for pool tests.
//!
//! The factory hands out connections whose setup/refresh calls sleep for a
//! configured delay and then succeed or fail on command; under a paused
//! tokio clock that makes every timing in the pool deterministic.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use manifold_pool::{
    ClientConnection, ConnectionFactory, Error, HostAndPort, Result, SslMode, Timer, TokioTimer,
};

#[derive(Clone)]
pub struct MockBehavior {
    pub setup_delay: Duration,
    pub refresh_delay: Duration,
    pub fail_setup: Option<Error>,
    pub fail_refresh: Option<Error>,
    pub healthy: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            setup_delay: Duration::ZERO,
            refresh_delay: Duration::ZERO,
            fail_setup: None,
            fail_refresh: None,
            healthy: true,
        }
    }
}

pub struct MockConnection {
    host: HostAndPort,
    generation: u64,
    ssl_mode: SslMode,
    behavior: Arc<Mutex<MockBehavior>>,
    healthy: AtomicBool,
    setup_count: AtomicUsize,
    refresh_count: AtomicUsize,
}

impl MockConnection {
    pub fn setups(&self) -> usize {
        self.setup_count.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientConnection for MockConnection {
    fn host(&self) -> &HostAndPort {
        &self.host
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    async fn setup(&self, _timeout: Duration) -> Result<()> {
        let behavior = self.behavior.lock().clone();
        tokio::time::sleep(behavior.setup_delay).await;
        self.setup_count.fetch_add(1, Ordering::SeqCst);
        match behavior.fail_setup {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn refresh(&self, _timeout: Duration) -> Result<()> {
        let behavior = self.behavior.lock().clone();
        tokio::time::sleep(behavior.refresh_delay).await;
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        match behavior.fail_refresh {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockFactory {
    behavior: Arc<Mutex<MockBehavior>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    made: AtomicUsize,
    shut_down: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connections_made(&self) -> usize {
        self.made.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn connections_for(&self, host: &HostAndPort) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|conn| conn.host == *host)
            .cloned()
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn set_setup_delay(&self, delay: Duration) {
        self.behavior.lock().setup_delay = delay;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.behavior.lock().refresh_delay = delay;
    }

    pub fn fail_setup_with(&self, error: Option<Error>) {
        self.behavior.lock().fail_setup = error;
    }

    pub fn fail_refresh_with(&self, error: Option<Error>) {
        self.behavior.lock().fail_refresh = error;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.behavior.lock().healthy = healthy;
    }
}

impl ConnectionFactory for MockFactory {
    fn make_connection(
        &self,
        host: &HostAndPort,
        ssl_mode: SslMode,
        generation: u64,
    ) -> Arc<dyn ClientConnection> {
        let healthy = self.behavior.lock().healthy;
        let conn = Arc::new(MockConnection {
            host: host.clone(),
            generation,
            ssl_mode,
            behavior: self.behavior.clone(),
            healthy: AtomicBool::new(healthy),
            setup_count: AtomicUsize::new(0),
            refresh_count: AtomicUsize::new(0),
        });
        self.made.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().push(conn.clone());
        conn
    }

    fn make_timer(&self) -> Box<dyn Timer> {
        Box::new(TokioTimer::new())
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Opt-in log output while debugging a test:
/// `RUST_LOG=manifold_pool=debug cargo test -- --nocapture`
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Let everything queued on the runtime (spawned tasks, timers about to
/// fire) run to quiescence under the paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn host(name: &str) -> HostAndPort {
    HostAndPort::new(name, 7300)
}
