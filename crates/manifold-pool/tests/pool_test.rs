//! Per-host pool state machine tests, driven through a scriptable mock
//! transport under a paused tokio clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{host, settle, MockFactory};
use manifold_pool::{
    ConnectionPool, ConnectionPoolStats, EgressTagCloserManager, Error, PoolOptions, SslMode,
    TagMask,
};

fn options() -> PoolOptions {
    PoolOptions::default().with_name("test")
}

#[tokio::test(start_paused = true)]
async fn test_warm_reuse() {
    common::init_tracing();
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(
        options().with_min_connections(1).with_max_connections(4),
        factory.clone(),
    );
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.indicate_success();
    drop(conn);
    settle().await;

    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    let per_host = stats.host(&h).unwrap();
    assert_eq!(per_host.created, 1);
    assert_eq!(per_host.available, 1);
    assert_eq!(per_host.in_use, 0);

    // The warmed connection is handed back out without another dial.
    let again = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(factory.connections_made(), 1);

    again.indicate_success();
    drop(again);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_try_get_uses_ready_connection() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    // Nothing pooled yet.
    assert!(pool.try_get(&h, SslMode::Global).is_none());

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.indicate_success();
    drop(conn);
    settle().await;

    let conn = pool.try_get(&h, SslMode::Global).unwrap();
    assert_eq!(factory.connections_made(), 1);
    conn.indicate_success();
    drop(conn);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_try_get_defers_to_queued_waiters() {
    let factory = MockFactory::new();
    factory.set_setup_delay(Duration::from_millis(50));
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let waiting = {
        let pool = pool.clone();
        let h = h.clone();
        tokio::spawn(async move { pool.get(&h, SslMode::Global, Duration::from_secs(1)).await })
    };
    settle().await;

    // A waiter is queued; try_get must not jump the line.
    assert!(pool.try_get(&h, SslMode::Global).is_none());

    let conn = waiting.await.unwrap().unwrap();
    conn.indicate_success();
    drop(conn);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_with_connection_caps() {
    let factory = MockFactory::new();
    factory.set_setup_delay(Duration::from_millis(50));
    let pool = ConnectionPool::new(
        options().with_max_connections(2).with_max_connecting(2),
        factory.clone(),
    );
    let h = host("a");

    let mut waiters = Vec::new();
    for i in 0..5 {
        let pool = pool.clone();
        let h = h.clone();
        waiters.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let result = pool.get(&h, SslMode::Global, Duration::from_millis(100)).await;
            (i, start.elapsed(), result)
        }));
    }
    settle().await;

    // Only two connections may dial at once, and only two may exist at all.
    assert_eq!(factory.connections_made(), 2);

    tokio::time::sleep(Duration::from_millis(55)).await;

    // The two earliest waiters got the two connections after the ~50ms dial.
    let (_, first_elapsed, first) = waiters.remove(0).await.unwrap();
    let (_, second_elapsed, second) = waiters.remove(0).await.unwrap();
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first_elapsed >= Duration::from_millis(45) && first_elapsed <= Duration::from_millis(60));
    assert!(second_elapsed <= Duration::from_millis(60));

    first.indicate_success();
    second.indicate_success();
    drop(first);
    drop(second);
    settle().await;

    // Returning them feeds the next two waiters without new dials.
    let (_, _, third) = waiters.remove(0).await.unwrap();
    let (_, _, fourth) = waiters.remove(0).await.unwrap();
    let third = third.unwrap();
    let fourth = fourth.unwrap();
    assert_eq!(factory.connections_made(), 2);

    // Hold the pool at capacity past the last waiter's deadline.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let (_, fifth_elapsed, fifth) = waiters.remove(0).await.unwrap();
    match fifth {
        Err(Error::DeadlineExceeded { .. }) => {}
        other => panic!("expected deadline error, got {:?}", other.map(|_| ())),
    }
    assert!(fifth_elapsed >= Duration::from_millis(95) && fifth_elapsed <= Duration::from_millis(105));

    third.indicate_success();
    fourth.indicate_success();
    drop(third);
    drop(fourth);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_generation_invalidation_on_drop_connections() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();

    // Invalidate while the handle is still out.
    pool.drop_connections(&h);

    conn.indicate_success();
    drop(conn);
    settle().await;

    // The returning connection is from a stale generation and is destroyed,
    // not returned to the ready pool.
    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    assert_eq!(stats.host(&h).unwrap().available, 0);
    assert_eq!(pool.get_num_connections_per_host(&h), 0);
}

#[tokio::test(start_paused = true)]
async fn test_returned_without_success_is_discarded() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    // No indicate_success: the pool cannot trust this connection.
    drop(conn);
    settle().await;

    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    assert_eq!(stats.host(&h).unwrap().available, 0);

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(factory.connections_made(), 2);
    conn.indicate_failure(Error::connection_failed("server hung up"));
    drop(conn);
    settle().await;

    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    assert_eq!(stats.host(&h).unwrap().available, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_after_idle_interval() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(
        options().with_refresh_requirement(Duration::from_millis(50)),
        factory.clone(),
    );
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.indicate_success();
    drop(conn);
    settle().await;

    tokio::time::sleep(Duration::from_millis(60)).await;

    // The idle connection was refreshed exactly once and kept its identity.
    assert_eq!(factory.connections_made(), 1);
    let transports = factory.connections_for(&h);
    assert_eq!(transports.len(), 1);
    assert_eq!(transports[0].refreshes(), 1);

    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    assert_eq!(stats.host(&h).unwrap().available, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_ready_connection_is_replaced() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.indicate_success();
    drop(conn);
    settle().await;

    // The pooled connection goes bad while idle.
    factory.connections_for(&h)[0].set_healthy(false);

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(factory.connections_made(), 2);
    conn.indicate_success();
    drop(conn);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_earlier_deadline_fails_first() {
    let factory = MockFactory::new();
    factory.set_setup_delay(Duration::from_secs(10));
    let pool = ConnectionPool::new(
        options().with_min_connections(0).with_max_connections(0),
        factory.clone(),
    );
    let h = host("a");

    let slow = {
        let pool = pool.clone();
        let h = h.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let result = pool.get(&h, SslMode::Global, Duration::from_millis(100)).await;
            (start.elapsed(), result)
        })
    };
    let fast = {
        let pool = pool.clone();
        let h = h.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let result = pool.get(&h, SslMode::Global, Duration::from_millis(50)).await;
            (start.elapsed(), result)
        })
    };

    let (fast_elapsed, fast_result) = fast.await.unwrap();
    assert!(matches!(fast_result, Err(Error::DeadlineExceeded { .. })));
    assert!(fast_elapsed >= Duration::from_millis(45) && fast_elapsed <= Duration::from_millis(60));

    let (slow_elapsed, slow_result) = slow.await.unwrap();
    assert!(matches!(slow_result, Err(Error::DeadlineExceeded { .. })));
    assert!(slow_elapsed >= Duration::from_millis(95) && slow_elapsed <= Duration::from_millis(110));

    // With a zero connection budget nothing was ever dialed.
    assert_eq!(factory.connections_made(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_max_connecting_rate_limits_dials() {
    let factory = MockFactory::new();
    factory.set_setup_delay(Duration::from_millis(10));
    let pool = ConnectionPool::new(options().with_max_connecting(2), factory.clone());
    let h = host("a");

    let mut waiters = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let h = h.clone();
        waiters.push(tokio::spawn(async move {
            pool.get(&h, SslMode::Global, Duration::from_secs(1)).await
        }));
    }
    settle().await;

    // Four waiters, but only two dials in flight.
    assert_eq!(factory.connections_made(), 2);

    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut handles = Vec::new();
    for waiter in waiters {
        handles.push(waiter.await.unwrap().unwrap());
    }
    assert_eq!(factory.connections_made(), 4);

    for handle in &handles {
        handle.indicate_success();
    }
    drop(handles);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_setup_timeout_respawns_without_failing_the_pool() {
    let factory = MockFactory::new();
    // Dials hang well past the refresh timeout.
    factory.set_setup_delay(Duration::from_secs(60));
    let pool = ConnectionPool::new(
        options().with_refresh_timeout(Duration::from_millis(100)),
        factory.clone(),
    );
    let h = host("a");

    let waiter = {
        let pool = pool.clone();
        let h = h.clone();
        tokio::spawn(async move {
            pool.get(&h, SslMode::Global, Duration::from_millis(250)).await
        })
    };
    settle().await;
    assert_eq!(factory.connections_made(), 1);

    // First dial misses the 100ms connect deadline; the pool respawns
    // rather than failing the request, whose own deadline is still ahead.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(factory.connections_made() >= 2);

    // The request eventually fails on its own deadline, not the dial's.
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::DeadlineExceeded { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_fails_pending_requests() {
    let factory = MockFactory::new();
    factory.set_setup_delay(Duration::from_millis(10));
    factory.fail_setup_with(Some(Error::connection_failed("connection refused")));
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let result = pool.get(&h, SslMode::Global, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_waiters_and_rejects_new_gets() {
    let factory = MockFactory::new();
    factory.set_setup_delay(Duration::from_secs(10));
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let waiter = {
        let pool = pool.clone();
        let h = h.clone();
        tokio::spawn(async move { pool.get(&h, SslMode::Global, Duration::from_secs(5)).await })
    };
    settle().await;

    pool.shutdown();
    settle().await;

    assert!(factory.is_shut_down());
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::PoolShutdown { .. })));

    let result = pool.get(&h, SslMode::Global, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(Error::PoolShutdown { .. })));

    // The host pool delisted once its in-flight work was cleared.
    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    assert_eq!(stats.host_count(), 0);
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "mixing ssl modes")]
async fn test_ssl_mode_mismatch_panics() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Enabled, Duration::from_secs(1))
        .await
        .unwrap();
    conn.indicate_success();
    drop(conn);
    settle().await;

    let _ = pool.get(&h, SslMode::Disabled, Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_ssl_mode_reaches_the_factory() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(options(), factory.clone());
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Enabled, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(matches!(
        factory.connections_for(&h)[0].ssl_mode(),
        SslMode::Enabled
    ));
    conn.indicate_success();
    drop(conn);
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_drop_connections_by_tag_hits_matching_pools() {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(options(), factory.clone());
    let h1 = host("a");
    let h2 = host("b");

    for h in [&h1, &h2] {
        let conn = pool.get(h, SslMode::Global, Duration::from_secs(1)).await.unwrap();
        conn.indicate_success();
        drop(conn);
    }
    settle().await;

    // h1 opts out of pending-tag drops.
    pool.mutate_tags(&h1, |_| TagMask::KEEP_OPEN);

    pool.drop_connections_by_tag(TagMask::PENDING);
    settle().await;

    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    assert_eq!(stats.host(&h1).unwrap().available, 1);
    assert_eq!(stats.host(&h2).unwrap().available, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manager_broadcasts_tag_drops() {
    let manager = Arc::new(EgressTagCloserManager::new());
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(
        options().with_manager(manager.clone()),
        factory.clone(),
    );
    let h = host("a");

    let conn = pool
        .get(&h, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.indicate_success();
    drop(conn);
    settle().await;

    manager.drop_connections(TagMask::PENDING);
    settle().await;

    let mut stats = ConnectionPoolStats::new();
    pool.append_connection_stats(&mut stats);
    assert_eq!(stats.host(&h).unwrap().available, 0);

    // Shutdown deregisters the pool; further broadcasts find nothing.
    pool.shutdown();
    manager.drop_connections(TagMask::PENDING);
}
