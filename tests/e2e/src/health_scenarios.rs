//! E2E Test: Channel Health
//!
//! Verifies black-hole detection on live connections:
//! - A recent read proves a channel healthy without a ping
//! - An inconclusive channel is pinged, and the ping reaches the replica
//! - Writes that are never answered mark the channel read-hung
//! - Idle channels are reported and replaced by the pool

use {
    assert_matches::assert_matches,
    rntbd_e2e_tests::{
        helpers::*,
        replica::{FakeReplica, Reply},
    },
    rntbd_transport::{
        connector::TcpConnector,
        health::{HealthChecker, UnhealthyReason},
        metrics::EndpointMetrics,
        pool::ChannelPool,
        record::RequestRecord,
        timer::RequestTimer,
        RequestArgs, TransportConfig,
    },
    std::{sync::Arc, time::Duration},
};

fn pool(replica: &FakeReplica, config: &TransportConfig) -> ChannelPool {
    ChannelPool::new(
        replica.address(),
        config,
        Arc::new(TcpConnector::new(config.connect_timeout)),
        RequestTimer::current(),
        Arc::new(EndpointMetrics::new()),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: a recent read short-circuits the check
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_recent_read_is_healthy_without_ping() {
    init_logging();
    println!("\n========================================");
    println!("  HEALTH: recent read, no ping");
    println!("========================================\n");

    let replica = FakeReplica::echo().await;
    let config = TransportConfig {
        recent_read_window: Duration::from_secs(5),
        ..config(1)
    };
    let pool = pool(&replica, &config);
    let channel = pool.acquire().await.unwrap();

    let before = channel.timestamps();
    HealthChecker::new(&config).check(&channel).await.unwrap();
    assert_eq!(channel.timestamps().last_ping, before.last_ping);
    assert_eq!(replica.pings(), 0);
    println!("✓ Healthy on the context read alone, no ping written");

    pool.release(channel).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_inconclusive_channel_is_pinged() {
    init_logging();

    let replica = FakeReplica::echo().await;
    let config = TransportConfig {
        recent_read_window: Duration::ZERO,
        ..config(1)
    };
    let pool = pool(&replica, &config);
    let channel = pool.acquire().await.unwrap();

    let before = channel.timestamps();
    tokio::time::sleep(Duration::from_millis(5)).await;
    HealthChecker::new(&config).check(&channel).await.unwrap();
    let after = channel.timestamps();
    assert!(after.last_ping > before.last_ping);
    assert!(after.last_write > before.last_write);
    assert!(
        wait_for(Duration::from_secs(1), || async { replica.pings() == 1 }).await,
        "ping never reached the replica"
    );
    assert_eq!(replica.requests(), 0);
    println!("✓ Inconclusive timestamps resolved by a ping the replica received");

    // The replica's answer to the ping matches nothing; the channel carries on.
    let args = RequestArgs::new(read_request(b"after ping"), replica.address(), 1);
    let (record, pending) = RequestRecord::new(args, config.request_timeout);
    channel.write(record).unwrap();
    assert_eq!(pending.await.unwrap().status, 200);
    assert!(channel.is_active());
    println!("✓ Channel still serves requests after the ping");

    pool.release(channel).await.unwrap();
    pool.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: a replica that swallows requests is detected as read-hung
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_black_holed_replica_is_read_hung() {
    init_logging();

    let replica = FakeReplica::start(|_| Reply::Silence).await;
    let config = TransportConfig {
        recent_read_window: Duration::from_millis(10),
        read_delay_limit: Duration::from_millis(50),
        read_hang_grace_period: Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
        ..config(1)
    };
    let pool = pool(&replica, &config);
    let channel = pool.acquire().await.unwrap();
    let checker = HealthChecker::new(&config);

    // Outlive the read delay limit before writing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let args = RequestArgs::new(read_request(b"void"), replica.address(), 1);
    let (record, _pending) = RequestRecord::new(args, config.request_timeout);
    channel.write(record).unwrap();
    assert!(
        wait_for(Duration::from_secs(1), || async { replica.requests() == 1 }).await,
        "request never reached the replica"
    );
    println!("✓ Request written, replica stays silent");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_matches!(
        checker.check(&channel).await,
        Err(UnhealthyReason::ReadHang { delay, hang })
            if delay > Duration::from_millis(50) && hang > Duration::from_millis(100)
    );
    assert!(!checker.is_healthy(&channel).await);
    println!("✓ Channel reported read-hung");

    pool.release(channel).await.unwrap();
    pool.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: idle channels are reported and replaced
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_channel_is_replaced() {
    init_logging();

    let replica = FakeReplica::echo().await;
    let config = TransportConfig {
        recent_read_window: Duration::from_millis(10),
        idle_connection_timeout: Some(Duration::from_millis(100)),
        ..config(1)
    };
    let pool = pool(&replica, &config);

    let first = pool.acquire().await.unwrap();
    pool.release(first.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_matches!(
        HealthChecker::new(&config).check(&first).await,
        Err(UnhealthyReason::Idle { idle }) if idle > Duration::from_millis(100)
    );
    println!("✓ Channel idle past the timeout");

    let second = pool.acquire().await.unwrap();
    assert_ne!(second.id(), first.id());
    assert!(!first.is_active());
    assert_eq!(replica.connections(), 2);
    println!("✓ Pool closed the idle channel and dialed a fresh one");

    pool.release(second).await.unwrap();
    pool.close().await;
}
