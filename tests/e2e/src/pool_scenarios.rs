//! E2E Test: Channel Pool Scenarios
//!
//! Exercises the per-endpoint pool against a live loopback replica:
//! - A saturated pool queues acquisitions and serves them on release
//! - Queued acquisitions are served first come, first served
//! - Closing the pool fails queued acquisitions
//! - A channel released to the wrong pool is closed and reported
//! - acquired + available never exceeds the channel limit under load
//! - Dial failures reach the caller

use {
    assert_matches::assert_matches,
    rntbd_e2e_tests::{
        helpers::*,
        replica::{FakeReplica, Reply},
    },
    rntbd_transport::{
        connector::TcpConnector,
        metrics::EndpointMetrics,
        pool::ChannelPool,
        timer::RequestTimer,
        PhysicalAddress, TransportConfig, TransportError,
    },
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{sync::Mutex, task::JoinSet},
};

fn pool(address: PhysicalAddress, config: &TransportConfig) -> Arc<ChannelPool> {
    Arc::new(ChannelPool::new(
        address,
        config,
        Arc::new(TcpConnector::new(config.connect_timeout)),
        RequestTimer::current(),
        Arc::new(EndpointMetrics::new()),
    ))
}

async fn wait_for_pending(pool: &ChannelPool, pending: usize) {
    assert!(
        wait_for(Duration::from_secs(2), || async {
            pool.snapshot().await.pending == pending
        })
        .await,
        "pool never reached {pending} pending acquisitions"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: a saturated pool queues the next acquisition until a release
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_saturated_pool_serves_queued_acquisition_on_release() {
    init_logging();
    println!("\n========================================");
    println!("  POOL: one channel, two acquirers");
    println!("========================================\n");

    let replica = FakeReplica::echo().await;
    let pool = pool(replica.address(), &config(1));

    let first = pool.acquire().await.unwrap();
    println!("✓ First acquisition dialed channel {}", first.id());

    let second = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    wait_for_pending(&pool, 1).await;
    assert!(!second.is_finished());
    let snapshot = pool.snapshot().await;
    assert_eq!(snapshot.acquired, 1);
    assert_eq!(snapshot.available, 0);
    println!("✓ Second acquisition queued: {snapshot:?}");

    let id = first.id();
    pool.release(first).await.unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(replica.connections(), 1);
    println!("✓ Released channel handed to the queued acquirer");

    pool.release(second).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_a_single_channel() {
    init_logging();

    let replica = FakeReplica::start(|_| Reply::Delayed {
        delay: Duration::from_millis(100),
        reply: Box::new(Reply::Echo),
    })
    .await;
    let provider = provider(config(1));

    let first = provider
        .request(read_request(b"one"), replica.address())
        .unwrap();
    let second = provider
        .request(read_request(b"two"), replica.address())
        .unwrap();
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().content.as_deref(), Some(&b"one"[..]));
    assert_eq!(second.unwrap().content.as_deref(), Some(&b"two"[..]));
    assert_eq!(replica.connections(), 1);
    assert_eq!(replica.requests(), 2);
    println!("✓ Two in-flight requests multiplexed over one connection");

    provider.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: queued acquisitions are served in arrival order
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_queued_acquisitions_are_fifo() {
    init_logging();

    let replica = FakeReplica::echo().await;
    let pool = pool(replica.address(), &config(1));
    let held = pool.acquire().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = JoinSet::new();
    for index in 0..3usize {
        let waiter_pool = pool.clone();
        let order = order.clone();
        waiters.spawn(async move {
            let channel = waiter_pool.acquire().await.unwrap();
            order.lock().await.push(index);
            waiter_pool.release(channel).await.unwrap();
        });
        wait_for_pending(&pool, index.saturating_add(1)).await;
    }

    pool.release(held).await.unwrap();
    while let Some(result) = waiters.join_next().await {
        result.unwrap();
    }
    assert_eq!(*order.lock().await, vec![0, 1, 2]);
    println!("✓ Waiters served in order {:?}", order.lock().await);

    pool.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: closing the pool fails every queued acquisition
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_fails_pending_acquisitions() {
    init_logging();

    let replica = FakeReplica::echo().await;
    let pool = pool(replica.address(), &config(1));
    let held = pool.acquire().await.unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        })
        .collect();
    wait_for_pending(&pool, 2).await;

    pool.close().await;
    for waiter in waiters {
        assert_matches!(
            waiter.await.unwrap(),
            Err(TransportError::PoolClosed { .. })
        );
    }
    println!("✓ Both queued acquisitions failed with PoolClosed");

    assert!(!held.is_active());
    assert!(pool.snapshot().await.closed);
    assert_matches!(pool.acquire().await, Err(TransportError::PoolClosed { .. }));
    println!("✓ Held channel closed, later acquisitions rejected");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: releasing a channel to a pool that did not dial it
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_foreign_release_closes_channel() {
    init_logging();

    let replica = FakeReplica::echo().await;
    let config = config(2);
    let owner = pool(replica.address(), &config);
    let stranger = pool(replica.address(), &config);

    let channel = owner.acquire().await.unwrap();
    let kept = channel.clone();
    assert_matches!(
        stranger.release(channel).await,
        Err(TransportError::InternalState(_))
    );
    assert!(!kept.is_active());
    assert_eq!(stranger.snapshot().await.available, 0);
    println!("✓ Foreign release rejected and the channel closed");

    owner.close().await;
    stranger.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: channel limit holds under concurrent load
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channel_limit_holds_under_load() {
    init_logging();
    println!("\n========================================");
    println!("  POOL: 16 workers, 3 channels");
    println!("========================================\n");

    const MAX_CHANNELS: usize = 3;
    let replica = FakeReplica::echo().await;
    let pool = pool(replica.address(), &config(MAX_CHANNELS));
    let acquisitions = Arc::new(AtomicUsize::new(0));

    let mut workers = JoinSet::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let acquisitions = acquisitions.clone();
        workers.spawn(async move {
            for _ in 0..10 {
                let channel = pool.acquire().await.unwrap();
                acquisitions.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(2)).await;
                pool.release(channel).await.unwrap();
            }
        });
    }

    let monitor = tokio::spawn({
        let pool = pool.clone();
        async move {
            let mut samples = 0usize;
            while !pool.is_closed() {
                let snapshot = pool.snapshot().await;
                let total = snapshot.acquired.saturating_add(snapshot.available);
                assert!(total <= MAX_CHANNELS, "{snapshot:?}");
                samples = samples.saturating_add(1);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            samples
        }
    });

    while let Some(result) = workers.join_next().await {
        result.unwrap();
    }
    assert_eq!(acquisitions.load(Ordering::Relaxed), 160);
    assert!(replica.connections() <= MAX_CHANNELS);
    println!(
        "✓ 160 acquisitions over {} connections",
        replica.connections()
    );

    pool.close().await;
    let samples = monitor.await.unwrap();
    println!("✓ acquired + available <= {MAX_CHANNELS} across {samples} samples");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: a refused dial fails the request as unavailable
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_refused_connection_fails_request() {
    init_logging();

    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let address = PhysicalAddress::parse(&format!("rntbd://127.0.0.1:{port}/replica/")).unwrap();
    let provider = provider(config(1));

    let error = provider
        .request(read_request(b"nobody"), address)
        .unwrap()
        .await
        .unwrap_err();
    let TransportError::Unavailable { cause, .. } = error else {
        panic!("expected unavailable, got {error:?}");
    };
    assert_matches!(*cause, TransportError::Connect { .. });
    println!("✓ Refused dial -> Unavailable ({cause})");

    provider.close().await;
}
