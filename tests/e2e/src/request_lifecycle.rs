//! E2E Test: Request Lifecycle
//!
//! Verifies a single request end to end over loopback TCP:
//! - Context negotiation happens once per connection
//! - Success responses carry payload and headers back to the caller
//! - Error statuses map to typed service errors
//! - Silent replicas time requests out, late responses are dropped
//! - A rejected context fails the request as unavailable

use {
    assert_matches::assert_matches,
    rntbd_e2e_tests::{
        helpers::*,
        replica::{FakeReplica, Reply, PARTITION_KEY_RANGE_ID, SESSION_TOKEN},
    },
    rntbd_transport::{error::sub_status, ServiceErrorKind, TransportError},
    std::time::Duration,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test: echo round trip
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_echo_round_trip() {
    init_logging();
    println!("\n========================================");
    println!("  REQUEST LIFECYCLE: echo round trip");
    println!("========================================\n");

    let replica = FakeReplica::echo().await;
    let provider = provider(config(2));

    let response = provider
        .request(read_request(b"hello"), replica.address())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content.as_deref(), Some(&b"hello"[..]));
    println!("✓ Payload echoed back");

    assert_eq!(response.session_token(), Some(SESSION_TOKEN));
    assert_eq!(response.lsn(), Some(42));
    assert_eq!(response.request_charge(), Some(1.5));
    println!("✓ Response headers mapped to their HTTP names");

    assert_eq!(replica.connections(), 1);
    assert_eq!(replica.context_requests(), 1);
    assert_eq!(replica.requests(), 1);

    let endpoint = provider.get(&replica.address()).unwrap();
    let metrics = endpoint.metrics().snapshot();
    assert_eq!(metrics.requests, 1);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.failed, 0);
    assert_eq!(metrics.concurrent_requests, 0);
    assert!(metrics.bytes_written > 0 && metrics.bytes_read > 0);
    println!("✓ Endpoint metrics: {metrics:?}");

    provider.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: a second request reuses the negotiated connection
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sequential_requests_share_one_connection() {
    init_logging();

    let replica = FakeReplica::echo().await;
    let provider = provider(config(2));

    for _ in 0..5 {
        let response = provider
            .request(read_request(b"again"), replica.address())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }
    assert_eq!(replica.connections(), 1);
    assert_eq!(replica.context_requests(), 1);
    assert_eq!(replica.requests(), 5);
    println!("✓ Five requests, one connection, one context negotiation");

    provider.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: 410 with sub-status 1002 surfaces as partition key range gone
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_gone_maps_to_partition_key_range_gone() {
    init_logging();

    let replica = FakeReplica::start(|_| Reply::Status {
        status: 410,
        sub_status: Some(sub_status::PARTITION_KEY_RANGE_GONE),
    })
    .await;
    let provider = provider(config(2));

    let error = provider
        .request(read_request(b"gone"), replica.address())
        .unwrap()
        .await
        .unwrap_err();
    let TransportError::Service(error) = error else {
        panic!("expected a service error, got {error:?}");
    };
    assert_eq!(error.kind, ServiceErrorKind::PartitionKeyRangeGone);
    assert_eq!(error.status, 410);
    assert_eq!(error.sub_status, sub_status::PARTITION_KEY_RANGE_GONE);
    assert_eq!(error.message, "scripted 410");
    assert_eq!(error.lsn, Some(42));
    assert_eq!(error.partition_key_range_id.as_deref(), Some(PARTITION_KEY_RANGE_ID));
    assert_eq!(error.resource_address, replica.address().to_string());
    assert_eq!(
        error.response_headers.get("x-ms-substatus").map(String::as_str),
        Some("1002")
    );
    println!("✓ 410/1002 -> {:?} with headers and resource address", error.kind);

    let endpoint = provider.get(&replica.address()).unwrap();
    assert_eq!(endpoint.metrics().snapshot().failed, 1);

    provider.close().await;
}

#[tokio::test]
async fn test_throttled_maps_to_request_rate_too_large() {
    init_logging();

    let replica = FakeReplica::start(|_| Reply::Status {
        status: 429,
        sub_status: None,
    })
    .await;
    let provider = provider(config(2));

    let error = provider
        .request(read_request(b"throttled"), replica.address())
        .unwrap()
        .await
        .unwrap_err();
    assert_matches!(
        error,
        TransportError::Service(error) if error.kind == ServiceErrorKind::RequestRateTooLarge
    );
    println!("✓ 429 -> RequestRateTooLarge");

    provider.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: a silent replica times the request out
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_silent_replica_times_out() {
    init_logging();

    let replica = FakeReplica::start(|_| Reply::Silence).await;
    let mut config = config(2);
    config.request_timeout = Duration::from_millis(200);
    let provider = provider(config);

    let error = provider
        .request(read_request(b"anyone"), replica.address())
        .unwrap()
        .await
        .unwrap_err();
    assert_matches!(
        error,
        TransportError::RequestTimeout { timeout, .. } if timeout == Duration::from_millis(200)
    );
    println!("✓ No response within 200ms -> RequestTimeout");

    provider.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: a response arriving after the timeout is dropped, the channel lives on
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_late_response_is_dropped() {
    init_logging();

    let replica = FakeReplica::start(|request| match request.payload.as_deref() {
        Some(b"slow") => Reply::Delayed {
            delay: Duration::from_millis(400),
            reply: Box::new(Reply::Echo),
        },
        _ => Reply::Echo,
    })
    .await;
    let mut config = config(1);
    config.request_timeout = Duration::from_millis(200);
    let provider = provider(config);

    let error = provider
        .request(read_request(b"slow"), replica.address())
        .unwrap()
        .await
        .unwrap_err();
    assert_matches!(error, TransportError::RequestTimeout { .. });
    println!("✓ Slow request timed out");

    // Let the late reply land on the channel.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let response = provider
        .request(read_request(b"fast"), replica.address())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.content.as_deref(), Some(&b"fast"[..]));
    assert_eq!(replica.connections(), 1);
    println!("✓ Late reply dropped, next request served on the same connection");

    provider.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: context rejection fails the request as unavailable
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_context_rejection_fails_request() {
    init_logging();

    let replica = FakeReplica::rejecting(401).await;
    let provider = provider(config(1));

    let error = provider
        .request(read_request(b"denied"), replica.address())
        .unwrap()
        .await
        .unwrap_err();
    let TransportError::Unavailable { cause, .. } = error else {
        panic!("expected unavailable, got {error:?}");
    };
    // The rejection closes the channel; the request either sat in the
    // negotiation hold or found the channel already closed.
    assert_matches!(*cause, TransportError::ChannelClosed { .. });
    assert_eq!(replica.requests(), 0);
    println!("✓ Context rejected with 401 -> Unavailable ({cause})");

    provider.close().await;
}
