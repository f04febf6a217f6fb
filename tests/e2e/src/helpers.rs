//! Shared setup for the end-to-end tests.

use {
    rntbd_transport::{
        frame::{OperationType, ResourceType},
        EndpointProvider, ServiceRequest, TransportConfig,
    },
    std::{future::Future, sync::Arc, time::Duration},
};

/// Initialize logging for tests. Call once per test; repeated calls are
/// ignored.
pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// Dev config with `max_channels` channels per endpoint.
pub fn config(max_channels: usize) -> TransportConfig {
    TransportConfig {
        max_channels_per_endpoint: max_channels,
        ..TransportConfig::dev_default()
    }
}

pub fn provider(config: TransportConfig) -> Arc<EndpointProvider> {
    EndpointProvider::new(config)
}

/// A document read carrying `payload` and a session token.
pub fn read_request(payload: &'static [u8]) -> ServiceRequest {
    ServiceRequest::new(OperationType::Read, ResourceType::Document)
        .with_header("x-ms-session-token", "0:1#41")
        .with_content(payload)
}

/// Polls `condition` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now().checked_add(timeout).unwrap();
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
