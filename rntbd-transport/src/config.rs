//! Configuration for the direct TCP transport.

use std::time::Duration;

/// What happens to a queued acquisition that outlives its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionTimeoutAction {
    /// Run the acquisition again as if it had just been requested.
    Reissue,
    /// Fail the acquisition with [`crate::error::TransportError::AcquisitionTimeout`].
    Fail,
}

/// Configuration shared by every endpoint of a transport.
///
/// Channel and queue limits per endpoint, the request and acquisition
/// deadlines, and the thresholds the health checker uses to tell a hung
/// channel from a quiet one.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long dialing a replica may take.
    pub connect_timeout: Duration,

    /// How long a request may stay in flight once written to a channel.
    pub request_timeout: Duration,

    /// How long an acquisition may wait in the pending queue.
    pub acquisition_timeout: Duration,

    /// Pool-wide policy for acquisitions that exceed `acquisition_timeout`.
    pub acquisition_timeout_action: AcquisitionTimeoutAction,

    /// Upper bound on channels (acquired plus available) per endpoint.
    pub max_channels_per_endpoint: usize,

    /// Upper bound on requests in flight on one channel.
    pub max_requests_per_channel: usize,

    /// Upper bound on queued acquisitions per endpoint.
    pub max_pending_acquisitions: usize,

    /// A read this recent proves a channel healthy without further checks.
    pub recent_read_window: Duration,

    /// Largest tolerated gap between the last write and the last read.
    pub read_delay_limit: Duration,

    /// How long after the last write a missing read is forgiven.
    pub read_hang_grace_period: Duration,

    /// Largest tolerated gap between a write attempt and its completion.
    pub write_delay_limit: Duration,

    /// How long after a write attempt a missing completion is forgiven.
    pub write_hang_grace_period: Duration,

    /// Channels silent for longer than this are closed. `None` disables it.
    pub idle_connection_timeout: Option<Duration>,

    /// Whether channels are health checked before returning to the pool.
    pub health_check_on_release: bool,

    /// Endpoints without traffic for longer than this are evicted.
    pub idle_endpoint_timeout: Option<Duration>,

    /// Initial capacity of each channel's read buffer.
    pub read_buffer_capacity: usize,

    /// Largest frame or payload accepted from a replica.
    pub max_frame_length: usize,

    /// Sent during context negotiation.
    pub user_agent: String,

    /// Protocol client version sent during context negotiation.
    pub client_version: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            acquisition_timeout: Duration::from_secs(5),
            acquisition_timeout_action: AcquisitionTimeoutAction::Reissue,
            max_channels_per_endpoint: 130,
            max_requests_per_channel: 30,
            max_pending_acquisitions: 10_000,
            recent_read_window: Duration::from_secs(1),
            read_delay_limit: Duration::from_secs(65),
            read_hang_grace_period: Duration::from_secs(45),
            write_delay_limit: Duration::from_secs(10),
            write_hang_grace_period: Duration::from_secs(2),
            idle_connection_timeout: None,
            health_check_on_release: true,
            idle_endpoint_timeout: Some(Duration::from_secs(3_600)),
            read_buffer_capacity: 64 * 1024,
            max_frame_length: i32::MAX as usize,
            user_agent: concat!("rntbd-transport/", env!("CARGO_PKG_VERSION")).to_string(),
            client_version: "2018-12-31".to_string(),
        }
    }
}

impl TransportConfig {
    /// Small pools and sub-second deadlines, for tests against in-memory or
    /// loopback replicas.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            acquisition_timeout: Duration::from_millis(500),
            acquisition_timeout_action: AcquisitionTimeoutAction::Reissue,
            max_channels_per_endpoint: 4,
            max_requests_per_channel: 8,
            max_pending_acquisitions: 64,
            recent_read_window: Duration::from_millis(100),
            read_delay_limit: Duration::from_secs(2),
            read_hang_grace_period: Duration::from_secs(1),
            write_delay_limit: Duration::from_secs(1),
            write_hang_grace_period: Duration::from_millis(500),
            idle_connection_timeout: None,
            health_check_on_release: true,
            idle_endpoint_timeout: None,
            read_buffer_capacity: 4 * 1024,
            max_frame_length: 1024 * 1024,
            user_agent: "rntbd-transport-test".to_string(),
            client_version: "2018-12-31".to_string(),
        }
    }

    /// How often the pool sweeps its pending queue for expired acquisitions.
    pub fn acquisition_sweep_interval(&self) -> Duration {
        self.acquisition_timeout
            .checked_div(4)
            .unwrap_or_default()
            .max(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_channels_per_endpoint, 130);
        assert_eq!(config.max_requests_per_channel, 30);
        assert_eq!(
            config.acquisition_timeout_action,
            AcquisitionTimeoutAction::Reissue
        );
        assert!(config.user_agent.starts_with("rntbd-transport/"));
    }

    #[test]
    fn test_dev_default_is_tighter() {
        let config = TransportConfig::dev_default();
        let default = TransportConfig::default();
        assert_eq!(config.max_frame_length, 1 << 20);
        assert!(config.max_frame_length < default.max_frame_length);
        assert!(config.request_timeout < default.request_timeout);
        assert!(config.max_channels_per_endpoint < default.max_channels_per_endpoint);
    }

    #[test]
    fn test_sweep_interval_has_a_floor() {
        let mut config = TransportConfig::dev_default();
        assert_eq!(config.acquisition_sweep_interval(), Duration::from_millis(125));
        config.acquisition_timeout = Duration::ZERO;
        assert_eq!(config.acquisition_sweep_interval(), Duration::from_millis(10));
    }
}
