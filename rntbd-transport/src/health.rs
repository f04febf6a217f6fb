//! Channel health checks.
//!
//! A channel is judged from its read and write timestamps alone.  Only when
//! the timestamps prove nothing either way does the checker ping.

use {
    crate::{
        channel::Channel,
        config::TransportConfig,
        manager::ChannelTimestamps,
    },
    log::{debug, warn},
    std::{
        fmt,
        time::{Duration, Instant},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhealthyReason {
    Closed,
    /// Writes were attempted but have not completed for too long.
    WriteHang { delay: Duration, hang: Duration },
    /// Writes completed but nothing has been read back for too long.
    ReadHang { delay: Duration, hang: Duration },
    Idle { idle: Duration },
    PingFailed(String),
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel is closed"),
            Self::WriteHang { delay, hang } => write!(
                f,
                "write hang: last write completed {delay:?} before the last attempt, {hang:?} ago"
            ),
            Self::ReadHang { delay, hang } => write!(
                f,
                "read hang: last read {delay:?} before the last write, {hang:?} ago"
            ),
            Self::Idle { idle } => write!(f, "idle for {idle:?}"),
            Self::PingFailed(error) => write!(f, "ping failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Unhealthy(UnhealthyReason),
    /// Nothing conclusive; a ping decides.
    NeedsPing,
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    recent_read_window: Duration,
    read_delay_limit: Duration,
    read_hang_grace_period: Duration,
    write_delay_limit: Duration,
    write_hang_grace_period: Duration,
    idle_connection_timeout: Option<Duration>,
}

impl HealthChecker {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            recent_read_window: config.recent_read_window,
            read_delay_limit: config.read_delay_limit,
            read_hang_grace_period: config.read_hang_grace_period,
            write_delay_limit: config.write_delay_limit,
            write_hang_grace_period: config.write_hang_grace_period,
            idle_connection_timeout: config.idle_connection_timeout,
        }
    }

    /// Judges a live channel from its timestamps as of `now`.
    pub fn evaluate(&self, timestamps: &ChannelTimestamps, now: Instant) -> Verdict {
        if now.saturating_duration_since(timestamps.last_read) < self.recent_read_window {
            return Verdict::Healthy;
        }

        let write_delay = timestamps
            .last_write_attempt
            .saturating_duration_since(timestamps.last_write);
        let write_hang = now.saturating_duration_since(timestamps.last_write_attempt);
        if write_delay > self.write_delay_limit && write_hang > self.write_hang_grace_period {
            return Verdict::Unhealthy(UnhealthyReason::WriteHang {
                delay: write_delay,
                hang: write_hang,
            });
        }

        let read_delay = timestamps
            .last_write
            .saturating_duration_since(timestamps.last_read);
        let read_hang = now.saturating_duration_since(timestamps.last_write);
        if read_delay > self.read_delay_limit && read_hang > self.read_hang_grace_period {
            return Verdict::Unhealthy(UnhealthyReason::ReadHang {
                delay: read_delay,
                hang: read_hang,
            });
        }

        if let Some(timeout) = self.idle_connection_timeout {
            let idle = now.saturating_duration_since(timestamps.last_read);
            if idle > timeout {
                return Verdict::Unhealthy(UnhealthyReason::Idle { idle });
            }
        }

        Verdict::NeedsPing
    }

    /// Checks `channel`, pinging it when its timestamps are inconclusive.
    pub async fn check(&self, channel: &Channel) -> Result<(), UnhealthyReason> {
        if !channel.is_active() {
            return Err(UnhealthyReason::Closed);
        }
        match self.evaluate(&channel.timestamps(), Instant::now()) {
            Verdict::Healthy => Ok(()),
            Verdict::Unhealthy(reason) => Err(reason),
            Verdict::NeedsPing => {
                debug!("pinging channel {} to {}", channel.id(), channel.address());
                match tokio::time::timeout(self.write_hang_grace_period, channel.ping()).await {
                    Ok(result) => {
                        result.map_err(|error| UnhealthyReason::PingFailed(error.to_string()))
                    }
                    Err(_) => Err(UnhealthyReason::PingFailed(format!(
                        "no flush within {:?}",
                        self.write_hang_grace_period
                    ))),
                }
            }
        }
    }

    pub async fn is_healthy(&self, channel: &Channel) -> bool {
        match self.check(channel).await {
            Ok(()) => true,
            Err(reason) => {
                warn!(
                    "channel {} to {} is unhealthy: {reason}",
                    channel.id(),
                    channel.address()
                );
                false
            }
        }
    }
}
