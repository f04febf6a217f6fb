//! Backoff policy for channel acquisition.
//!
//! The pool never retries on its own beyond reissuing expired acquisitions.
//! Schedulers that warm up connections ahead of traffic consult this policy
//! between attempts.

use {
    crate::error::TransportError,
    rand::Rng,
    std::time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    /// Attempts after the first that may be made.
    pub max_retries: u32,
}

impl Default for AcquisitionRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
            max_retries: 5,
        }
    }
}

impl AcquisitionRetryPolicy {
    /// Backoff before retry number `retry` (zero based), before jitter.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry`, or `None` once retries are
    /// exhausted.  The delay is drawn from `[base / 2, base]`.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let base = self.base_backoff(retry);
        let floor = base.checked_div(2).unwrap_or_default();
        Some(rand::rng().random_range(floor..=base))
    }

    /// Whether `error` is worth another acquisition attempt.
    pub fn is_retryable(error: &TransportError) -> bool {
        matches!(
            error,
            TransportError::Connect { .. }
                | TransportError::AcquisitionTimeout { .. }
                | TransportError::TooManyPendingAcquisitions { .. }
                | TransportError::ChannelClosed { .. }
                | TransportError::ContextNegotiation { .. }
                | TransportError::Io(_)
        )
    }

    pub fn should_retry(&self, error: &TransportError, retry: u32) -> bool {
        retry < self.max_retries && Self::is_retryable(error)
    }
}
