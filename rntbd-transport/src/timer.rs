//! Request expiration timer.
//!
//! Expirations run on a dedicated runtime handle so the completion work
//! stays off the channel I/O tasks.  Every armed timeout must be cancelled
//! when its record completes normally.

use {
    crate::record::RequestRecord,
    std::sync::{Arc, Weak},
    tokio::{runtime::Handle, task::AbortHandle},
};

/// An armed expiration.
#[derive(Debug)]
pub struct Timeout {
    abort: AbortHandle,
}

impl Timeout {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Arms per-request expirations.
#[derive(Debug, Clone)]
pub struct RequestTimer {
    handle: Handle,
}

impl RequestTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// A timer on the runtime the caller is running in.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Expires `record` after its timeout unless cancelled first.
    pub fn arm(&self, record: &Arc<RequestRecord>) -> Timeout {
        let timeout = record.timeout();
        let record: Weak<RequestRecord> = Arc::downgrade(record);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(record) = record.upgrade() {
                record.expire();
            }
        });
        Timeout {
            abort: task.abort_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            address::PhysicalAddress,
            error::TransportError,
            frame::{OperationType, ResourceType},
            message::{RequestArgs, ServiceRequest},
            record::PendingResponse,
        },
        assert_matches::assert_matches,
        std::time::Duration,
    };

    fn record(timeout: Duration) -> (Arc<RequestRecord>, PendingResponse) {
        let address = PhysicalAddress::parse("rntbd://127.0.0.1:1/r/").unwrap();
        let request = ServiceRequest::new(OperationType::Read, ResourceType::Document);
        RequestRecord::new(RequestArgs::new(request, address, 1), timeout)
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_timeout_expires_record() {
        let timer = RequestTimer::current();
        let (record, pending) = record(Duration::from_millis(50));
        let _timeout = timer.arm(&record);
        assert_matches!(pending.await, Err(TransportError::RequestTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timeout_does_not_fire() {
        let timer = RequestTimer::current();
        let (record, _pending) = record(Duration::from_millis(50));
        let timeout = timer.arm(&record);
        timeout.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!record.is_completed());
    }
}
