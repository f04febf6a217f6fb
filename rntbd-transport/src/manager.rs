//! Per-channel request tracking.
//!
//! The [`RequestManager`] owns everything a channel knows about its
//! requests: the table of in-flight records keyed by transport request id,
//! the negotiated [`Context`], and the read/write timestamps the health
//! checker inspects.  A record leaves the table exactly when it completes,
//! whichever way that happens, and its expiration is cancelled then.

use {
    crate::{
        address::PhysicalAddress,
        config::TransportConfig,
        error::{Result, TransportError},
        message::{Context, Response, HEALTH_CHECK_TRANSPORT_REQUEST_ID},
        record::{RequestRecord, Stage},
        report_issue,
        timer::{RequestTimer, Timeout},
    },
    dashmap::{mapref::entry::Entry, DashMap},
    log::{debug, info, trace, warn},
    std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::sync::watch,
};

/// The four instants the health checker reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimestamps {
    pub last_read: Instant,
    pub last_write_attempt: Instant,
    pub last_write: Instant,
    pub last_ping: Instant,
}

struct PendingEntry {
    record: Arc<RequestRecord>,
    timeout: Timeout,
}

pub struct RequestManager {
    address: PhysicalAddress,
    max_requests: usize,
    timer: RequestTimer,
    pending: DashMap<u32, PendingEntry>,
    context: watch::Sender<Option<Arc<Context>>>,
    context_requested: AtomicBool,
    closed: AtomicBool,
    epoch: Instant,
    last_read: AtomicU64,
    last_write_attempt: AtomicU64,
    last_write: AtomicU64,
    last_ping: AtomicU64,
}

impl RequestManager {
    pub fn new(address: PhysicalAddress, config: &TransportConfig, timer: RequestTimer) -> Arc<Self> {
        let (context, _) = watch::channel(None);
        Arc::new(Self {
            address,
            max_requests: config.max_requests_per_channel,
            timer,
            pending: DashMap::new(),
            context,
            context_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            epoch: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write_attempt: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            last_ping: AtomicU64::new(0),
        })
    }

    pub fn address(&self) -> &PhysicalAddress {
        &self.address
    }

    // ── Pending requests ────────────────────────────────────────────────

    /// Tracks `record` and arms its expiration.
    pub fn add(self: &Arc<Self>, record: Arc<RequestRecord>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed {
                address: self.address.to_string(),
                reason: "request manager closed".to_string(),
            });
        }

        let id = record.transport_request_id();
        match self.pending.entry(id) {
            Entry::Occupied(_) => {
                return Err(report_issue!(
                    "duplicate transport request id {id} on channel to {}",
                    self.address
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    timeout: self.timer.arm(&record),
                    record: record.clone(),
                });
            }
        }

        let manager = Arc::downgrade(self);
        record.on_complete(move |record| {
            if let Some(manager) = manager.upgrade() {
                manager.remove(record.transport_request_id());
            }
        });

        // Lost a race with fail_all_pending.
        if self.closed.load(Ordering::Acquire) {
            record.fail(TransportError::ChannelClosed {
                address: self.address.to_string(),
                reason: "request manager closed".to_string(),
            });
        }
        Ok(())
    }

    fn remove(&self, id: u32) {
        if let Some((_, entry)) = self.pending.remove(&id) {
            entry.timeout.cancel();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    /// Completes the record a response belongs to.
    ///
    /// A response for an id no longer tracked (the record expired, was
    /// cancelled, or failed) is logged and dropped.
    pub fn on_response(&self, response: Response) {
        let Some(id) = response.transport_request_id() else {
            warn!(
                "dropping response without transport request id from {} (activity {})",
                self.address,
                response.activity_id()
            );
            return;
        };
        if id == HEALTH_CHECK_TRANSPORT_REQUEST_ID {
            trace!("ping answered with status {} by {}", response.status_code(), self.address);
            return;
        }
        let Some(record) = self.pending.get(&id).map(|entry| entry.record.clone()) else {
            debug!(
                "dropping response with status {} for untracked request #{id} from {}",
                response.status_code(),
                self.address
            );
            return;
        };

        if let Err(error) = record.transition(Stage::Received) {
            record.complete(Err(error));
            return;
        }
        if response.is_success() {
            record.complete(Ok(response.into_store_response()));
        } else {
            let error = response.to_service_error(record.args().address());
            record.complete(Err(TransportError::Service(Box::new(error))));
        }
    }

    /// Fails every tracked record with `cause`.  Runs once per manager; later
    /// calls return 0.
    pub fn fail_all_pending(&self, cause: impl Fn() -> TransportError) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let records: Vec<_> = self
            .pending
            .iter()
            .map(|entry| entry.record.clone())
            .collect();
        for record in &records {
            record.fail(cause());
        }
        if !records.is_empty() {
            info!(
                "failed {} pending requests on channel to {}",
                records.len(),
                self.address
            );
        }
        records.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ── Context negotiation ─────────────────────────────────────────────

    pub fn mark_context_requested(&self) {
        self.context_requested.store(true, Ordering::Release);
    }

    pub fn is_context_requested(&self) -> bool {
        self.context_requested.load(Ordering::Acquire)
    }

    pub fn set_context(&self, context: Context) {
        debug!(
            "negotiated context with {}: server {} {}",
            self.address, context.server_agent, context.server_version
        );
        self.context.send_replace(Some(Arc::new(context)));
    }

    pub fn context(&self) -> Option<Arc<Context>> {
        self.context.borrow().clone()
    }

    pub fn has_context(&self) -> bool {
        self.context.borrow().is_some()
    }

    pub fn subscribe_context(&self) -> watch::Receiver<Option<Arc<Context>>> {
        self.context.subscribe()
    }

    /// Whether the channel can take another request.
    ///
    /// Before negotiation completes the cap is lowered to `demand`, so a
    /// fresh channel is not flooded before it is known to work.
    pub fn is_serviceable(&self, demand: usize) -> bool {
        if !self.is_context_requested() || self.is_closed() {
            return false;
        }
        let limit = if self.has_context() {
            self.max_requests
        } else {
            self.max_requests.min(demand)
        };
        self.pending_count() < limit
    }

    // ── Timestamps ──────────────────────────────────────────────────────

    fn stamp(&self, slot: &AtomicU64) {
        let nanos = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        slot.store(nanos, Ordering::Release);
    }

    fn instant(&self, slot: &AtomicU64) -> Instant {
        self.epoch
            .checked_add(Duration::from_nanos(slot.load(Ordering::Acquire)))
            .unwrap_or(self.epoch)
    }

    pub fn mark_read(&self) {
        self.stamp(&self.last_read);
    }

    pub fn mark_write_attempt(&self) {
        self.stamp(&self.last_write_attempt);
    }

    pub fn mark_write(&self) {
        self.stamp(&self.last_write);
    }

    pub fn mark_ping(&self) {
        self.stamp(&self.last_ping);
    }

    pub fn timestamps(&self) -> ChannelTimestamps {
        ChannelTimestamps {
            last_read: self.instant(&self.last_read),
            last_write_attempt: self.instant(&self.last_write_attempt),
            last_write: self.instant(&self.last_write),
            last_ping: self.instant(&self.last_ping),
        }
    }
}
