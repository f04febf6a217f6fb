//! Endpoints and the provider that owns them.
//!
//! An [`Endpoint`] serves one replica authority: it owns the channel pool,
//! the counters external telemetry polls, and the recorder hook.  The
//! [`EndpointProvider`] creates endpoints on first use, hands out transport
//! request ids, and evicts endpoints that have gone quiet.

use {
    crate::{
        address::PhysicalAddress,
        config::TransportConfig,
        connector::{Connector, TcpConnector},
        error::{Result, TransportError},
        message::{RequestArgs, ServiceRequest, HEALTH_CHECK_TRANSPORT_REQUEST_ID},
        metrics::{
            EndpointMetrics, NoopRecorder, RequestCompletion, RequestMetricsRecorder,
        },
        pool::{ChannelPool, PoolSnapshot},
        record::{PendingResponse, RequestRecord},
        timer::RequestTimer,
    },
    dashmap::DashMap,
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::{
        fmt,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc, Weak,
        },
        time::{Duration, Instant},
    },
    tokio::{sync::oneshot, task::JoinHandle},
    tokio_util::sync::CancellationToken,
};

/// Hands out transport request ids.  Wraps at `u32::MAX`, skipping the id
/// reserved for pings.
#[derive(Debug, Default)]
pub struct TransportRequestIdGenerator {
    last: AtomicU32,
}

impl TransportRequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u32 {
        loop {
            let id = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != HEALTH_CHECK_TRANSPORT_REQUEST_ID {
                return id;
            }
        }
    }
}

// ── Endpoint ────────────────────────────────────────────────────────────────

pub struct Endpoint {
    address: PhysicalAddress,
    request_timeout: Duration,
    pool: ChannelPool,
    metrics: Arc<EndpointMetrics>,
    recorder: Arc<dyn RequestMetricsRecorder>,
    last_request: Mutex<Instant>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address.as_str())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl Endpoint {
    pub fn new(
        address: &PhysicalAddress,
        config: &TransportConfig,
        connector: Arc<dyn Connector>,
        timer: RequestTimer,
        recorder: Arc<dyn RequestMetricsRecorder>,
    ) -> Arc<Self> {
        let address = address.endpoint();
        let metrics = Arc::new(EndpointMetrics::new());
        let pool = ChannelPool::new(
            address.clone(),
            config,
            connector,
            timer,
            metrics.clone(),
        );
        info!("created endpoint for {address}");
        Arc::new(Self {
            address,
            request_timeout: config.request_timeout,
            pool,
            metrics,
            recorder,
            last_request: Mutex::new(Instant::now()),
        })
    }

    pub fn address(&self) -> &PhysicalAddress {
        &self.address
    }

    pub fn metrics(&self) -> &Arc<EndpointMetrics> {
        &self.metrics
    }

    pub async fn pool_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot().await
    }

    /// Time since the last request was handed to this endpoint.
    pub fn idle_for(&self) -> Duration {
        self.last_request.lock().elapsed()
    }

    /// Idle for longer than `timeout` with nothing in flight.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.metrics.concurrent_requests.get() == 0 && self.idle_for() > timeout
    }

    /// Sends a request and returns the handle its outcome resolves on.
    ///
    /// The work runs on a spawned task: acquire a channel, write the record,
    /// release the channel.  Dropping the handle cancels the request.
    pub fn request(self: &Arc<Self>, args: RequestArgs) -> PendingResponse {
        *self.last_request.lock() = Instant::now();
        self.metrics.requests.inc();
        self.metrics.concurrent_requests.inc();

        let (record, pending) = RequestRecord::new(args, self.request_timeout);
        let metrics = self.metrics.clone();
        let recorder = self.recorder.clone();
        record.on_complete(move |record| {
            metrics.concurrent_requests.dec();
            let completion = completion(record);
            if completion.error.is_none() {
                metrics.completed.inc();
            } else {
                metrics.failed.inc();
            }
            recorder.record(&completion);
        });

        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.dispatch(record).await });
        pending
    }

    async fn dispatch(&self, record: Arc<RequestRecord>) {
        let (done, completed) = oneshot::channel::<()>();
        record.on_complete(move |_| {
            let _ = done.send(());
        });

        let acquired = tokio::select! {
            acquired = self.pool.acquire() => acquired,
            _ = completed => {
                debug!(
                    "request #{} completed while waiting for a channel to {}",
                    record.transport_request_id(),
                    self.address
                );
                return;
            }
        };
        let channel = match acquired {
            Ok(channel) => channel,
            Err(error) => {
                fail(&record, error);
                return;
            }
        };

        if let Err(error) = channel.write(record.clone()) {
            fail(&record, error);
        }
        if let Err(error) = self.pool.release(channel).await {
            warn!("failed to release channel to {}: {error}", self.address);
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("closed endpoint for {}", self.address);
    }
}

/// Internal-state errors surface as they are; anything else is reported as
/// the replica being unavailable for this request.
fn fail(record: &RequestRecord, error: TransportError) {
    if matches!(error, TransportError::InternalState(_)) {
        record.complete(Err(error));
    } else {
        record.fail(error);
    }
}

fn completion(record: &RequestRecord) -> RequestCompletion {
    let args = record.args();
    let outcome = record.outcome().unwrap_or_default();
    RequestCompletion {
        address: args.address().to_string(),
        activity_id: args.activity_id(),
        transport_request_id: args.transport_request_id(),
        operation_type: args.service_request().operation_type,
        resource_type: args.service_request().resource_type,
        status: outcome.status,
        error: outcome.error,
        request_bytes: record.request_bytes(),
        response_bytes: outcome.response_bytes,
        timeline: record.timeline(),
    }
}

// ── Provider ────────────────────────────────────────────────────────────────

/// Creates endpoints per replica authority and evicts idle ones.
pub struct EndpointProvider {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    recorder: Arc<dyn RequestMetricsRecorder>,
    timer: RequestTimer,
    ids: TransportRequestIdGenerator,
    endpoints: DashMap<String, Arc<Endpoint>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EndpointProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointProvider")
            .field("endpoints", &self.endpoints.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl EndpointProvider {
    /// A provider dialing plain TCP with no request recorder.
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let connector = Arc::new(TcpConnector::new(config.connect_timeout));
        Self::with_collaborators(
            config,
            connector,
            Arc::new(NoopRecorder),
            RequestTimer::current(),
        )
    }

    pub fn with_collaborators(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        recorder: Arc<dyn RequestMetricsRecorder>,
        timer: RequestTimer,
    ) -> Arc<Self> {
        let provider = Arc::new(Self {
            config,
            connector,
            recorder,
            timer,
            ids: TransportRequestIdGenerator::new(),
            endpoints: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        });
        if let Some(timeout) = provider.config.idle_endpoint_timeout {
            let monitor = tokio::spawn(monitor_idle_endpoints(
                Arc::downgrade(&provider),
                provider.shutdown.clone(),
                timeout,
            ));
            *provider.monitor.lock() = Some(monitor);
        }
        provider
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn next_transport_request_id(&self) -> u32 {
        self.ids.next()
    }

    /// The endpoint for `address`'s authority, created on first use.
    pub fn get(&self, address: &PhysicalAddress) -> Result<Arc<Endpoint>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::PoolClosed {
                address: address.to_string(),
            });
        }
        let endpoint = self
            .endpoints
            .entry(address.authority().to_string())
            .or_insert_with(|| {
                Endpoint::new(
                    address,
                    &self.config,
                    self.connector.clone(),
                    self.timer.clone(),
                    self.recorder.clone(),
                )
            })
            .clone();
        Ok(endpoint)
    }

    /// Sends `request` to the replica at `address`.
    pub fn request(
        &self,
        request: ServiceRequest,
        address: PhysicalAddress,
    ) -> Result<PendingResponse> {
        let endpoint = self.get(&address)?;
        let args = RequestArgs::new(request, address, self.next_transport_request_id());
        Ok(endpoint.request(args))
    }

    /// Removes and closes endpoints idle for longer than `timeout`.
    pub async fn evict_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<String> = self
            .endpoints
            .iter()
            .filter(|entry| entry.value().is_idle(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for authority in idle {
            if let Some((_, endpoint)) = self
                .endpoints
                .remove_if(&authority, |_, endpoint| endpoint.is_idle(timeout))
            {
                evicted.push(endpoint);
            }
        }
        for endpoint in &evicted {
            info!(
                "evicting endpoint {} idle for {:?}",
                endpoint.address(),
                endpoint.idle_for()
            );
            endpoint.close().await;
        }
        evicted.len()
    }

    /// Stops the idle monitor and closes every endpoint.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        let endpoints: Vec<_> = self
            .endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.endpoints.clear();
        futures::future::join_all(endpoints.iter().map(|endpoint| endpoint.close())).await;
        info!("closed {} endpoints", endpoints.len());
    }
}

impl Drop for EndpointProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn monitor_idle_endpoints(
    provider: Weak<EndpointProvider>,
    shutdown: CancellationToken,
    timeout: Duration,
) {
    let period = timeout
        .checked_div(2)
        .unwrap_or(timeout)
        .max(Duration::from_millis(10));
    let mut ticks = tokio::time::interval(period);
    ticks.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticks.tick() => {
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                let evicted = provider.evict_idle(timeout).await;
                if evicted > 0 {
                    debug!("evicted {evicted} idle endpoints");
                }
            }
        }
    }
}
