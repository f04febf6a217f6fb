//! Bounded channel pool for one endpoint.
//!
//! All pool state lives in a single worker task.  [`ChannelPool`] is a thin
//! handle that sends commands into the worker's queue, so the available,
//! acquired and pending collections are only ever touched by one task.
//! Health checks that need a ping and dials run as separate tasks and
//! report back to the worker through an internal event queue.
//!
//! | Operation | Behaviour                                                     |
//! |-----------|---------------------------------------------------------------|
//! | acquire   | freshest serviceable channel, else dial, else queue (FIFO)    |
//! | release   | validate origin, optionally check health, serve queued waiters |
//! | close     | fail queued waiters, close every channel and wait             |

use {
    crate::{
        address::PhysicalAddress,
        channel::Channel,
        config::{AcquisitionTimeoutAction, TransportConfig},
        connector::Connector,
        error::{Result, TransportError},
        health::{HealthChecker, Verdict},
        metrics::EndpointMetrics,
        report_issue,
        timer::RequestTimer,
    },
    futures::future::join_all,
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    std::{
        collections::{HashMap, VecDeque},
        fmt,
        sync::Arc,
    },
    tokio::{
        sync::{mpsc, oneshot},
        task::JoinHandle,
        time::{self, Instant, MissedTickBehavior},
    },
};

/// Identity of a pool.  Channels keep a weak reference to the identity of
/// the pool that dialed them so a release to the wrong pool is detectable.
#[derive(Debug)]
pub struct PoolIdentity {
    address: PhysicalAddress,
}

impl PoolIdentity {
    pub fn new(address: PhysicalAddress) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &PhysicalAddress {
        &self.address
    }
}

/// Diagnostic view of a pool.  Stale as soon as it is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub available: usize,
    pub acquired: usize,
    pub pending: usize,
    pub connecting: bool,
    pub checking: usize,
    pub closed: bool,
}

type AcquireReply = oneshot::Sender<Result<Arc<Channel>>>;

enum Command {
    Acquire(AcquireReply),
    Release {
        channel: Arc<Channel>,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot(oneshot::Sender<PoolSnapshot>),
    Close(oneshot::Sender<()>),
}

enum CheckPurpose {
    Acquire(Waiter),
    Release,
}

enum Event {
    Checked {
        channel: Arc<Channel>,
        healthy: bool,
        purpose: CheckPurpose,
    },
    Dialed {
        result: Result<Arc<Channel>>,
        waiter: Waiter,
    },
}

struct Waiter {
    reply: AcquireReply,
    deadline: Instant,
}

pub struct ChannelPool {
    identity: Arc<PoolIdentity>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPool")
            .field("address", &self.identity.address.as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelPool {
    pub fn new(
        address: PhysicalAddress,
        config: &TransportConfig,
        connector: Arc<dyn Connector>,
        timer: RequestTimer,
        metrics: Arc<EndpointMetrics>,
    ) -> Self {
        let identity = Arc::new(PoolIdentity::new(address.endpoint()));
        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, event_receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            identity: identity.clone(),
            config: config.clone(),
            checker: HealthChecker::new(config),
            connector,
            timer,
            metrics,
            events,
            available: VecDeque::new(),
            acquired: HashMap::new(),
            pending: VecDeque::new(),
            connecting: false,
            checking: 0,
            closed: false,
            next_channel_id: 0,
        };
        let handle = tokio::spawn(worker.run(receiver, event_receiver));
        Self {
            identity,
            commands,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn address(&self) -> &PhysicalAddress {
        &self.identity.address
    }

    pub fn identity(&self) -> &Arc<PoolIdentity> {
        &self.identity
    }

    fn closed_error(&self) -> TransportError {
        TransportError::PoolClosed {
            address: self.identity.address.to_string(),
        }
    }

    pub async fn acquire(&self) -> Result<Arc<Channel>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Acquire(reply))
            .map_err(|_| self.closed_error())?;
        response.await.map_err(|_| self.closed_error())?
    }

    /// Returns `channel` to the pool.  Fails, and closes the channel, when it
    /// was not acquired from this pool.
    pub async fn release(&self, channel: Arc<Channel>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if let Err(mpsc::error::SendError(Command::Release { channel, .. })) =
            self.commands.send(Command::Release { channel, reply })
        {
            channel.close("released after pool close");
            return Ok(());
        }
        response.await.unwrap_or(Ok(()))
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let closed = PoolSnapshot {
            closed: true,
            ..PoolSnapshot::default()
        };
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Snapshot(reply)).is_err() {
            return closed;
        }
        response.await.unwrap_or(closed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Fails queued acquisitions, closes every channel and waits for the
    /// worker to finish.
    pub async fn close(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Close(reply)).is_ok() {
            let _ = response.await;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                warn!("pool worker for {} failed: {error}", self.identity.address);
            }
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

struct Worker {
    identity: Arc<PoolIdentity>,
    config: TransportConfig,
    checker: HealthChecker,
    connector: Arc<dyn Connector>,
    timer: RequestTimer,
    metrics: Arc<EndpointMetrics>,
    events: mpsc::UnboundedSender<Event>,
    /// Most recently released at the back.
    available: VecDeque<Arc<Channel>>,
    acquired: HashMap<u64, Arc<Channel>>,
    pending: VecDeque<Waiter>,
    connecting: bool,
    /// Channels out for a ping; they count against the channel limit.
    checking: usize,
    closed: bool,
    next_channel_id: u64,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut sweep = time::interval(self.config.acquisition_sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.close().await;
                        break;
                    };
                    if let Some(reply) = self.handle_command(command) {
                        self.close().await;
                        let _ = reply.send(());
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                _ = sweep.tick() => self.sweep(),
            }
            self.drain_pending();
            self.publish_gauges();
        }
        self.publish_gauges();
    }

    /// Returns the reply of a close request; closing is left to `run`.
    fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Acquire(reply) => {
                let waiter = Waiter {
                    reply,
                    deadline: self.deadline(),
                };
                self.acquire(waiter);
            }
            Command::Release { channel, reply } => {
                let _ = reply.send(self.release(channel));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Close(reply) => return Some(reply),
        }
        None
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Checked {
                channel,
                healthy,
                purpose,
            } => {
                self.checking = self.checking.saturating_sub(1);
                if self.closed {
                    channel.close("pool closed");
                    return;
                }
                if !healthy {
                    channel.close("failed health check");
                    // Already admitted; keeps its place ahead of later arrivals.
                    if let CheckPurpose::Acquire(waiter) = purpose {
                        if let Err(waiter) = self.try_acquire(waiter) {
                            self.pending.push_front(waiter);
                        }
                    }
                    return;
                }
                match purpose {
                    CheckPurpose::Acquire(waiter) => self.hand_over(channel, waiter),
                    CheckPurpose::Release => self.offer(channel),
                }
            }
            Event::Dialed { result, waiter } => {
                self.connecting = false;
                match result {
                    Ok(channel) if self.closed => channel.close("pool closed"),
                    Ok(channel) => self.hand_over(channel, waiter),
                    Err(error) => {
                        warn!("failed to open channel to {}: {error}", self.identity.address);
                        let _ = waiter.reply.send(Err(error));
                    }
                }
            }
        }
    }

    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.acquisition_timeout)
            .unwrap_or(now)
    }

    fn total_channels(&self) -> usize {
        self.available
            .len()
            .saturating_add(self.acquired.len())
            .saturating_add(self.checking)
            .saturating_add(usize::from(self.connecting))
    }

    fn closed_error(&self) -> TransportError {
        TransportError::PoolClosed {
            address: self.identity.address.to_string(),
        }
    }

    // ── Acquire ─────────────────────────────────────────────────────────

    fn acquire(&mut self, waiter: Waiter) {
        if let Err(waiter) = self.try_acquire(waiter) {
            self.enqueue(waiter);
        }
    }

    /// Serves `waiter` now or hands it back for queueing.
    fn try_acquire(&mut self, waiter: Waiter) -> std::result::Result<(), Waiter> {
        if self.closed {
            let _ = waiter.reply.send(Err(self.closed_error()));
            return Ok(());
        }
        if waiter.reply.is_closed() {
            return Ok(());
        }

        while let Some(channel) = self.poll_available() {
            match self.verdict(&channel) {
                Verdict::Healthy => {
                    self.hand_over(channel, waiter);
                    return Ok(());
                }
                Verdict::Unhealthy(reason) => {
                    warn!(
                        "closing channel {} to {}: {reason}",
                        channel.id(),
                        self.identity.address
                    );
                    channel.close(&reason.to_string());
                }
                Verdict::NeedsPing => {
                    self.spawn_check(channel, CheckPurpose::Acquire(waiter));
                    return Ok(());
                }
            }
        }

        self.available.retain(|channel| channel.is_active());
        if !self.connecting && self.total_channels() < self.config.max_channels_per_endpoint {
            self.spawn_dial(waiter);
            return Ok(());
        }
        Err(waiter)
    }

    /// Pops the most recently released serviceable channel.  Skipped
    /// channels go back in their original order; closed ones are dropped.
    fn poll_available(&mut self) -> Option<Arc<Channel>> {
        let demand = self.pending.len().saturating_add(1);
        let first = self.available.pop_back()?;
        if first.is_serviceable(demand) {
            return Some(first);
        }

        let mut skipped = vec![first];
        let mut found = None;
        for _ in 0..self.available.len() {
            let Some(channel) = self.available.pop_back() else {
                break;
            };
            if channel.is_serviceable(demand) {
                found = Some(channel);
                break;
            }
            skipped.push(channel);
        }
        for channel in skipped.into_iter().rev() {
            if channel.is_active() {
                self.available.push_back(channel);
            } else {
                trace!("dropping closed channel {} from the pool", channel.id());
            }
        }
        found
    }

    fn verdict(&self, channel: &Channel) -> Verdict {
        if !channel.is_active() {
            return Verdict::Unhealthy(crate::health::UnhealthyReason::Closed);
        }
        self.checker
            .evaluate(&channel.timestamps(), std::time::Instant::now())
    }

    fn enqueue(&mut self, waiter: Waiter) {
        if self.pending.len() >= self.config.max_pending_acquisitions {
            let _ = waiter.reply.send(Err(TransportError::TooManyPendingAcquisitions {
                address: self.identity.address.to_string(),
                limit: self.config.max_pending_acquisitions,
            }));
            return;
        }
        trace!(
            "queueing acquisition for {} behind {} others",
            self.identity.address,
            self.pending.len()
        );
        self.pending.push_back(waiter);
    }

    fn hand_over(&mut self, channel: Arc<Channel>, waiter: Waiter) {
        self.acquired.insert(channel.id(), channel.clone());
        if let Err(Ok(channel)) = waiter.reply.send(Ok(channel)) {
            // The acquirer went away.
            self.acquired.remove(&channel.id());
            self.available.push_back(channel);
        }
    }

    fn spawn_check(&mut self, channel: Arc<Channel>, purpose: CheckPurpose) {
        self.checking = self.checking.saturating_add(1);
        let checker = self.checker.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let healthy = checker.is_healthy(&channel).await;
            let _ = events.send(Event::Checked {
                channel,
                healthy,
                purpose,
            });
        });
    }

    fn spawn_dial(&mut self, waiter: Waiter) {
        self.connecting = true;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        let id = self.next_channel_id;
        let identity = self.identity.clone();
        let connector = self.connector.clone();
        let config = self.config.clone();
        let timer = self.timer.clone();
        let metrics = self.metrics.clone();
        let events = self.events.clone();
        debug!("dialing channel {id} to {}", identity.address);
        tokio::spawn(async move {
            let result = connector
                .connect(&identity.address)
                .await
                .map(|stream| Channel::open(id, stream, &identity, &config, timer, metrics));
            let _ = events.send(Event::Dialed { result, waiter });
        });
    }

    // ── Release ─────────────────────────────────────────────────────────

    fn release(&mut self, channel: Arc<Channel>) -> Result<()> {
        if !channel.belongs_to(&self.identity) || self.acquired.remove(&channel.id()).is_none() {
            channel.close("released to a pool that did not issue it");
            return Err(report_issue!(
                "channel {} to {} released to pool for {} which did not issue it",
                channel.id(),
                channel.address(),
                self.identity.address
            ));
        }
        if self.closed {
            channel.close("pool closed");
            return Ok(());
        }
        if !self.config.health_check_on_release {
            self.offer(channel);
            return Ok(());
        }
        match self.verdict(&channel) {
            Verdict::Healthy => self.offer(channel),
            Verdict::Unhealthy(reason) => {
                warn!(
                    "closing released channel {} to {}: {reason}",
                    channel.id(),
                    self.identity.address
                );
                channel.close(&reason.to_string());
            }
            Verdict::NeedsPing => self.spawn_check(channel, CheckPurpose::Release),
        }
        Ok(())
    }

    fn offer(&mut self, channel: Arc<Channel>) {
        if channel.is_active() {
            self.available.push_back(channel);
        }
    }

    /// Serves queued waiters in arrival order until one cannot be served.
    fn drain_pending(&mut self) {
        for _ in 0..self.config.max_channels_per_endpoint {
            let Some(waiter) = self.pending.pop_front() else {
                break;
            };
            if let Err(waiter) = self.try_acquire(waiter) {
                self.pending.push_front(waiter);
                break;
            }
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        self.pending.retain(|waiter| !waiter.reply.is_closed());
        if !self.pending.iter().any(|waiter| waiter.deadline <= now) {
            return;
        }

        let (expired, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|waiter| waiter.deadline <= now);
        self.pending = waiting;
        debug!(
            "{} acquisitions for {} timed out after {:?}",
            expired.len(),
            self.identity.address,
            self.config.acquisition_timeout
        );

        for mut waiter in expired {
            match self.config.acquisition_timeout_action {
                AcquisitionTimeoutAction::Reissue => {
                    waiter.deadline = self.deadline();
                    self.acquire(waiter);
                }
                AcquisitionTimeoutAction::Fail => {
                    let _ = waiter.reply.send(Err(TransportError::AcquisitionTimeout {
                        address: self.identity.address.to_string(),
                        timeout: self.config.acquisition_timeout,
                    }));
                }
            }
        }
    }

    // ── Close ───────────────────────────────────────────────────────────

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let pending = std::mem::take(&mut self.pending);
        let failed = pending.len();
        for waiter in pending {
            let _ = waiter.reply.send(Err(self.closed_error()));
        }

        self.available
            .extend(self.acquired.drain().map(|(_, channel)| channel));
        let channels: Vec<_> = self.available.drain(..).collect();
        join_all(
            channels
                .iter()
                .map(|channel| channel.close_and_wait("pool closed")),
        )
        .await;
        info!(
            "closed pool for {}: {} channels closed, {} acquisitions failed",
            self.identity.address,
            channels.len(),
            failed
        );
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            available: self.available.len(),
            acquired: self.acquired.len(),
            pending: self.pending.len(),
            connecting: self.connecting,
            checking: self.checking,
            closed: self.closed,
        }
    }

    fn publish_gauges(&self) {
        let gauge = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        self.metrics.available_channels.set(gauge(self.available.len()));
        self.metrics.acquired_channels.set(gauge(self.acquired.len()));
        self.metrics.pending_acquisitions.set(gauge(self.pending.len()));
    }
}
