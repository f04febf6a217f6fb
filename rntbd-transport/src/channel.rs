//! One multiplexed connection to a replica.
//!
//! A channel owns two tasks.  The writer sends the context request first,
//! holds back requests and pings until the replica answers it, then writes records
//! in the order they were handed over.  The reader decodes the context and
//! then response frames, routing each to the channel's [`RequestManager`].
//! Any read or write failure closes the channel and fails every request
//! still pending on it.

use {
    crate::{
        address::PhysicalAddress,
        config::TransportConfig,
        connector::BoxedStream,
        error::{Result, TransportError},
        frame::Framer,
        manager::{ChannelTimestamps, RequestManager},
        message::{Context, ContextRequest, Request, Response},
        metrics::EndpointMetrics,
        pool::PoolIdentity,
        record::{RequestRecord, Stage},
        timer::RequestTimer,
    },
    bytes::BytesMut,
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        fmt,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Weak,
        },
    },
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
};

enum WriteCommand {
    Request(Arc<RequestRecord>),
    Ping(oneshot::Sender<Result<()>>),
}

/// State shared between the channel handle and its two tasks.
struct Shared {
    id: u64,
    address: PhysicalAddress,
    manager: Arc<RequestManager>,
    metrics: Arc<EndpointMetrics>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    fn closed_error(&self, reason: &str) -> TransportError {
        TransportError::ChannelClosed {
            address: self.address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns `false` when the channel was already closed.
    fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("closing channel {} to {}: {}", self.id, self.address, reason);
        self.shutdown.cancel();
        self.manager.fail_all_pending(|| self.closed_error(reason));
        self.metrics.channels_closed.inc();
        true
    }
}

pub struct Channel {
    shared: Arc<Shared>,
    pool: Weak<PoolIdentity>,
    commands: mpsc::UnboundedSender<WriteCommand>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address.as_str())
            .field("active", &self.is_active())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl Channel {
    /// Starts a channel over an established stream and begins context
    /// negotiation.
    pub fn open(
        id: u64,
        stream: BoxedStream,
        pool: &Arc<PoolIdentity>,
        config: &TransportConfig,
        timer: RequestTimer,
        metrics: Arc<EndpointMetrics>,
    ) -> Arc<Self> {
        let address = pool.address().clone();
        let manager = RequestManager::new(address.clone(), config, timer);
        let shared = Arc::new(Shared {
            id,
            address,
            manager,
            metrics,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        shared.metrics.channels_opened.inc();

        let (reader, writer) = tokio::io::split(stream);
        let (commands, receiver) = mpsc::unbounded_channel();
        let context_request =
            ContextRequest::new(config.client_version.as_str(), config.user_agent.as_str());
        shared.manager.mark_context_requested();

        let writer_task = tokio::spawn(run_writer(
            shared.clone(),
            writer,
            receiver,
            context_request,
        ));
        let reader_task = tokio::spawn(run_reader(
            shared.clone(),
            reader,
            Framer::new(config.max_frame_length),
            config.read_buffer_capacity,
        ));
        debug!("opened channel {} to {}", id, shared.address);

        Arc::new(Self {
            shared,
            pool: Arc::downgrade(pool),
            commands,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn address(&self) -> &PhysicalAddress {
        &self.shared.address
    }

    pub fn manager(&self) -> &Arc<RequestManager> {
        &self.shared.manager
    }

    pub fn timestamps(&self) -> ChannelTimestamps {
        self.shared.manager.timestamps()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.manager.pending_count()
    }

    pub fn is_active(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether the channel is open and can take `demand` more requests.
    pub fn is_serviceable(&self, demand: usize) -> bool {
        self.is_active() && self.shared.manager.is_serviceable(demand)
    }

    /// Whether this channel was dialed by `pool`.
    pub fn belongs_to(&self, pool: &Arc<PoolIdentity>) -> bool {
        std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(pool))
    }

    /// Hands `record` to the writer.  The record is tracked, and its
    /// expiration armed, before it is queued for the socket.
    pub fn write(&self, record: Arc<RequestRecord>) -> Result<()> {
        if !self.is_active() {
            return Err(self.shared.closed_error("channel is closed"));
        }
        if !record.transition(Stage::Pipelined)? {
            // Completed while waiting for a channel.
            return Ok(());
        }
        self.shared.manager.add(record.clone())?;
        if let Err(mpsc::error::SendError(WriteCommand::Request(record))) =
            self.commands.send(WriteCommand::Request(record))
        {
            record.fail(self.shared.closed_error("writer stopped"));
        }
        Ok(())
    }

    /// Writes a health-check request.  Succeeds once the socket accepted
    /// it; held like any request until the context is negotiated.
    pub async fn ping(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(WriteCommand::Ping(reply))
            .map_err(|_| self.shared.closed_error("writer stopped"))?;
        response
            .await
            .map_err(|_| self.shared.closed_error("writer stopped"))?
    }

    /// Closes the channel and fails its pending requests.  Idempotent.
    pub fn close(&self, reason: &str) {
        self.shared.close(reason);
    }

    /// Closes the channel and waits for both tasks to exit.
    pub async fn close_and_wait(&self, reason: &str) {
        self.close(reason);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                debug!("channel {} task ended abnormally: {error}", self.shared.id);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.close("channel dropped");
    }
}

// ── Writer ──────────────────────────────────────────────────────────────────

async fn run_writer<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    context_request: ContextRequest,
) {
    match write_loop(&shared, &mut writer, &mut commands, context_request).await {
        Ok(()) => shared.close("writer stopped"),
        Err(error) => shared.close(&format!("write failed: {error}")),
    };

    commands.close();
    while let Ok(command) = commands.try_recv() {
        match command {
            WriteCommand::Request(record) => {
                record.fail(shared.closed_error("channel is closed"));
            }
            WriteCommand::Ping(reply) => {
                let _ = reply.send(Err(shared.closed_error("channel is closed")));
            }
        }
    }
    if let Err(error) = writer.shutdown().await {
        trace!("channel {} shutdown: {error}", shared.id);
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    shared: &Shared,
    writer: &mut W,
    commands: &mut mpsc::UnboundedReceiver<WriteCommand>,
    context_request: ContextRequest,
) -> Result<()> {
    let mut out = BytesMut::new();
    context_request.encode(&mut out)?;
    shared.manager.mark_write_attempt();
    writer.write_all(&out).await?;
    writer.flush().await?;
    shared.manager.mark_write();
    debug!(
        "sent context request {} on channel {} to {}",
        context_request.activity_id, shared.id, shared.address
    );

    let mut context = shared.manager.subscribe_context();
    let mut negotiated = context.borrow().is_some();
    let mut held = VecDeque::new();

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return Ok(()),

            changed = context.changed(), if !negotiated => {
                if changed.is_err() {
                    return Ok(());
                }
                if context.borrow_and_update().is_some() {
                    negotiated = true;
                    trace!(
                        "channel {} negotiated, flushing {} held commands",
                        shared.id,
                        held.len()
                    );
                    while let Some(command) = held.pop_front() {
                        write_command(shared, writer, command, &mut out).await?;
                    }
                }
            }

            command = commands.recv() => {
                let Some(command) = command else {
                    return Ok(());
                };
                if negotiated {
                    write_command(shared, writer, command, &mut out).await?;
                } else {
                    held.push_back(command);
                }
            }
        }
    }
}

async fn write_command<W: AsyncWrite + Unpin>(
    shared: &Shared,
    writer: &mut W,
    command: WriteCommand,
    out: &mut BytesMut,
) -> Result<()> {
    match command {
        WriteCommand::Request(record) => write_record(shared, writer, &record, out).await,
        WriteCommand::Ping(reply) => match write_ping(shared, writer, out).await {
            Ok(()) => {
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Err(error) => {
                let _ = reply.send(Err(shared.closed_error(&error.to_string())));
                Err(error)
            }
        },
    }
}

/// Writes a health-check request.  Any reply is dropped unmatched.
async fn write_ping<W: AsyncWrite + Unpin>(
    shared: &Shared,
    writer: &mut W,
    out: &mut BytesMut,
) -> Result<()> {
    out.clear();
    Request::health_check(&shared.address)?.encode(out)?;

    shared.manager.mark_write_attempt();
    writer.write_all(out).await?;
    writer.flush().await?;
    shared.manager.mark_write();
    shared.manager.mark_ping();
    shared.metrics.bytes_written.add(out.len() as u64);
    trace!("pinged channel {} to {}", shared.id, shared.address);
    Ok(())
}

/// Encodes and flushes one record.  Encoding failures complete the record
/// and leave the channel open; socket failures are returned.
async fn write_record<W: AsyncWrite + Unpin>(
    shared: &Shared,
    writer: &mut W,
    record: &RequestRecord,
    out: &mut BytesMut,
) -> Result<()> {
    if record.is_completed() {
        return Ok(());
    }
    out.clear();
    if let Err(error) = Request::from_args(record.args()).and_then(|request| request.encode(out)) {
        warn!(
            "failed to encode request #{} for {}: {error}",
            record.transport_request_id(),
            shared.address
        );
        record.complete(Err(error));
        return Ok(());
    }
    record.set_request_bytes(out.len());

    shared.manager.mark_write_attempt();
    writer.write_all(out).await?;
    writer.flush().await?;
    shared.manager.mark_write();
    shared.metrics.bytes_written.add(out.len() as u64);

    if let Err(error) = record.transition(Stage::Sent) {
        record.complete(Err(error));
    }
    Ok(())
}

// ── Reader ──────────────────────────────────────────────────────────────────

async fn run_reader<R: AsyncRead + Unpin>(
    shared: Arc<Shared>,
    mut reader: R,
    framer: Framer,
    read_chunk: usize,
) {
    let mut buffer = BytesMut::with_capacity(read_chunk);
    let reason = loop {
        buffer.reserve(read_chunk);
        tokio::select! {
            _ = shared.shutdown.cancelled() => break None,
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => break Some("connection closed by replica".to_string()),
                Ok(n) => {
                    shared.manager.mark_read();
                    shared.metrics.bytes_read.add(n as u64);
                    if let Err(error) = decode_frames(&shared, &mut buffer, &framer) {
                        warn!("channel {} to {}: {error}", shared.id, shared.address);
                        break Some(error.to_string());
                    }
                }
                Err(error) => break Some(format!("read failed: {error}")),
            },
        }
    };
    if let Some(reason) = reason {
        shared.close(&reason);
    }
}

fn decode_frames(shared: &Shared, buffer: &mut BytesMut, framer: &Framer) -> Result<()> {
    loop {
        if shared.manager.has_context() {
            let Some(response) = Response::decode(buffer, framer)? else {
                return Ok(());
            };
            shared.manager.on_response(response);
        } else {
            let Some(context) = Context::decode(buffer, framer, &shared.address)? else {
                return Ok(());
            };
            shared.manager.set_context(context);
        }
    }
}
