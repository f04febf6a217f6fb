//! Per-request lifecycle tracking.
//!
//! A [`RequestRecord`] follows one logical request through
//! `Queued → Pipelined → Sent → Received → Completed`.  Stages only move
//! forward; completion is first-writer-wins and every later attempt is a
//! no-op.  The caller holds the matching [`PendingResponse`], which resolves
//! with the completion value and cancels the record when dropped early.

use {
    crate::{
        error::{Result, TransportError},
        message::{RequestArgs, StoreResponse},
        report_issue,
    },
    log::debug,
    parking_lot::Mutex,
    std::{
        fmt,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        task::{Context, Poll},
        time::{Duration, SystemTime},
    },
    tokio::sync::oneshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Handed to an endpoint, waiting for a channel.
    Queued,
    /// Handed to a channel, waiting for the socket write.
    Pipelined,
    /// Flushed to the socket.
    Sent,
    /// A matching response frame arrived.
    Received,
    Completed,
}

impl Stage {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

/// One named interval of a request's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEvent {
    pub name: &'static str,
    pub start: Option<SystemTime>,
    pub end: Option<SystemTime>,
}

impl TimelineEvent {
    pub fn duration(&self) -> Option<Duration> {
        self.end?.duration_since(self.start?).ok()
    }
}

/// The six intervals `created, queued, pipelined, sent, received, completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTimeline {
    events: Vec<TimelineEvent>,
}

impl RequestTimeline {
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn get(&self, name: &str) -> Option<&TimelineEvent> {
        self.events.iter().find(|event| event.name == name)
    }
}

/// Summary of how a record completed, kept for late hooks and metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub status: Option<u16>,
    pub error: Option<String>,
    pub response_bytes: usize,
}

impl RecordOutcome {
    fn of(result: &Result<StoreResponse>) -> Self {
        match result {
            Ok(response) => Self {
                status: Some(response.status),
                error: None,
                response_bytes: response.content.as_ref().map_or(0, |c| c.len()),
            },
            Err(error) => Self {
                status: error.service_error().map(|e| e.status),
                error: Some(error.to_string()),
                response_bytes: 0,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

type CompletionHook = Box<dyn FnOnce(&RequestRecord) + Send>;

struct RecordState {
    stage: Stage,
    stamps: [Option<SystemTime>; Stage::COUNT],
    sender: Option<oneshot::Sender<Result<StoreResponse>>>,
    hooks: Vec<CompletionHook>,
    outcome: Option<RecordOutcome>,
}

/// Shared state of one in-flight request.
pub struct RequestRecord {
    args: RequestArgs,
    timeout: Duration,
    request_bytes: AtomicUsize,
    state: Mutex<RecordState>,
}

impl fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRecord")
            .field("activity_id", &self.args.activity_id())
            .field("transport_request_id", &self.args.transport_request_id())
            .field("address", &self.args.address().as_str())
            .field("stage", &self.stage())
            .finish()
    }
}

impl RequestRecord {
    /// Creates a queued record and the handle its result is delivered to.
    pub fn new(args: RequestArgs, timeout: Duration) -> (Arc<Self>, PendingResponse) {
        let (sender, receiver) = oneshot::channel();
        let mut stamps = [None; Stage::COUNT];
        stamps[Stage::Queued.index()] = Some(SystemTime::now());
        let record = Arc::new(Self {
            args,
            timeout,
            request_bytes: AtomicUsize::new(0),
            state: Mutex::new(RecordState {
                stage: Stage::Queued,
                stamps,
                sender: Some(sender),
                hooks: Vec::new(),
                outcome: None,
            }),
        });
        let pending = PendingResponse {
            record: record.clone(),
            receiver,
        };
        (record, pending)
    }

    pub fn args(&self) -> &RequestArgs {
        &self.args
    }

    pub fn transport_request_id(&self) -> u32 {
        self.args.transport_request_id()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stage(&self) -> Stage {
        self.state.lock().stage
    }

    pub fn is_completed(&self) -> bool {
        self.stage() == Stage::Completed
    }

    pub fn outcome(&self) -> Option<RecordOutcome> {
        self.state.lock().outcome.clone()
    }

    pub fn request_bytes(&self) -> usize {
        self.request_bytes.load(Ordering::Relaxed)
    }

    pub fn set_request_bytes(&self, bytes: usize) {
        self.request_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Moves the record forward to `next`.
    ///
    /// Returns `Ok(false)` when the record already completed, or when a
    /// write acknowledgement trails the response it provoked.  A response
    /// that overtakes its write acknowledgement stamps `Sent` on the way.
    /// Any other move is an internal error.
    pub fn transition(&self, next: Stage) -> Result<bool> {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        match (state.stage, next) {
            (Stage::Completed, _) | (Stage::Received, Stage::Sent) => Ok(false),
            (Stage::Queued, Stage::Pipelined)
            | (Stage::Pipelined, Stage::Sent)
            | (Stage::Sent, Stage::Received) => {
                state.stage = next;
                state.stamps[next.index()] = Some(now);
                Ok(true)
            }
            (Stage::Pipelined, Stage::Received) => {
                state.stage = next;
                state.stamps[Stage::Sent.index()] = Some(now);
                state.stamps[next.index()] = Some(now);
                Ok(true)
            }
            (current, next) => Err(report_issue!(
                "illegal stage transition {current:?} -> {next:?} for request #{}",
                self.args.transport_request_id()
            )),
        }
    }

    /// Completes the record.  Returns `false` when it was already complete.
    pub fn complete(&self, result: Result<StoreResponse>) -> bool {
        let (sender, hooks) = {
            let mut state = self.state.lock();
            if state.stage == Stage::Completed {
                return false;
            }
            state.stage = Stage::Completed;
            state.stamps[Stage::Completed.index()] = Some(SystemTime::now());
            state.outcome = Some(RecordOutcome::of(&result));
            (state.sender.take(), std::mem::take(&mut state.hooks))
        };

        for hook in hooks {
            hook(self);
        }
        if let Some(sender) = sender {
            if sender.send(result).is_err() {
                debug!(
                    "request #{} completed after its caller went away",
                    self.args.transport_request_id()
                );
            }
        }
        true
    }

    /// Completes with [`TransportError::RequestTimeout`].
    pub fn expire(&self) -> bool {
        let completed = self.complete(Err(TransportError::RequestTimeout {
            diagnostics: self.args.diagnostics(),
            timeout: self.timeout,
        }));
        if completed {
            debug!(
                "request #{} to {} expired after {:?}",
                self.args.transport_request_id(),
                self.args.address(),
                self.timeout
            );
        }
        completed
    }

    /// Completes with [`TransportError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.complete(Err(TransportError::Cancelled {
            diagnostics: self.args.diagnostics(),
        }))
    }

    /// Completes with [`TransportError::Unavailable`] wrapping `cause`.
    pub fn fail(&self, cause: TransportError) -> bool {
        self.complete(Err(TransportError::Unavailable {
            diagnostics: self.args.diagnostics(),
            cause: Box::new(cause),
        }))
    }

    /// Runs `hook` once the record completes, or right away if it already has.
    pub fn on_complete(&self, hook: impl FnOnce(&RequestRecord) + Send + 'static) {
        {
            let mut state = self.state.lock();
            if state.stage != Stage::Completed {
                state.hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self);
    }

    /// Snapshot of the six lifecycle intervals.  An interval that has started
    /// but not ended is closed at "now".
    pub fn timeline(&self) -> RequestTimeline {
        let now = SystemTime::now();
        let stamps = self.state.lock().stamps;
        let mut points = Vec::with_capacity(6);
        points.push(Some(self.args.created()));
        points.extend(stamps);

        let names = ["created", "queued", "pipelined", "sent", "received", "completed"];
        let events = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let start = points[i];
                let end = if *name == "completed" {
                    start
                } else {
                    start.map(|_| {
                        points
                            .iter()
                            .skip(i.saturating_add(1))
                            .flatten()
                            .next()
                            .copied()
                            .unwrap_or(now)
                    })
                };
                TimelineEvent {
                    name: *name,
                    start,
                    end,
                }
            })
            .collect();
        RequestTimeline { events }
    }
}

/// Resolves with the outcome of a [`RequestRecord`].
///
/// Dropping it before resolution cancels the request.
#[derive(Debug)]
pub struct PendingResponse {
    record: Arc<RequestRecord>,
    receiver: oneshot::Receiver<Result<StoreResponse>>,
}

impl PendingResponse {
    pub fn record(&self) -> &Arc<RequestRecord> {
        &self.record
    }

    pub fn cancel(&self) -> bool {
        self.record.cancel()
    }
}

impl Future for PendingResponse {
    type Output = Result<StoreResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(report_issue!(
                "request #{} dropped its completion",
                self.record.transport_request_id()
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.record.is_completed() {
            self.record.cancel();
        }
    }
}
