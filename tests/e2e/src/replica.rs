//! A scripted replica listening on loopback.
//!
//! Every accepted connection is served by its own task: the context request
//! is answered first (or rejected, if so configured), then each request is
//! handed to the script and answered on a separate task, so a delayed reply
//! never holds up the others on the same connection.

use {
    bytes::{Bytes, BytesMut},
    log::{debug, info},
    rntbd_transport::{
        frame::Framer,
        headers::ResponseHeader,
        message::{Context, ContextRequest, Request, Response, CURRENT_PROTOCOL_VERSION},
        token::TokenStream,
        PhysicalAddress,
    },
    serde_json::json,
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{tcp::OwnedReadHalf, TcpListener, TcpStream},
        sync::mpsc,
        task::{JoinHandle, JoinSet},
    },
    uuid::Uuid,
};

/// Path appended to the replica's authority in [`FakeReplica::address`].
pub const REPLICA_PATH: &str = "/apps/app/services/svc/partitions/p0/replicas/r1p/";

/// Session token every successful reply carries.
pub const SESSION_TOKEN: &str = "0:1#42";

/// Partition key range id every error reply carries.
pub const PARTITION_KEY_RANGE_ID: &str = "7";

/// How the replica answers one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `200` with the request payload echoed back.
    Echo,
    /// The given status and optional sub-status, with a JSON error body.
    Status { status: u16, sub_status: Option<u32> },
    /// `reply`, after waiting `delay`.
    Delayed { delay: Duration, reply: Box<Reply> },
    /// No reply at all.
    Silence,
}

type Script = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

#[derive(Debug, Default)]
pub struct ReplicaStats {
    pub connections: AtomicUsize,
    pub context_requests: AtomicUsize,
    pub requests: AtomicUsize,
    pub pings: AtomicUsize,
}

pub struct FakeReplica {
    address: PhysicalAddress,
    stats: Arc<ReplicaStats>,
    task: JoinHandle<()>,
}

impl FakeReplica {
    /// A replica answering every request with [`Reply::Echo`].
    pub async fn echo() -> Self {
        Self::start(|_| Reply::Echo).await
    }

    pub async fn start(script: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        Self::spawn(Arc::new(script), None).await
    }

    /// A replica that rejects context negotiation with `status`.
    pub async fn rejecting(status: u16) -> Self {
        Self::spawn(Arc::new(|_| Reply::Silence), Some(status)).await
    }

    async fn spawn(script: Script, reject_context: Option<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address =
            PhysicalAddress::parse(&format!("rntbd://127.0.0.1:{port}{REPLICA_PATH}")).unwrap();
        let stats = Arc::new(ReplicaStats::default());
        info!("fake replica listening on {address}");

        let task = tokio::spawn({
            let stats = stats.clone();
            async move {
                let mut connections = JoinSet::new();
                while let Ok((stream, peer)) = listener.accept().await {
                    debug!("fake replica accepted {peer}");
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    connections.spawn(serve(
                        stream,
                        script.clone(),
                        stats.clone(),
                        reject_context,
                    ));
                }
            }
        });

        Self {
            address,
            stats,
            task,
        }
    }

    pub fn address(&self) -> PhysicalAddress {
        self.address.clone()
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn context_requests(&self) -> usize {
        self.stats.context_requests.load(Ordering::SeqCst)
    }

    /// Application requests, health-check pings excluded.
    pub fn requests(&self) -> usize {
        self.stats.requests.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.stats.pings.load(Ordering::SeqCst)
    }
}

impl Drop for FakeReplica {
    fn drop(&mut self) {
        // Dropping the accept task drops its JoinSet, which aborts every
        // connection task.
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, script: Script, stats: Arc<ReplicaStats>, reject: Option<u16>) {
    stream.set_nodelay(true).unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let (replies, mut outgoing) = mpsc::unbounded_channel::<BytesMut>();
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outgoing.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let framer = Framer::default();
    let mut buffer = BytesMut::new();
    let Some(context_request) = next(&mut reader, &mut buffer, |buffer| {
        ContextRequest::decode(buffer, &framer).unwrap()
    })
    .await
    else {
        return;
    };
    stats.context_requests.fetch_add(1, Ordering::SeqCst);

    let mut out = BytesMut::new();
    if let Some(status) = reject {
        Context::encode_error(
            context_request.activity_id,
            status,
            &json!({ "code": "Unauthorized", "message": "context rejected" }),
            &mut out,
        )
        .unwrap();
        let _ = replies.send(out);
        drop(replies);
        let _ = writer_task.await;
        return;
    }
    Context {
        activity_id: context_request.activity_id,
        status: 200,
        server_agent: "fake-replica".to_string(),
        server_version: "2.0".to_string(),
        protocol_version: Some(CURRENT_PROTOCOL_VERSION),
        client_version: Some(context_request.client_version.clone()),
        idle_timeout: Some(Duration::from_secs(600)),
        unauthenticated_timeout: None,
    }
    .encode(&mut out)
    .unwrap();
    let _ = replies.send(out);

    let mut in_flight = JoinSet::new();
    while let Some(request) = next(&mut reader, &mut buffer, |buffer| {
        Request::decode(buffer, &framer).unwrap()
    })
    .await
    {
        if request.is_health_check() {
            stats.pings.fetch_add(1, Ordering::SeqCst);
        } else {
            stats.requests.fetch_add(1, Ordering::SeqCst);
        }
        let reply = script(&request);
        let replies = replies.clone();
        in_flight.spawn(async move { answer(request, reply, replies).await });
    }
    writer_task.abort();
}

/// Reads until `decode` yields a message or the client hangs up.
async fn next<T>(
    reader: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    mut decode: impl FnMut(&mut BytesMut) -> Option<T>,
) -> Option<T> {
    loop {
        if let Some(message) = decode(buffer) {
            return Some(message);
        }
        match reader.read_buf(buffer).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn answer(request: Request, mut reply: Reply, replies: mpsc::UnboundedSender<BytesMut>) {
    let reply = loop {
        match reply {
            Reply::Delayed { delay, reply: next } => {
                tokio::time::sleep(delay).await;
                reply = *next;
            }
            other => break other,
        }
    };

    let mut headers = TokenStream::new();
    if let Some(id) = request.transport_request_id() {
        headers.set_u32(ResponseHeader::TransportRequestId, id).unwrap();
    }
    let (status, payload) = match reply {
        Reply::Silence | Reply::Delayed { .. } => return,
        Reply::Echo => {
            headers.set_str(ResponseHeader::SessionToken, SESSION_TOKEN).unwrap();
            headers.set_i64(ResponseHeader::Lsn, 42).unwrap();
            headers.set_f64(ResponseHeader::RequestCharge, 1.5).unwrap();
            (200, request.payload.clone())
        }
        Reply::Status { status, sub_status } => {
            if let Some(sub_status) = sub_status {
                headers.set_u32(ResponseHeader::SubStatus, sub_status).unwrap();
            }
            headers.set_i64(ResponseHeader::Lsn, 42).unwrap();
            headers.set_str(ResponseHeader::PartitionKeyRangeId, PARTITION_KEY_RANGE_ID).unwrap();
            let body = json!({ "code": status.to_string(), "message": format!("scripted {status}") });
            (status, Some(Bytes::from(body.to_string())))
        }
    };

    let activity_id = if request.frame.activity_id.is_nil() {
        Uuid::new_v4()
    } else {
        request.frame.activity_id
    };
    let response = Response::new(status, activity_id, headers, payload).unwrap();
    let mut out = BytesMut::new();
    response.encode(&mut out).unwrap();
    let _ = replies.send(out);
}
