//! Wire messages: application requests and responses plus the context
//! negotiation exchange that opens every channel.
//!
//! Decoders take the channel's read buffer and answer `Ok(None)` while the
//! frame (or its trailing payload) is still incomplete.  Nothing is consumed
//! from the buffer until a whole message is available.

use {
    crate::{
        address::PhysicalAddress,
        error::{status, RequestDiagnostics, Result, ServiceError, ServiceErrorKind, TransportError},
        frame::{Framer, OperationType, RequestFrame, ResourceType, ResponseStatus},
        headers::{http, ContextHeader, ContextRequestHeader, RequestHeader, ResponseHeader},
        token::{TokenStream, TokenValue},
    },
    bytes::{Buf, BufMut, Bytes, BytesMut},
    serde::Deserialize,
    std::{
        collections::HashMap,
        sync::Arc,
        time::{Duration, SystemTime},
    },
    uuid::Uuid,
};

/// Protocol version announced during context negotiation.
pub const CURRENT_PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Transport request id carried by health-check pings.  Never assigned to a
/// tracked request, so replies to pings go unmatched.
pub const HEALTH_CHECK_TRANSPORT_REQUEST_ID: u32 = 0;

// ── Service requests ────────────────────────────────────────────────────────

/// A transport-neutral request as built by the layers above the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub activity_id: Uuid,
    /// Binary resource id, for id-based addressing.
    pub resource_id: Option<Bytes>,
    /// Resource name, for name-based addressing.
    pub entity_id: Option<String>,
    /// HTTP-style headers keyed by lowercase name.
    pub headers: HashMap<String, String>,
    pub content: Option<Bytes>,
}

impl ServiceRequest {
    pub fn new(operation_type: OperationType, resource_type: ResourceType) -> Self {
        Self {
            operation_type,
            resource_type,
            activity_id: Uuid::new_v4(),
            resource_id: None,
            entity_id: None,
            headers: HashMap::new(),
            content: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<Bytes>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_activity_id(mut self, activity_id: Uuid) -> Self {
        self.activity_id = activity_id;
        self
    }
}

/// A service request bound to a replica and a transport request id.
#[derive(Debug, Clone)]
pub struct RequestArgs {
    request: Arc<ServiceRequest>,
    address: PhysicalAddress,
    transport_request_id: u32,
    created: SystemTime,
}

impl RequestArgs {
    pub fn new(request: ServiceRequest, address: PhysicalAddress, transport_request_id: u32) -> Self {
        Self {
            request: Arc::new(request),
            address,
            transport_request_id,
            created: SystemTime::now(),
        }
    }

    pub fn service_request(&self) -> &ServiceRequest {
        &self.request
    }

    pub fn address(&self) -> &PhysicalAddress {
        &self.address
    }

    pub fn activity_id(&self) -> Uuid {
        self.request.activity_id
    }

    pub fn transport_request_id(&self) -> u32 {
        self.transport_request_id
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn diagnostics(&self) -> Box<RequestDiagnostics> {
        Box::new(RequestDiagnostics {
            activity_id: self.request.activity_id,
            transport_request_id: self.transport_request_id,
            address: self.address.to_string(),
            request_headers: self.request.headers.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Conversion {
    Text,
    Unsigned,
    PageSize,
    Signed64,
    Flag,
    ConsistencyLevel,
    IndexingDirective,
}

/// Well-known HTTP headers and the tokens they travel as.  `if-match` is
/// listed before `if-none-match` so it wins when both are present.
const HTTP_REQUEST_HEADERS: &[(&str, RequestHeader, Conversion)] = &[
    (http::AUTHORIZATION, RequestHeader::AuthorizationToken, Conversion::Text),
    (http::SESSION_TOKEN, RequestHeader::SessionToken, Conversion::Text),
    (http::CONTINUATION, RequestHeader::ContinuationToken, Conversion::Text),
    (http::DATE, RequestHeader::Date, Conversion::Text),
    (http::VERSION, RequestHeader::ClientVersion, Conversion::Text),
    (http::IF_MATCH, RequestHeader::Match, Conversion::Text),
    (http::IF_NONE_MATCH, RequestHeader::Match, Conversion::Text),
    (http::IF_MODIFIED_SINCE, RequestHeader::IfModifiedSince, Conversion::Text),
    (http::A_IM, RequestHeader::AIm, Conversion::Text),
    (http::PARTITION_KEY, RequestHeader::PartitionKey, Conversion::Text),
    (http::PARTITION_KEY_RANGE_ID, RequestHeader::PartitionKeyRangeId, Conversion::Text),
    (http::PRE_TRIGGER_INCLUDE, RequestHeader::PreTriggerInclude, Conversion::Text),
    (http::POST_TRIGGER_INCLUDE, RequestHeader::PostTriggerInclude, Conversion::Text),
    (http::COLLECTION_RID, RequestHeader::CollectionRid, Conversion::Text),
    (http::MAX_ITEM_COUNT, RequestHeader::PageSize, Conversion::PageSize),
    (http::CONSISTENCY_LEVEL, RequestHeader::ConsistencyLevel, Conversion::ConsistencyLevel),
    (http::INDEXING_DIRECTIVE, RequestHeader::IndexingDirective, Conversion::IndexingDirective),
    (http::ENABLE_SCAN_IN_QUERY, RequestHeader::EnableScanInQuery, Conversion::Flag),
    (http::POPULATE_QUOTA_INFO, RequestHeader::PopulateQuotaInfo, Conversion::Flag),
    (http::POPULATE_QUERY_METRICS, RequestHeader::PopulateQueryMetrics, Conversion::Flag),
    (http::ALLOW_TENTATIVE_WRITES, RequestHeader::AllowTentativeWrites, Conversion::Flag),
    (
        http::RESPONSE_CONTINUATION_TOKEN_LIMIT_IN_KB,
        RequestHeader::ResponseContinuationTokenLimitInKb,
        Conversion::Unsigned,
    ),
    (
        http::REMAINING_TIME_IN_MS_ON_CLIENT,
        RequestHeader::RemainingTimeInMsOnClientRequest,
        Conversion::Unsigned,
    ),
    (
        http::CLIENT_RETRY_ATTEMPT_COUNT,
        RequestHeader::ClientRetryAttemptCount,
        Conversion::Unsigned,
    ),
    (http::TARGET_LSN, RequestHeader::TargetLsn, Conversion::Signed64),
    (
        http::TARGET_GLOBAL_COMMITTED_LSN,
        RequestHeader::TargetGlobalCommittedLsn,
        Conversion::Signed64,
    ),
];

fn convert_header(
    stream: &mut TokenStream<RequestHeader>,
    name: &str,
    header: RequestHeader,
    conversion: Conversion,
    value: &str,
) -> Result<()> {
    let invalid = || TransportError::InvalidHeader(format!("{name}: unexpected value {value:?}"));
    match conversion {
        Conversion::Text => stream.set_str(header, value),
        Conversion::Unsigned => stream.set_u32(header, value.parse().map_err(|_| invalid())?),
        Conversion::PageSize => {
            let size: i64 = value.parse().map_err(|_| invalid())?;
            let size = if size == -1 {
                u32::MAX
            } else {
                u32::try_from(size).map_err(|_| invalid())?
            };
            stream.set_u32(header, size)
        }
        Conversion::Signed64 => stream.set_i64(header, value.parse().map_err(|_| invalid())?),
        Conversion::Flag => {
            let flag = match value.to_ascii_lowercase().as_str() {
                "true" => 1,
                "false" => 0,
                _ => return Err(invalid()),
            };
            stream.set_byte(header, flag)
        }
        Conversion::ConsistencyLevel => {
            let level = match value.to_ascii_lowercase().as_str() {
                "strong" => 0x00,
                "boundedstaleness" => 0x01,
                "session" => 0x02,
                "eventual" => 0x03,
                "consistentprefix" => 0x04,
                _ => return Err(invalid()),
            };
            stream.set_byte(header, level)
        }
        Conversion::IndexingDirective => {
            let directive = match value.to_ascii_lowercase().as_str() {
                "default" => 0x00,
                "include" => 0x01,
                "exclude" => 0x02,
                _ => return Err(invalid()),
            };
            stream.set_byte(header, directive)
        }
    }
}

/// Reads the `[length][preamble][tokens]` head of the frame at the front of
/// `buffer` without consuming it.
fn peek_head<'a>(buffer: &'a [u8], framer: &Framer) -> Result<Option<(usize, &'a [u8])>> {
    if !framer.can_decode_head(buffer)? {
        return Ok(None);
    }
    match framer.declared_length(buffer)? {
        Some(length) => Ok(Some((length, &buffer[..length]))),
        None => Ok(None),
    }
}

/// Splits a `u32`-prefixed payload off the front of `buffer`.
fn take_payload(buffer: &mut BytesMut) -> Bytes {
    let length = buffer.get_u32_le() as usize;
    buffer.split_to(length).freeze()
}

fn frame_length(preamble: usize, headers: usize) -> Result<u32> {
    u32::try_from(preamble.saturating_add(headers))
        .map_err(|_| TransportError::InvalidHeader("header block too large to frame".to_string()))
}

fn put_payload(payload: &Bytes, out: &mut BytesMut) -> Result<()> {
    let length = u32::try_from(payload.len())
        .map_err(|_| TransportError::InvalidHeader("payload too large to frame".to_string()))?;
    out.put_u32_le(length);
    out.put_slice(payload);
    Ok(())
}

// ── Requests ────────────────────────────────────────────────────────────────

/// An application request as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub frame: RequestFrame,
    pub headers: TokenStream<RequestHeader>,
    pub payload: Option<Bytes>,
}

impl Request {
    /// Maps a bound service request to its wire form.
    ///
    /// Header names without a wire token stay on the service request and
    /// only surface in diagnostics.
    pub fn from_args(args: &RequestArgs) -> Result<Self> {
        let request = args.service_request();
        let mut headers = TokenStream::new();

        headers.set_byte(RequestHeader::PayloadPresent, u8::from(request.content.is_some()))?;
        headers.set_str(RequestHeader::ReplicaPath, args.address().replica_path())?;
        headers.set_u32(RequestHeader::TransportRequestId, args.transport_request_id())?;
        if let Some(resource_id) = &request.resource_id {
            headers.set_bytes(RequestHeader::ResourceId, resource_id.clone())?;
        }
        if let Some(entity_id) = &request.entity_id {
            headers.set_str(RequestHeader::EntityId, entity_id.as_str())?;
        }
        for (name, header, conversion) in HTTP_REQUEST_HEADERS {
            if headers.is_present(*header) {
                continue;
            }
            if let Some(value) = request.headers.get(*name) {
                convert_header(&mut headers, name, *header, *conversion, value)?;
            }
        }

        Ok(Self {
            frame: RequestFrame::new(
                request.activity_id,
                request.operation_type,
                request.resource_type,
            ),
            headers,
            payload: request.content.clone(),
        })
    }

    /// The smallest valid request: no payload, addressed to the connection
    /// itself, under the reserved health-check id.
    pub fn health_check(address: &PhysicalAddress) -> Result<Self> {
        let mut headers = TokenStream::new();
        headers.set_byte(RequestHeader::PayloadPresent, 0)?;
        headers.set_str(RequestHeader::ReplicaPath, address.replica_path())?;
        headers.set_u32(
            RequestHeader::TransportRequestId,
            HEALTH_CHECK_TRANSPORT_REQUEST_ID,
        )?;
        Ok(Self {
            frame: RequestFrame::new(Uuid::new_v4(), OperationType::Head, ResourceType::Connection),
            headers,
            payload: None,
        })
    }

    pub fn is_health_check(&self) -> bool {
        self.transport_request_id() == Some(HEALTH_CHECK_TRANSPORT_REQUEST_ID)
    }

    pub fn transport_request_id(&self) -> Option<u32> {
        self.headers.get_u32(RequestHeader::TransportRequestId)
    }

    pub fn replica_path(&self) -> Option<&str> {
        self.headers.get_str(RequestHeader::ReplicaPath)
    }

    pub fn encoded_len(&self) -> usize {
        let head = RequestFrame::LENGTH.saturating_add(self.headers.encoded_len());
        match &self.payload {
            Some(payload) => head.saturating_add(4).saturating_add(payload.len()),
            None => head,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        out.reserve(self.encoded_len());
        out.put_u32_le(frame_length(RequestFrame::LENGTH, self.headers.encoded_len())?);
        self.frame.encode(out);
        self.headers.encode(out);
        if let Some(payload) = &self.payload {
            put_payload(payload, out)?;
        }
        Ok(())
    }

    pub fn decode(buffer: &mut BytesMut, framer: &Framer) -> Result<Option<Self>> {
        let Some((length, head)) = peek_head(buffer, framer)? else {
            return Ok(None);
        };
        let frame = RequestFrame::decode(&mut &head[4..RequestFrame::LENGTH])?;
        let headers = TokenStream::<RequestHeader>::decode(Bytes::copy_from_slice(
            &head[RequestFrame::LENGTH..],
        ))?;
        let payload_present = headers.get_byte(RequestHeader::PayloadPresent) != Some(0);
        if payload_present && !framer.can_decode_payload(buffer, length)? {
            return Ok(None);
        }

        buffer.advance(length);
        let payload = payload_present.then(|| take_payload(buffer));
        Ok(Some(Self {
            frame,
            headers,
            payload,
        }))
    }
}

// ── Responses ───────────────────────────────────────────────────────────────

/// A response in its HTTP-style shape, as handed back to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub content: Option<Bytes>,
}

impl StoreResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn session_token(&self) -> Option<&str> {
        self.header(http::SESSION_TOKEN)
    }

    pub fn lsn(&self) -> Option<i64> {
        self.header(http::LSN)?.parse().ok()
    }

    pub fn request_charge(&self) -> Option<f64> {
        self.header(http::REQUEST_CHARGE)?.parse().ok()
    }

    pub fn sub_status(&self) -> u32 {
        self.header(http::SUB_STATUS)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

fn format_token(header: ResponseHeader, value: &TokenValue) -> String {
    match value {
        TokenValue::Byte(v) if header.is_flag() => (*v != 0).to_string(),
        TokenValue::Byte(v) => v.to_string(),
        TokenValue::UShort(v) => v.to_string(),
        TokenValue::ULong(v) => v.to_string(),
        TokenValue::Long(v) => v.to_string(),
        TokenValue::ULongLong(v) => v.to_string(),
        TokenValue::LongLong(v) => v.to_string(),
        TokenValue::Guid(v) => v.to_string(),
        TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => {
            s.clone()
        }
        TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => {
            b.iter().map(|byte| format!("{byte:02x}")).collect()
        }
        TokenValue::Float(v) => v.to_string(),
        TokenValue::Double(v) => v.to_string(),
    }
}

/// An application response as it travels on the wire.
///
/// The payload is a [`Bytes`] view into the read buffer it was split from;
/// the storage is released when the last view drops.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: ResponseStatus,
    pub headers: TokenStream<ResponseHeader>,
    pub payload: Option<Bytes>,
}

impl Response {
    /// Builds a response, filling in the payload flag and frame length.
    pub fn new(
        status: u16,
        activity_id: Uuid,
        mut headers: TokenStream<ResponseHeader>,
        payload: Option<Bytes>,
    ) -> Result<Self> {
        headers.set_byte(ResponseHeader::PayloadPresent, u8::from(payload.is_some()))?;
        let length = frame_length(ResponseStatus::LENGTH, headers.encoded_len())?;
        Ok(Self {
            status: ResponseStatus {
                length,
                status,
                activity_id,
            },
            headers,
            payload,
        })
    }

    pub fn status_code(&self) -> u16 {
        self.status.status
    }

    pub fn activity_id(&self) -> Uuid {
        self.status.activity_id
    }

    pub fn transport_request_id(&self) -> Option<u32> {
        self.headers.get_u32(ResponseHeader::TransportRequestId)
    }

    pub fn sub_status(&self) -> u32 {
        self.headers
            .get_u32(ResponseHeader::SubStatus)
            .unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        status::is_success(self.status.status)
    }

    pub fn encoded_len(&self) -> usize {
        let head = ResponseStatus::LENGTH.saturating_add(self.headers.encoded_len());
        match &self.payload {
            Some(payload) => head.saturating_add(4).saturating_add(payload.len()),
            None => head,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        out.reserve(self.encoded_len());
        let status = ResponseStatus {
            length: frame_length(ResponseStatus::LENGTH, self.headers.encoded_len())?,
            ..self.status
        };
        status.encode(out);
        self.headers.encode(out);
        if let Some(payload) = &self.payload {
            put_payload(payload, out)?;
        }
        Ok(())
    }

    pub fn decode(buffer: &mut BytesMut, framer: &Framer) -> Result<Option<Self>> {
        let Some((length, head)) = peek_head(buffer, framer)? else {
            return Ok(None);
        };
        let status = ResponseStatus::decode(&mut &head[..ResponseStatus::LENGTH])?;
        let headers = TokenStream::<ResponseHeader>::decode(Bytes::copy_from_slice(
            &head[ResponseStatus::LENGTH..],
        ))?;
        let payload_present = headers.get_byte(ResponseHeader::PayloadPresent) != Some(0);
        if payload_present && !framer.can_decode_payload(buffer, length)? {
            return Ok(None);
        }

        buffer.advance(length);
        let payload = payload_present.then(|| take_payload(buffer));
        Ok(Some(Self {
            status,
            headers,
            payload,
        }))
    }

    /// Response headers under their HTTP-style names.  Headers without a
    /// well-known name are omitted.
    pub fn header_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for token in self.headers.iter() {
            let (Some(header), Some(value)) = (token.header(), token.value()) else {
                continue;
            };
            if let Some(name) = header.http_name() {
                map.insert(name.to_string(), format_token(header, value));
            }
        }
        map.insert(http::ACTIVITY_ID.to_string(), self.activity_id().to_string());
        map
    }

    pub fn into_store_response(self) -> StoreResponse {
        StoreResponse {
            status: self.status.status,
            headers: self.header_map(),
            content: self.payload,
        }
    }

    /// Maps a non-success response to its typed error.  The message comes
    /// from the JSON error body when the server sent one.
    pub fn to_service_error(&self, address: &PhysicalAddress) -> ServiceError {
        let status = self.status.status;
        let sub_status = self.sub_status();
        let body = self
            .payload
            .as_ref()
            .and_then(|payload| serde_json::from_slice::<ErrorBody>(payload).ok());
        let message = match body {
            Some(ErrorBody {
                message: Some(message),
                ..
            }) => message,
            Some(ErrorBody {
                code: Some(code), ..
            }) => code,
            _ => match &self.payload {
                Some(payload) if !payload.is_empty() => String::from_utf8_lossy(payload).into_owned(),
                _ => format!("status {status}"),
            },
        };

        ServiceError {
            kind: ServiceErrorKind::from_status(status, sub_status),
            status,
            sub_status,
            message,
            response_headers: self.header_map(),
            resource_address: address.to_string(),
            lsn: self.headers.get_i64(ResponseHeader::Lsn),
            partition_key_range_id: self
                .headers
                .get_str(ResponseHeader::PartitionKeyRangeId)
                .map(str::to_owned),
            activity_id: self.activity_id(),
        }
    }
}

// ── Context negotiation ─────────────────────────────────────────────────────

/// The first message written on every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    pub activity_id: Uuid,
    pub protocol_version: u32,
    pub client_version: String,
    pub user_agent: String,
}

impl ContextRequest {
    pub fn new(client_version: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            activity_id: Uuid::new_v4(),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            client_version: client_version.into(),
            user_agent: user_agent.into(),
        }
    }

    fn frame(&self) -> RequestFrame {
        RequestFrame::new(
            self.activity_id,
            OperationType::Connection,
            ResourceType::Connection,
        )
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        let mut headers = TokenStream::new();
        headers.set_u32(ContextRequestHeader::ProtocolVersion, self.protocol_version)?;
        headers.set_str(ContextRequestHeader::ClientVersion, self.client_version.as_str())?;
        headers.set_str(ContextRequestHeader::UserAgent, self.user_agent.as_str())?;

        out.put_u32_le(frame_length(RequestFrame::LENGTH, headers.encoded_len())?);
        self.frame().encode(out);
        headers.encode(out);
        Ok(())
    }

    pub fn decode(buffer: &mut BytesMut, framer: &Framer) -> Result<Option<Self>> {
        let Some((length, head)) = peek_head(buffer, framer)? else {
            return Ok(None);
        };
        let frame = RequestFrame::decode(&mut &head[4..RequestFrame::LENGTH])?;
        if frame.operation_type != OperationType::Connection {
            return Err(TransportError::CorruptedFrame(format!(
                "expected a context request, got {:?}",
                frame.operation_type
            )));
        }
        let headers = TokenStream::<ContextRequestHeader>::decode(Bytes::copy_from_slice(
            &head[RequestFrame::LENGTH..],
        ))?;
        buffer.advance(length);

        Ok(Some(Self {
            activity_id: frame.activity_id,
            protocol_version: headers
                .get_u32(ContextRequestHeader::ProtocolVersion)
                .unwrap_or_default(),
            client_version: headers
                .get_str(ContextRequestHeader::ClientVersion)
                .unwrap_or_default()
                .to_string(),
            user_agent: headers
                .get_str(ContextRequestHeader::UserAgent)
                .unwrap_or_default()
                .to_string(),
        }))
    }
}

/// The negotiated protocol context of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub activity_id: Uuid,
    pub status: u16,
    pub server_agent: String,
    pub server_version: String,
    pub protocol_version: Option<u32>,
    pub client_version: Option<String>,
    pub idle_timeout: Option<Duration>,
    pub unauthenticated_timeout: Option<Duration>,
}

fn is_context_error(status: u16) -> bool {
    !(status::OK..status::BAD_REQUEST).contains(&status)
}

impl Context {
    /// Decodes the negotiation response.  A rejection is returned as
    /// [`TransportError::ContextNegotiation`] carrying the server's JSON
    /// error details.
    pub fn decode(
        buffer: &mut BytesMut,
        framer: &Framer,
        address: &PhysicalAddress,
    ) -> Result<Option<Self>> {
        let Some((length, head)) = peek_head(buffer, framer)? else {
            return Ok(None);
        };
        let status = ResponseStatus::decode(&mut &head[..ResponseStatus::LENGTH])?;

        if is_context_error(status.status) {
            // An empty header block means the details follow unannounced.
            let block = &head[ResponseStatus::LENGTH..];
            let payload_present = block.is_empty()
                || TokenStream::<ResponseHeader>::decode(Bytes::copy_from_slice(block))?
                    .get_byte(ResponseHeader::PayloadPresent)
                    != Some(0);
            if payload_present && !framer.can_decode_payload(buffer, length)? {
                return Ok(None);
            }
            buffer.advance(length);
            let details = if payload_present {
                let payload = take_payload(buffer);
                match serde_json::from_slice::<serde_json::Value>(&payload) {
                    Ok(value) => value.to_string(),
                    Err(_) => String::from_utf8_lossy(&payload).into_owned(),
                }
            } else {
                String::new()
            };
            return Err(TransportError::ContextNegotiation {
                address: address.to_string(),
                status: status.status,
                details,
            });
        }

        let headers = TokenStream::<ContextHeader>::decode(Bytes::copy_from_slice(
            &head[ResponseStatus::LENGTH..],
        ))?;
        buffer.advance(length);

        let seconds = |header| {
            headers
                .get_u32(header)
                .map(|secs| Duration::from_secs(u64::from(secs)))
        };
        Ok(Some(Self {
            activity_id: status.activity_id,
            status: status.status,
            server_agent: headers
                .get_str(ContextHeader::ServerAgent)
                .unwrap_or_default()
                .to_string(),
            server_version: headers
                .get_str(ContextHeader::ServerVersion)
                .unwrap_or_default()
                .to_string(),
            protocol_version: headers.get_u32(ContextHeader::ProtocolVersion),
            client_version: headers
                .get_str(ContextHeader::ClientVersion)
                .map(str::to_owned),
            idle_timeout: seconds(ContextHeader::IdleTimeoutInSeconds),
            unauthenticated_timeout: seconds(ContextHeader::UnauthenticatedTimeoutInSeconds),
        }))
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        let mut headers = TokenStream::new();
        headers.set_str(ContextHeader::ServerAgent, self.server_agent.as_str())?;
        headers.set_str(ContextHeader::ServerVersion, self.server_version.as_str())?;
        if let Some(version) = self.protocol_version {
            headers.set_u32(ContextHeader::ProtocolVersion, version)?;
        }
        if let Some(version) = &self.client_version {
            headers.set_str(ContextHeader::ClientVersion, version.as_str())?;
        }
        let as_secs = |timeout: Duration| u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        if let Some(timeout) = self.idle_timeout {
            headers.set_u32(ContextHeader::IdleTimeoutInSeconds, as_secs(timeout))?;
        }
        if let Some(timeout) = self.unauthenticated_timeout {
            headers.set_u32(
                ContextHeader::UnauthenticatedTimeoutInSeconds,
                as_secs(timeout),
            )?;
        }

        ResponseStatus {
            length: frame_length(ResponseStatus::LENGTH, headers.encoded_len())?,
            status: self.status,
            activity_id: self.activity_id,
        }
        .encode(out);
        headers.encode(out);
        Ok(())
    }

    /// Writes a negotiation rejection with a JSON error body.
    pub fn encode_error(
        activity_id: Uuid,
        status: u16,
        details: &serde_json::Value,
        out: &mut BytesMut,
    ) -> Result<()> {
        let body = Bytes::from(details.to_string());
        Self::encode_rejection(activity_id, status, Some(&body), out)
    }

    /// Writes a negotiation rejection, announcing through `PayloadPresent`
    /// whether a body follows.
    pub fn encode_rejection(
        activity_id: Uuid,
        status: u16,
        body: Option<&Bytes>,
        out: &mut BytesMut,
    ) -> Result<()> {
        let mut headers = TokenStream::new();
        headers.set_byte(ResponseHeader::PayloadPresent, u8::from(body.is_some()))?;
        ResponseStatus {
            length: frame_length(ResponseStatus::LENGTH, headers.encoded_len())?,
            status,
            activity_id,
        }
        .encode(out);
        headers.encode(out);
        if let Some(body) = body {
            put_payload(body, out)?;
        }
        Ok(())
    }
}
