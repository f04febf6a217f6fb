//! Error types for the direct TCP transport.
//!
//! Failures fall into five families:
//!
//! - **framing**: the byte stream cannot be parsed; fatal to the channel;
//! - **lifecycle**: pool/channel/dial/acquisition failures, surfaced to the
//!   call that triggered them;
//! - **per request**: timeout, cancellation, or a channel-level failure seen
//!   by one in-flight request; always carries [`RequestDiagnostics`];
//! - **service**: a non-success response mapped by status and sub-status;
//! - **internal**: broken invariants (duplicate ids, illegal transitions,
//!   foreign releases), reported through [`report_issue!`].

use {
    std::{collections::HashMap, fmt, time::Duration},
    thiserror::Error,
    uuid::Uuid,
};

/// Request metadata preserved on every exceptional completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDiagnostics {
    /// Correlates client and server side logs.
    pub activity_id: Uuid,
    /// Wire correlation id of the request.
    pub transport_request_id: u32,
    /// Physical address of the target replica.
    pub address: String,
    /// The headers the caller supplied on the service request.
    pub request_headers: HashMap<String, String>,
}

impl fmt::Display for RequestDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "activity {} request #{} to {}",
            self.activity_id, self.transport_request_id, self.address
        )
    }
}

/// Status codes the service uses on the wire.
pub mod status {
    pub const OK: u16 = 200;
    pub const MULTIPLE_CHOICES: u16 = 300;
    pub const NOT_MODIFIED: u16 = 304;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const CONFLICT: u16 = 409;
    pub const GONE: u16 = 410;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const REQUEST_ENTITY_TOO_LARGE: u16 = 413;
    pub const LOCKED: u16 = 423;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const RETRY_WITH: u16 = 449;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;

    /// `true` for 2xx and 304, the statuses that complete a request normally.
    pub fn is_success(code: u16) -> bool {
        (OK..MULTIPLE_CHOICES).contains(&code) || code == NOT_MODIFIED
    }
}

/// Sub-status codes that refine a 410 (Gone) response.
pub mod sub_status {
    pub const NAME_CACHE_IS_STALE: u32 = 1000;
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    pub const COMPLETING_SPLIT: u32 = 1007;
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
}

/// The typed outcome of a non-success response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    Conflict,
    Gone,
    InvalidPartition,
    PartitionKeyRangeGone,
    PartitionKeyRangeIsSplitting,
    PartitionIsMigrating,
    PreconditionFailed,
    RequestEntityTooLarge,
    Locked,
    RequestRateTooLarge,
    RetryWith,
    InternalServerError,
    ServiceUnavailable,
    Other,
}

impl ServiceErrorKind {
    /// Maps a response status, and for 410 its sub-status, to an error kind.
    pub fn from_status(status: u16, sub_status: u32) -> Self {
        match status {
            status::BAD_REQUEST => Self::BadRequest,
            status::UNAUTHORIZED => Self::Unauthorized,
            status::FORBIDDEN => Self::Forbidden,
            status::NOT_FOUND => Self::NotFound,
            status::METHOD_NOT_ALLOWED => Self::MethodNotAllowed,
            status::REQUEST_TIMEOUT => Self::RequestTimeout,
            status::CONFLICT => Self::Conflict,
            status::GONE => match sub_status {
                sub_status::NAME_CACHE_IS_STALE => Self::InvalidPartition,
                sub_status::PARTITION_KEY_RANGE_GONE => Self::PartitionKeyRangeGone,
                sub_status::COMPLETING_SPLIT => Self::PartitionKeyRangeIsSplitting,
                sub_status::COMPLETING_PARTITION_MIGRATION => Self::PartitionIsMigrating,
                _ => Self::Gone,
            },
            status::PRECONDITION_FAILED => Self::PreconditionFailed,
            status::REQUEST_ENTITY_TOO_LARGE => Self::RequestEntityTooLarge,
            status::LOCKED => Self::Locked,
            status::TOO_MANY_REQUESTS => Self::RequestRateTooLarge,
            status::RETRY_WITH => Self::RetryWith,
            status::INTERNAL_SERVER_ERROR => Self::InternalServerError,
            status::SERVICE_UNAVAILABLE => Self::ServiceUnavailable,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::RequestTimeout => "request_timeout",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::InvalidPartition => "invalid_partition",
            Self::PartitionKeyRangeGone => "partition_key_range_gone",
            Self::PartitionKeyRangeIsSplitting => "partition_key_range_is_splitting",
            Self::PartitionIsMigrating => "partition_is_migrating",
            Self::PreconditionFailed => "precondition_failed",
            Self::RequestEntityTooLarge => "request_entity_too_large",
            Self::Locked => "locked",
            Self::RequestRateTooLarge => "request_rate_too_large",
            Self::RetryWith => "retry_with",
            Self::InternalServerError => "internal_server_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-success response, with everything needed to diagnose it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} (status {status}, sub-status {sub_status}) from {resource_address}: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub status: u16,
    pub sub_status: u32,
    /// Server supplied message, or the status reason when no body was sent.
    pub message: String,
    /// Response headers in their HTTP-style names.
    pub response_headers: HashMap<String, String>,
    pub resource_address: String,
    pub lsn: Option<i64>,
    pub partition_key_range_id: Option<String>,
    pub activity_id: Uuid,
}

/// Errors produced by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The inbound byte stream violates the frame or token format.
    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    /// A header value does not fit the wire type its schema declares.
    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    /// A physical address could not be parsed.
    #[error("invalid physical address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The pool was closed before or while the call was made.
    #[error("channel pool for {address} is closed")]
    PoolClosed { address: String },

    /// The channel was closed underneath the caller.
    #[error("channel to {address} closed: {reason}")]
    ChannelClosed { address: String, reason: String },

    /// Dialing a new channel failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A queued acquisition was not satisfied in time.
    #[error("timed out after {timeout:?} acquiring a channel to {address}")]
    AcquisitionTimeout { address: String, timeout: Duration },

    /// The pending acquisition queue is full.
    #[error("too many pending channel acquisitions for {address} (limit {limit})")]
    TooManyPendingAcquisitions { address: String, limit: usize },

    /// The replica rejected context negotiation.
    #[error("context negotiation with {address} failed with status {status}: {details}")]
    ContextNegotiation {
        address: String,
        status: u16,
        details: String,
    },

    /// No response arrived before the request timeout.
    #[error("request timed out after {timeout:?}: {diagnostics}")]
    RequestTimeout {
        diagnostics: Box<RequestDiagnostics>,
        timeout: Duration,
    },

    /// The caller abandoned the request.
    #[error("request cancelled: {diagnostics}")]
    Cancelled { diagnostics: Box<RequestDiagnostics> },

    /// A channel or pool level failure observed by one request.
    #[error("replica unavailable for {diagnostics}: {cause}")]
    Unavailable {
        diagnostics: Box<RequestDiagnostics>,
        #[source]
        cause: Box<TransportError>,
    },

    /// The replica answered with a non-success status.
    #[error(transparent)]
    Service(Box<ServiceError>),

    /// A transport invariant was broken; indicates a bug.
    #[error("internal state violation: {0}")]
    InternalState(String),

    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Framing errors are fatal to the channel that observed them.
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::CorruptedFrame(_))
    }

    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(error) => Some(error),
            _ => None,
        }
    }

    /// Diagnostics of the request this error was surfaced on, if any.
    pub fn diagnostics(&self) -> Option<&RequestDiagnostics> {
        match self {
            Self::RequestTimeout { diagnostics, .. }
            | Self::Cancelled { diagnostics }
            | Self::Unavailable { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Convenience result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Logs a broken invariant with source location and evaluates to a
/// [`TransportError::InternalState`].
#[macro_export]
macro_rules! report_issue {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        log::error!("[{}:{}] {}", file!(), line!(), message);
        $crate::error::TransportError::InternalState(message)
    }};
}
