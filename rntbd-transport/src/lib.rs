//! RNTBD Direct Transport
//!
//! This crate speaks the RNTBD binary protocol to database replicas over
//! pooled TCP connections, multiplexing many logical requests over a small
//! bounded set of channels per replica endpoint.  It handles:
//!
//! - **Wire codec**: fixed request/response preambles, the schema-driven
//!   header token stream, and length-prefixed payloads, all little-endian.
//! - **Request lifecycle**: each request is a record moving through
//!   `Queued → Pipelined → Sent → Received → Completed`, with first-writer
//!   wins completion, per-request expiry, and cancellation on drop.
//! - **Channels**: context negotiation before any request is written,
//!   correlation of responses by transport request id, and fan-out of
//!   connection failures to every request still in flight.
//! - **Pooling**: a bounded pool per endpoint with LIFO reuse,
//!   single-flight dialing, a FIFO queue of waiting acquisitions, and
//!   health checks that detect black-holed connections.
//!
//! ## Architecture
//!
//! ```text
//!  EndpointProvider ── one Endpoint per replica authority
//!        │
//!  Endpoint.request(args) ──► PendingResponse (awaitable)
//!        │
//!  ChannelPool (worker task) ── acquire / release / close
//!        │
//!  Channel ── writer task ──► socket ──► replica
//!        │    reader task ◄── socket ◄──
//!        │
//!  RequestManager ── pending records by transport request id
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`token`]     | Typed header tokens and token streams |
//! | [`headers`]   | Header schemas for context, request and response frames |
//! | [`frame`]     | Frame preambles and frame boundary detection |
//! | [`message`]   | Requests, responses, and context negotiation messages |
//! | [`record`]    | Request record stage machine and pending-response handle |
//! | [`timer`]     | Request expiration |
//! | [`manager`]   | Per-channel request tracking and timestamps |
//! | [`channel`]   | Reader/writer tasks for one connection |
//! | [`health`]    | Black-hole detection and ping |
//! | [`pool`]      | Bounded per-endpoint channel pool |
//! | [`endpoint`]  | Endpoints, the endpoint provider, request ids |
//! | [`connector`] | Dialing seam and the TCP default |
//! | [`retry`]     | Acquisition backoff policy for warm-up schedulers |
//! | [`metrics`]   | Endpoint counters and the per-request recorder |
//! | [`config`]    | `TransportConfig` defaults and dev overrides |
//! | [`address`]   | Physical replica addresses |
//! | [`error`]     | Crate-wide error enum and service error mapping |

pub mod address;
pub mod channel;
pub mod config;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod headers;
pub mod health;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod record;
pub mod retry;
pub mod timer;
pub mod token;

pub use {
    address::PhysicalAddress,
    config::{AcquisitionTimeoutAction, TransportConfig},
    endpoint::{Endpoint, EndpointProvider},
    error::{Result, ServiceError, ServiceErrorKind, TransportError},
    message::{RequestArgs, ServiceRequest, StoreResponse},
    record::PendingResponse,
};
