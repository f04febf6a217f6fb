//! RNTBD Transport End-to-End Test Suite
//!
//! Drives the public transport API over real loopback TCP against
//! [`replica::FakeReplica`], an in-process replica that negotiates context
//! and answers requests according to a per-test script.
//!
//! Each test file can be run independently:
//!
//! ```bash
//! cargo test -p rntbd-e2e-tests --test request_lifecycle -- --nocapture
//! cargo test -p rntbd-e2e-tests --test pool_scenarios -- --nocapture
//! cargo test -p rntbd-e2e-tests --test health_scenarios -- --nocapture
//! ```

pub mod helpers;
pub mod replica;
