//! Testing utilities
//!
//! An in-memory broker implementing the transport seam, so the pub/sub layer
//! can be exercised without a running STOMP server.

pub mod mocks;

pub use mocks::{MockBroker, MockSession};
