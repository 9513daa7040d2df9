//! Publish/subscribe over a managed STOMP connection
//!
//! A [`ConnectionManager`] owns the connection; a [`Publisher`] and any
//! number of [`Subscriber`]s share it through an `Arc`. Closing the manager
//! drains in-flight publishes, disconnects, then waits for every
//! subscription loop to stop.

pub mod connection;
pub mod drain;
pub mod publisher;
pub mod subscriber;

pub use connection::{ConnectionManager, ConnectionState, ConnectionStats, EpochConnection};
pub use drain::{DrainGroup, DrainGuard, Sealed};
pub use publisher::Publisher;
pub use subscriber::{Deliveries, Subscriber, DEFAULT_RECONNECT_BACKOFF};
