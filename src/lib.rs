//! stomp-pubsub
//!
//! Publish/subscribe messaging over the STOMP 1.2 protocol with a managed,
//! self-healing connection.
//!
//! # Overview
//!
//! - [`ConnectionManager`] dials the broker, tracks connection epochs and
//!   runs the shutdown sequence
//! - [`Publisher`] sends batches of messages inside broker transactions
//! - [`Subscriber`] runs one reconnecting consumption loop per topic and
//!   delivers messages one at a time, waiting for each to be acked or nacked
//! - [`DefaultMarshaler`] maps [`Message`] metadata to frame headers
//! - [`transport::stomp`] is the TCP protocol client
//!
//! # Quick Start
//!
//! ```no_run
//! use stomp_pubsub::{
//!     ConnectionConfig, ConnectionManager, DefaultMarshaler, Message, Publisher, QueueNaming,
//!     StompConnector, Subscriber,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), stomp_pubsub::PubSubError> {
//! let manager = Arc::new(ConnectionManager::new(
//!     ConnectionConfig::new("tcp", "localhost:61613"),
//!     Arc::new(StompConnector),
//! )?);
//! manager.connect().await?;
//!
//! let marshaler = Arc::new(DefaultMarshaler::default());
//! let subscriber = Subscriber::new(manager.clone(), Arc::new(QueueNaming::TopicName), marshaler.clone());
//! let mut messages = subscriber.subscribe(CancellationToken::new(), "orders")?;
//!
//! let publisher = Publisher::new(manager.clone(), marshaler);
//! publisher.publish("orders", &[Message::new(stomp_pubsub::new_uuid(), "hello")]).await?;
//!
//! if let Some(msg) = messages.recv().await {
//!     msg.ack();
//! }
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod marshal;
pub mod message;
pub mod naming;
pub mod observability;
pub mod pubsub;
pub mod testing;
pub mod transport;

pub use config::{BridgeConfig, ConfigError, ConnectionConfig};
pub use error::PubSubError;
pub use marshal::{DefaultMarshaler, MarshalError, Marshaler};
pub use message::{new_uuid, AckOutcome, AckSignal, Message, Metadata};
pub use naming::{NamingStrategy, QueueNaming};
pub use pubsub::{ConnectionManager, ConnectionState, Deliveries, Publisher, Subscriber};
pub use transport::{StompConnector, TransportError};
