//! Protocol client abstraction
//!
//! The pub/sub layer talks to the broker only through [`Connector`] and
//! [`Session`]. The TCP STOMP client in [`stomp`] is the production
//! implementation; [`crate::testing::MockBroker`] provides an in-memory one.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod stomp;

pub use stomp::{Frame, StompCodec, StompConnector};

/// Transport-level failures reported by a protocol client
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("broker error: {message}")]
    Broker { message: String, details: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("operation rejected: {0}")]
    Rejected(String),
}

/// Acknowledgment mode requested on SUBSCRIBE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-side transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to dial a broker
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub network: String,
    pub addr: String,
    /// STOMP virtual host; defaults to the address host when absent
    pub host: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub timeout: Duration,
}

/// An open broker-side subscription
///
/// `frames` yields MESSAGE frames and ends when the owning session dies.
#[derive(Debug)]
pub struct SessionSubscription {
    pub id: String,
    pub destination: String,
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

/// Dials new sessions. One call produces one connection epoch.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>, TransportError>;
}

/// A live protocol session.
///
/// Implementations serialise their own writes, so a session may be shared by
/// one publisher call and any number of subscription loops.
#[async_trait]
pub trait Session: Send + Sync {
    /// SEND a frame's headers and body to `destination`, optionally inside a transaction
    async fn send(
        &self,
        destination: &str,
        frame: Frame,
        transaction: Option<&TransactionId>,
    ) -> Result<(), TransportError>;

    async fn begin(&self) -> Result<TransactionId, TransportError>;

    async fn commit(&self, transaction: &TransactionId) -> Result<(), TransportError>;

    async fn abort(&self, transaction: &TransactionId) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        destination: &str,
        ack_mode: AckMode,
    ) -> Result<SessionSubscription, TransportError>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), TransportError>;

    /// ACK a MESSAGE frame previously received on this session
    async fn ack(&self, message: &Frame) -> Result<(), TransportError>;

    /// NACK a MESSAGE frame previously received on this session
    async fn nack(&self, message: &Frame) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Resolves once the session is gone, for whatever reason
    async fn closed(&self);

    fn is_closed(&self) -> bool;
}
