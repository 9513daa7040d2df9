//! Error types for pub/sub operations

use crate::config::ConfigError;
use crate::marshal::MarshalError;
use crate::pubsub::ConnectionState;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for publisher, subscriber and connection manager calls
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pub/sub is closed")]
    Closed,

    #[error("not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("already connected")]
    AlreadyConnected,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[source] TransportError),

    #[error("cannot marshal message {uuid}: {source}")]
    Marshal {
        uuid: String,
        #[source]
        source: MarshalError,
    },

    #[error("cannot send message {uuid}: {source}")]
    Publish {
        uuid: String,
        #[source]
        source: TransportError,
    },

    #[error("cannot begin transaction: {0}")]
    BeginTransaction(#[source] TransportError),

    #[error("cannot commit transaction: {0}")]
    CommitTransaction(#[source] TransportError),

    #[error("{}", describe_abort(.cause, .abort_error))]
    TransactionAborted {
        cause: Box<PubSubError>,
        abort_error: Option<TransportError>,
    },
}

fn describe_abort(cause: &PubSubError, abort_error: &Option<TransportError>) -> String {
    match abort_error {
        Some(abort) => format!("transaction aborted: {cause}; abort also failed: {abort}"),
        None => format!("transaction aborted: {cause}"),
    }
}

impl PubSubError {
    pub fn aborted(cause: PubSubError, abort_error: Option<TransportError>) -> Self {
        Self::TransactionAborted {
            cause: Box::new(cause),
            abort_error,
        }
    }

    /// The failure that caused an abort, or `self` for any other error
    pub fn root_cause(&self) -> &PubSubError {
        match self {
            Self::TransactionAborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
