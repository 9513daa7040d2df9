//! Message and acknowledgment signal
//!
//! A [`Message`] travels decoder → delivery channel → application by move.
//! The subscription engine keeps only an [`AckSignal`] clone and waits on it
//! while the application decides.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Generate a random message UUID
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// String metadata attached to a message; keys are unique, order is irrelevant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, String>> for Metadata {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Settlement state of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Pending,
    Acked,
    Nacked,
}

/// Settable-once acknowledgment outcome.
///
/// The first of `ack`/`nack` wins. Repeating the winning call is a no-op that
/// still reports success; the losing call reports `false` and changes nothing.
#[derive(Clone)]
pub struct AckSignal {
    tx: Arc<watch::Sender<AckOutcome>>,
}

impl AckSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AckOutcome::Pending);
        Self { tx: Arc::new(tx) }
    }

    fn settle(&self, outcome: AckOutcome) -> bool {
        let mut settled = false;
        self.tx.send_if_modified(|current| {
            if *current == AckOutcome::Pending {
                *current = outcome;
                settled = true;
                true
            } else {
                settled = *current == outcome;
                false
            }
        });
        settled
    }

    /// Returns true if the message is acked, false if it was already nacked
    pub fn ack(&self) -> bool {
        self.settle(AckOutcome::Acked)
    }

    /// Returns true if the message is nacked, false if it was already acked
    pub fn nack(&self) -> bool {
        self.settle(AckOutcome::Nacked)
    }

    pub fn outcome(&self) -> AckOutcome {
        *self.tx.borrow()
    }

    /// Resolves once the message is acked; never resolves if it gets nacked
    pub async fn acked(&self) {
        self.wait_for(AckOutcome::Acked).await
    }

    /// Resolves once the message is nacked; never resolves if it gets acked
    pub async fn nacked(&self) {
        self.wait_for(AckOutcome::Nacked).await
    }

    async fn wait_for(&self, outcome: AckOutcome) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|current| *current == outcome).await.is_err() {
            // sender lives in `self`, so this is unreachable; park instead of
            // reporting a settlement that never happened
            std::future::pending::<()>().await;
        }
    }
}

impl Default for AckSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AckSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AckSignal").field(&self.outcome()).finish()
    }
}

/// Unit of transport between application code and the broker
pub struct Message {
    pub uuid: String,
    pub payload: Bytes,
    pub metadata: Metadata,
    ack: AckSignal,
    context: CancellationToken,
}

impl Message {
    pub fn new(uuid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            ack: AckSignal::new(),
            context: CancellationToken::new(),
        }
    }

    /// Builder-style metadata setter
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.set(key, value);
        self
    }

    pub fn ack(&self) -> bool {
        self.ack.ack()
    }

    pub fn nack(&self) -> bool {
        self.ack.nack()
    }

    pub fn outcome(&self) -> AckOutcome {
        self.ack.outcome()
    }

    /// Handle observing this message's settlement
    pub fn ack_signal(&self) -> AckSignal {
        self.ack.clone()
    }

    /// Cancellation scope of this message's processing
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    pub fn set_context(&mut self, context: CancellationToken) {
        self.context = context;
    }

    /// Copy of uuid, payload and metadata with a fresh, unsettled ack signal
    pub fn copy(&self) -> Message {
        Message {
            uuid: self.uuid.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            ack: AckSignal::new(),
            context: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .field("outcome", &self.outcome())
            .finish()
    }
}
