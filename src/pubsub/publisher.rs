//! Transactional publisher

use super::connection::ConnectionManager;
use crate::error::PubSubError;
use crate::marshal::Marshaler;
use crate::message::Message;
use crate::transport::{Session, TransactionId};
use std::sync::Arc;
use tracing::{debug, trace, warn, Instrument};

/// Sends batches of messages to one destination inside a broker transaction
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    marshaler: Arc<dyn Marshaler>,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>, marshaler: Arc<dyn Marshaler>) -> Self {
        Self { manager, marshaler }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Publish `messages` atomically: all of them are committed or none is.
    ///
    /// Fails fast with [`PubSubError::Closed`] or [`PubSubError::NotConnected`];
    /// nothing is buffered for later.
    pub async fn publish(&self, destination: &str, messages: &[Message]) -> Result<(), PubSubError> {
        if self.manager.is_closed() {
            return Err(PubSubError::Closed);
        }
        let _guard = self.manager.enter_publish()?;

        let conn = self.manager.current().ok_or_else(|| PubSubError::NotConnected {
            state: self.manager.state(),
        })?;

        if messages.is_empty() {
            return Ok(());
        }

        let span = crate::publish_span!(
            destination = destination,
            count = messages.len(),
            epoch = conn.epoch()
        );
        self.publish_in_transaction(conn.session().as_ref(), destination, messages)
            .instrument(span)
            .await
    }

    async fn publish_in_transaction(
        &self,
        session: &dyn Session,
        destination: &str,
        messages: &[Message],
    ) -> Result<(), PubSubError> {
        let transaction = session
            .begin()
            .await
            .map_err(PubSubError::BeginTransaction)?;
        trace!(transaction = %transaction, "Transaction begun");

        if let Err(cause) = self
            .send_all(session, destination, messages, &transaction)
            .await
        {
            let abort_error = match session.abort(&transaction).await {
                Ok(()) => {
                    trace!(transaction = %transaction, "Transaction aborted");
                    None
                }
                Err(e) => {
                    warn!(transaction = %transaction, error = %e, "Transaction abort failed");
                    Some(e)
                }
            };
            return Err(PubSubError::aborted(cause, abort_error));
        }

        session
            .commit(&transaction)
            .await
            .map_err(PubSubError::CommitTransaction)?;
        debug!(transaction = %transaction, count = messages.len(), "Transaction committed");
        Ok(())
    }

    async fn send_all(
        &self,
        session: &dyn Session,
        destination: &str,
        messages: &[Message],
        transaction: &TransactionId,
    ) -> Result<(), PubSubError> {
        for msg in messages {
            let frame = self
                .marshaler
                .encode(msg)
                .map_err(|source| PubSubError::Marshal {
                    uuid: msg.uuid.clone(),
                    source,
                })?;

            session
                .send(destination, frame, Some(transaction))
                .await
                .map_err(|source| PubSubError::Publish {
                    uuid: msg.uuid.clone(),
                    source,
                })?;
            trace!(message_uuid = %msg.uuid, "Message sent");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::marshal::DefaultMarshaler;
    use crate::testing::MockBroker;

    async fn connected(broker: &MockBroker) -> Publisher {
        let manager = ConnectionManager::new(
            ConnectionConfig::new("tcp", "mock:61613"),
            broker.connector(),
        )
        .unwrap();
        manager.connect().await.unwrap();
        Publisher::new(Arc::new(manager), Arc::new(DefaultMarshaler::default()))
    }

    #[tokio::test]
    async fn test_publish_commits_all_messages() {
        let broker = MockBroker::new();
        let publisher = connected(&broker).await;

        let messages = vec![Message::new("1", "a"), Message::new("2", "b")];
        publisher.publish("orders", &messages).await.unwrap();

        assert_eq!(broker.queued("orders"), 2);
        assert_eq!(broker.commit_count(), 1);
        assert_eq!(broker.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_publish_opens_no_transaction() {
        let broker = MockBroker::new();
        let publisher = connected(&broker).await;

        publisher.publish("orders", &[]).await.unwrap();
        assert_eq!(broker.commit_count(), 0);
        assert_eq!(broker.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_aborts() {
        let broker = MockBroker::new();
        let publisher = connected(&broker).await;
        broker.fail_send(true);

        let err = publisher
            .publish("orders", &[Message::new("1", "a")])
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), PubSubError::Publish { uuid, .. } if uuid == "1"));
        assert!(matches!(
            err,
            PubSubError::TransactionAborted {
                abort_error: None,
                ..
            }
        ));
        assert_eq!(broker.abort_count(), 1);
        assert_eq!(broker.queued("orders"), 0);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let broker = MockBroker::new();
        let manager = ConnectionManager::new(
            ConnectionConfig::new("tcp", "mock:61613"),
            broker.connector(),
        )
        .unwrap();
        let publisher = Publisher::new(Arc::new(manager), Arc::new(DefaultMarshaler::default()));

        let err = publisher
            .publish("orders", &[Message::new("1", "a")])
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_closed() {
        let broker = MockBroker::new();
        let publisher = connected(&broker).await;
        publisher.manager().close().await.unwrap();

        let err = publisher
            .publish("orders", &[Message::new("1", "a")])
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}
