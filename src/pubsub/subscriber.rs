//! Reconnecting subscription engine
//!
//! Each [`Subscriber::subscribe`] call spawns one task running a
//! [`SubscriptionLoop`]. The loop waits for a connection, consumes until the
//! connection drops or shutdown is requested, backs off and starts over.
//! Delivery is single-in-flight: the next frame is not decoded until the
//! previous message has been acked or nacked.
//!
//! A message counts as delivered only once the consumer has taken it out of
//! [`Deliveries`]. One that is still buffered when the loop gives up on it is
//! settled as nacked and skipped by [`Deliveries::recv`].

use super::connection::{ConnectionManager, EpochConnection};
use super::drain::DrainGuard;
use crate::error::PubSubError;
use crate::marshal::Marshaler;
use crate::message::{AckOutcome, AckSignal, Message};
use crate::naming::NamingStrategy;
use crate::transport::stomp::frame::header;
use crate::transport::{AckMode, Frame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Default delay between consumption attempts
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Hands out reconnecting subscriptions on a shared connection
pub struct Subscriber {
    manager: Arc<ConnectionManager>,
    naming: Arc<dyn NamingStrategy>,
    marshaler: Arc<dyn Marshaler>,
    backoff: Duration,
}

impl Subscriber {
    pub fn new(
        manager: Arc<ConnectionManager>,
        naming: Arc<dyn NamingStrategy>,
        marshaler: Arc<dyn Marshaler>,
    ) -> Self {
        Self {
            manager,
            naming,
            marshaler,
            backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    /// Zero is raised to one millisecond
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff.max(Duration::from_millis(1));
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Destination that `topic` is consumed from
    pub fn destination(&self, topic: &str) -> String {
        self.naming.destination(topic)
    }

    /// Start consuming `topic`.
    ///
    /// Messages arrive on the returned receiver one at a time; each must be
    /// acked or nacked before the next one is delivered. The receiver closes
    /// when `ctx` is cancelled or the manager is closed.
    pub fn subscribe(
        &self,
        ctx: CancellationToken,
        topic: &str,
    ) -> Result<Deliveries, PubSubError> {
        if self.manager.is_closed() {
            return Err(PubSubError::Closed);
        }
        let conn = self
            .manager
            .current()
            .ok_or_else(|| PubSubError::NotConnected {
                state: self.manager.state(),
            })?;

        let destination = self.destination(topic);
        let guard = self.manager.enter_subscription()?;
        let (tx, rx) = mpsc::channel(1);

        let span = crate::subscription_span!(topic = %topic, destination = %destination);
        let subscription = SubscriptionLoop {
            manager: self.manager.clone(),
            marshaler: self.marshaler.clone(),
            destination,
            backoff: self.backoff,
            ctx,
            tx,
            _guard: guard,
        };
        tokio::spawn(subscription.run(conn.epoch()).instrument(span));

        Ok(Deliveries { rx })
    }
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Deliveries {
    rx: mpsc::Receiver<Message>,
}

impl Deliveries {
    /// Next message, or `None` once the subscription has stopped.
    ///
    /// Messages withdrawn by the subscription before they were taken are
    /// skipped; the broker redelivers them.
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(msg) = self.rx.recv().await {
            if msg.outcome() == AckOutcome::Pending {
                return Some(msg);
            }
            trace!(message_uuid = %msg.uuid, "Skipping withdrawn message");
        }
        None
    }
}

/// Why one consumption attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumeOutcome {
    Stopped,
    ConnectionLost,
    SubscribeFailed,
}

/// What to do after one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
    Lost,
}

struct SubscriptionLoop {
    manager: Arc<ConnectionManager>,
    marshaler: Arc<dyn Marshaler>,
    destination: String,
    backoff: Duration,
    ctx: CancellationToken,
    tx: mpsc::Sender<Message>,
    // declared last: the delivery channel closes before the drain group is left
    _guard: DrainGuard,
}

impl SubscriptionLoop {
    async fn run(self, first_epoch: u64) {
        let mut last_epoch = first_epoch;
        let mut want_fresh = false;

        loop {
            debug!("Waiting for connection");
            let Some(conn) = self.wait_for_connection(last_epoch, want_fresh).await else {
                break;
            };
            last_epoch = conn.epoch();

            match self.consume(&conn).await {
                ConsumeOutcome::Stopped => break,
                ConsumeOutcome::ConnectionLost => {
                    self.manager.mark_lost(conn.epoch());
                    want_fresh = true;
                }
                ConsumeOutcome::SubscribeFailed => want_fresh = false,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                _ = self.manager.closing().cancelled() => break,
                _ = self.ctx.cancelled() => break,
            }
        }

        info!("Stopped consuming from STOMP destination");
    }

    /// Wait for a usable connection. With `want_fresh`, epoch `last_epoch`
    /// is not accepted. While nothing is available, `reconnect` is attempted
    /// every backoff interval.
    async fn wait_for_connection(
        &self,
        last_epoch: u64,
        want_fresh: bool,
    ) -> Option<EpochConnection> {
        let stale = want_fresh.then_some(last_epoch);
        let wait = self.manager.wait_connected(stale);
        tokio::pin!(wait);

        let mut retry = tokio::time::interval(self.backoff);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                result = &mut wait => {
                    return match result {
                        Ok(conn) => {
                            debug!(epoch = conn.epoch(), "Connection established");
                            Some(conn)
                        }
                        Err(_) => None,
                    };
                }
                _ = self.manager.closing().cancelled() => {
                    debug!("Stopping reconnect loop (closing)");
                    return None;
                }
                _ = self.ctx.cancelled() => {
                    debug!("Stopping reconnect loop (ctx done)");
                    return None;
                }
                _ = retry.tick() => {
                    match self.manager.reconnect(last_epoch).await {
                        Ok(conn) => return Some(conn),
                        Err(PubSubError::Closed) => return None,
                        Err(e) => warn!(error = %e, "Reconnect failed, retrying"),
                    }
                }
            }
        }
    }

    async fn consume(&self, conn: &EpochConnection) -> ConsumeOutcome {
        let session = conn.session();
        let mut subscription = match session
            .subscribe(&self.destination, AckMode::ClientIndividual)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) if conn.is_lost() => {
                warn!(epoch = conn.epoch(), error = %e, "Subscribe failed on a lost connection");
                return ConsumeOutcome::ConnectionLost;
            }
            Err(e) => {
                error!(epoch = conn.epoch(), error = %e, "Failed to subscribe");
                return ConsumeOutcome::SubscribeFailed;
            }
        };

        info!(epoch = conn.epoch(), "Starting consuming from STOMP destination");
        let outcome = self.process_messages(conn, &mut subscription.frames).await;

        if !conn.is_lost() {
            if let Err(e) = session.unsubscribe(&subscription.id).await {
                warn!(epoch = conn.epoch(), error = %e, "Failed to unsubscribe");
            }
        }
        outcome
    }

    async fn process_messages(
        &self,
        conn: &EpochConnection,
        frames: &mut mpsc::UnboundedReceiver<Frame>,
    ) -> ConsumeOutcome {
        let closing = self.manager.closing();

        loop {
            let frame = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => return ConsumeOutcome::ConnectionLost,
                },
                _ = closing.cancelled() => {
                    info!("Closing from subscriber received");
                    return ConsumeOutcome::Stopped;
                }
                _ = self.ctx.cancelled() => {
                    info!("Closing from ctx received");
                    return ConsumeOutcome::Stopped;
                }
                _ = conn.lost() => return ConsumeOutcome::ConnectionLost,
            };

            match self.process_message(conn, frame).await {
                Flow::Continue => {}
                Flow::Stop => return ConsumeOutcome::Stopped,
                Flow::Lost => return ConsumeOutcome::ConnectionLost,
            }
        }
    }

    async fn process_message(&self, conn: &EpochConnection, frame: Frame) -> Flow {
        let mut msg = match self.marshaler.decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                error!(
                    message_id = frame.get(header::MESSAGE_ID).unwrap_or_default(),
                    error = %e,
                    "Cannot decode message, skipping"
                );
                return Flow::Continue;
            }
        };

        let scope = self.ctx.child_token();
        msg.set_context(scope.clone());
        let _scope = scope.drop_guard();

        let signal = msg.ack_signal();
        let uuid = msg.uuid.clone();
        let closing = self.manager.closing();
        trace!(message_uuid = %uuid, "Unmarshaled message");

        // the slot frees only when the consumer takes the message
        let handoff = async {
            self.tx.send(msg).await.map_err(drop)?;
            self.tx.reserve().await.map(drop).map_err(drop)
        };

        tokio::select! {
            _ = closing.cancelled() => {
                info!(message_uuid = %uuid, "Message not consumed, pub/sub is closing");
                return self.withdraw(conn, &frame, &uuid, &signal, true).await;
            }
            _ = conn.lost() => {
                signal.nack();
                return Flow::Lost;
            }
            _ = self.ctx.cancelled() => {
                // returned to the broker by unsubscribe, not by NACK
                debug!(message_uuid = %uuid, "Message not consumed, ctx done");
                return self.withdraw(conn, &frame, &uuid, &signal, false).await;
            }
            taken = handoff => {
                if taken.is_err() {
                    debug!(message_uuid = %uuid, "Message not consumed, receiver dropped");
                    return self.withdraw(conn, &frame, &uuid, &signal, true).await;
                }
                trace!(message_uuid = %uuid, "Message taken by consumer");
            }
        }

        tokio::select! {
            biased;

            _ = signal.acked() => {
                trace!(message_uuid = %uuid, "Message acked");
                self.ack(conn, &frame, &uuid).await
            }
            _ = signal.nacked() => {
                trace!(message_uuid = %uuid, "Message nacked");
                self.nack(conn, &frame, &uuid, Flow::Continue).await
            }
            _ = closing.cancelled() => {
                trace!(message_uuid = %uuid, "Closing pub/sub, message discarded before ack");
                self.nack(conn, &frame, &uuid, Flow::Stop).await
            }
            _ = conn.lost() => Flow::Lost,
            _ = self.tx.closed() => {
                debug!(message_uuid = %uuid, "Receiver dropped before settlement");
                self.withdraw(conn, &frame, &uuid, &signal, true).await
            }
        }
    }

    /// Give up on a message and stop. If the consumer acked it first the ACK
    /// still goes out; otherwise it is marked nacked, and `send_nack` decides
    /// whether the broker hears a NACK.
    async fn withdraw(
        &self,
        conn: &EpochConnection,
        frame: &Frame,
        uuid: &str,
        signal: &AckSignal,
        send_nack: bool,
    ) -> Flow {
        if !signal.nack() {
            return match self.ack(conn, frame, uuid).await {
                Flow::Lost => Flow::Lost,
                _ => Flow::Stop,
            };
        }
        if send_nack {
            self.nack(conn, frame, uuid, Flow::Stop).await
        } else {
            Flow::Stop
        }
    }

    async fn ack(&self, conn: &EpochConnection, frame: &Frame, uuid: &str) -> Flow {
        match conn.session().ack(frame).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!(message_uuid = %uuid, error = %e, "Cannot ack message, sending nack");
                self.nack(conn, frame, uuid, Flow::Continue).await
            }
        }
    }

    /// A failed NACK means the broker state is unknown; reconnect unless closing
    async fn nack(&self, conn: &EpochConnection, frame: &Frame, uuid: &str, then: Flow) -> Flow {
        match conn.session().nack(frame).await {
            Ok(()) => then,
            Err(e) if self.manager.closing().is_cancelled() => {
                debug!(message_uuid = %uuid, error = %e, "Cannot nack message during close");
                Flow::Stop
            }
            Err(e) => {
                error!(message_uuid = %uuid, error = %e, "Cannot nack message");
                Flow::Lost
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::marshal::{DefaultMarshaler, MarshalError};
    use crate::naming::QueueNaming;
    use crate::testing::MockBroker;

    async fn subscriber(broker: &MockBroker) -> Subscriber {
        let manager = ConnectionManager::new(
            ConnectionConfig::new("tcp", "mock:61613"),
            broker.connector(),
        )
        .unwrap();
        manager.connect().await.unwrap();
        Subscriber::new(
            Arc::new(manager),
            Arc::new(QueueNaming::TopicName),
            Arc::new(DefaultMarshaler::default()),
        )
        .with_backoff(Duration::from_millis(10))
    }

    async fn recv(rx: &mut Deliveries) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message should arrive")
            .expect("channel open")
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn message_frame(uuid: &str) -> Frame {
        Frame::new("SEND")
            .header(crate::marshal::DEFAULT_MESSAGE_UUID_HEADER_KEY, uuid)
            .body(&b"payload"[..])
    }

    #[tokio::test]
    async fn test_ack_reaches_broker() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker).await;
        let mut rx = subscriber.subscribe(CancellationToken::new(), "orders").unwrap();

        broker.inject("orders", message_frame("m-1"));
        let msg = recv(&mut rx).await;
        assert_eq!(msg.uuid, "m-1");
        msg.ack();

        eventually(|| broker.ack_count() == 1).await;
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers_same_message() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker).await;
        let mut rx = subscriber.subscribe(CancellationToken::new(), "orders").unwrap();

        broker.inject("orders", message_frame("m-1"));
        let first = recv(&mut rx).await;
        first.nack();

        let second = recv(&mut rx).await;
        assert_eq!(second.uuid, "m-1");
        second.ack();
        eventually(|| broker.ack_count() == 1).await;
        assert_eq!(broker.nack_count(), 1);
    }

    #[tokio::test]
    async fn test_message_context_cancelled_after_handling() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker).await;
        let mut rx = subscriber.subscribe(CancellationToken::new(), "orders").unwrap();

        broker.inject("orders", message_frame("m-1"));
        let msg = recv(&mut rx).await;
        let scope = msg.context().clone();
        assert!(!scope.is_cancelled());

        msg.ack();
        tokio::time::timeout(Duration::from_secs(1), scope.cancelled())
            .await
            .expect("scope ends once the message is handled");
    }

    /// Refuses to decode frames carrying a `poison` header
    struct PickyMarshaler;

    impl Marshaler for PickyMarshaler {
        fn encode(&self, msg: &Message) -> Result<Frame, MarshalError> {
            DefaultMarshaler::default().encode(msg)
        }

        fn decode(&self, frame: &Frame) -> Result<Message, MarshalError> {
            if frame.contains("poison") {
                return Err(MarshalError::Other("poisoned frame".into()));
            }
            DefaultMarshaler::default().decode(frame)
        }
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped_without_nack() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker).await;
        let subscriber = Subscriber::new(
            subscriber.manager().clone(),
            Arc::new(QueueNaming::TopicName),
            Arc::new(PickyMarshaler),
        );
        let mut rx = subscriber.subscribe(CancellationToken::new(), "orders").unwrap();

        broker.inject("orders", message_frame("m-1").header("poison", "1"));
        broker.inject("orders", message_frame("m-2"));

        let msg = recv(&mut rx).await;
        assert_eq!(msg.uuid, "m-2");
        msg.ack();

        eventually(|| broker.ack_count() == 1).await;
        assert_eq!(broker.nack_count(), 0);
        assert_eq!(broker.unacked_count(), 1);
    }

    #[tokio::test]
    async fn test_ctx_cancel_closes_channel() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker).await;
        let ctx = CancellationToken::new();
        let mut rx = subscriber.subscribe(ctx.clone(), "orders").unwrap();

        ctx.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel should close");
        assert!(end.is_none());
        eventually(|| subscriber.manager().stats().active_subscriptions == 0).await;
    }

    #[tokio::test]
    async fn test_deliveries_skip_withdrawn_messages() {
        let (tx, rx) = mpsc::channel(2);
        let mut deliveries = Deliveries { rx };

        let withdrawn = Message::new("m-1", "old");
        withdrawn.nack();
        tx.send(withdrawn).await.unwrap();
        tx.send(Message::new("m-2", "new")).await.unwrap();
        drop(tx);

        assert_eq!(deliveries.recv().await.unwrap().uuid, "m-2");
        assert!(deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ctx_cancel_before_pickup_returns_message_without_nack() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker).await;
        let ctx = CancellationToken::new();
        let mut rx = subscriber.subscribe(ctx.clone(), "orders").unwrap();

        broker.inject("orders", message_frame("m-1"));
        eventually(|| broker.unacked_count() == 1).await;
        ctx.cancel();

        let end = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel should close");
        assert!(end.is_none(), "a withdrawn message must not be handed out");
        eventually(|| broker.queued("orders") == 1).await;
        assert_eq!(broker.nack_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_nacks_pending_message() {
        let broker = MockBroker::new();
        let subscriber = subscriber(&broker).await;
        let rx = subscriber.subscribe(CancellationToken::new(), "orders").unwrap();

        broker.inject("orders", message_frame("m-1"));
        drop(rx);

        eventually(|| broker.nack_count() == 1).await;
        eventually(|| subscriber.manager().stats().active_subscriptions == 0).await;
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let broker = MockBroker::new();
        let manager = ConnectionManager::new(
            ConnectionConfig::new("tcp", "mock:61613"),
            broker.connector(),
        )
        .unwrap();
        let subscriber = Subscriber::new(
            Arc::new(manager),
            Arc::new(QueueNaming::TopicName),
            Arc::new(DefaultMarshaler::default()),
        );

        let result = subscriber.subscribe(CancellationToken::new(), "orders");
        assert!(matches!(result, Err(PubSubError::NotConnected { .. })));
    }
}
