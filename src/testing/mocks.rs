//! In-memory broker for testing
//!
//! [`MockBroker`] implements the [`Connector`]/[`Session`] seam without a
//! network. It keeps per-destination queues, buffers transactions until
//! COMMIT, tracks delivered-but-unacknowledged messages and requeues them on
//! NACK or when their session dies. Failure injection switches let tests
//! drive every error path of the pub/sub layer.

use crate::transport::stomp::frame::{command, header};
use crate::transport::{
    AckMode, ConnectOptions, Connector, Frame, Session, SessionSubscription, TransactionId,
    TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Subscriber {
    session_id: u64,
    id: String,
    destination: String,
    tx: mpsc::UnboundedSender<Frame>,
}

struct Unacked {
    seq: u64,
    session_id: u64,
    subscription_id: String,
    destination: String,
    frame: Frame,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Frame>>,
    subscribers: Vec<Subscriber>,
    unacked: HashMap<String, Unacked>,
    transactions: HashMap<String, Vec<(String, Frame)>>,
    sessions: HashMap<u64, CancellationToken>,
    subscribed_destinations: Vec<String>,
    delivered: Vec<(String, Frame)>,
}

#[derive(Default)]
struct Switches {
    fail_dial: AtomicBool,
    fail_send: AtomicBool,
    fail_abort: AtomicBool,
    fail_ack: AtomicBool,
    fail_nack: AtomicBool,
    fail_subscribe: AtomicBool,
}

#[derive(Default)]
struct Counters {
    dials: AtomicU64,
    disconnects: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    switches: Switches,
    counters: Counters,
    send_delay: Mutex<Duration>,
    next_id: AtomicU64,
}

/// Shared handle to one in-memory broker
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn fail_dial(&self, fail: bool) {
        self.inner.switches.fail_dial.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.inner.switches.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_abort(&self, fail: bool) {
        self.inner.switches.fail_abort.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ack(&self, fail: bool) {
        self.inner.switches.fail_ack.store(fail, Ordering::SeqCst);
    }

    pub fn fail_nack(&self, fail: bool) {
        self.inner.switches.fail_nack.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.switches.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every SEND, to keep a publish in flight
    pub fn set_send_delay(&self, delay: Duration) {
        *self
            .inner
            .send_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    fn send_delay(&self) -> Duration {
        *self
            .inner
            .send_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message directly, bypassing sessions and transactions
    pub fn inject(&self, destination: &str, frame: Frame) {
        let mut state = self.state();
        Self::enqueue(&mut state, destination, frame);
        self.dispatch(&mut state, destination);
    }

    /// Drop every live session as if the transport failed
    pub fn kill_sessions(&self) {
        let ids: Vec<u64> = self.state().sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id);
        }
    }

    pub fn dial_count(&self) -> u64 {
        self.inner.counters.dials.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> u64 {
        self.inner.counters.disconnects.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.counters.commits.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> u64 {
        self.inner.counters.aborts.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> u64 {
        self.inner.counters.acks.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> u64 {
        self.inner.counters.nacks.load(Ordering::SeqCst)
    }

    /// Messages waiting for a subscriber on `destination`
    pub fn queued(&self, destination: &str) -> usize {
        self.state()
            .queues
            .get(destination)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// Every MESSAGE frame handed to a subscriber, redeliveries included
    pub fn delivered(&self) -> Vec<(String, Frame)> {
        self.state().delivered.clone()
    }

    /// Destinations named in SUBSCRIBE frames, in order
    pub fn subscribed_destinations(&self) -> Vec<String> {
        self.state().subscribed_destinations.clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    fn enqueue(state: &mut BrokerState, destination: &str, frame: Frame) {
        state
            .queues
            .entry(destination.to_string())
            .or_default()
            .push_back(frame);
    }

    /// Hand queued messages on `destination` to its first live subscriber
    fn dispatch(&self, state: &mut BrokerState, destination: &str) {
        loop {
            let Some(position) = state.subscribers.iter().position(|s| {
                s.destination == destination && !s.tx.is_closed()
            }) else {
                return;
            };
            let Some(frame) = state.queues.get_mut(destination).and_then(VecDeque::pop_front)
            else {
                return;
            };

            let seq = self.next_id();
            let message_id = format!("msg-{seq}");
            let subscriber = &state.subscribers[position];

            let mut message = Frame::new(command::MESSAGE)
                .header(header::DESTINATION, destination)
                .header(header::MESSAGE_ID, message_id.as_str())
                .header(header::SUBSCRIPTION, subscriber.id.as_str())
                .header(header::ACK, message_id.as_str());
            message.headers.extend(
                frame
                    .headers
                    .iter()
                    .filter(|(k, _)| k != header::DESTINATION && k != header::TRANSACTION)
                    .cloned(),
            );
            message.body = frame.body.clone();

            if subscriber.tx.send(message.clone()).is_err() {
                state.subscribers.remove(position);
                Self::requeue(state, destination, vec![frame]);
                continue;
            }

            let session_id = subscriber.session_id;
            let subscription_id = subscriber.id.clone();
            state.delivered.push((destination.to_string(), message));
            state.unacked.insert(
                message_id,
                Unacked {
                    seq,
                    session_id,
                    subscription_id,
                    destination: destination.to_string(),
                    frame,
                },
            );
        }
    }

    /// Put frames back at the head of the queue, preserving their order
    fn requeue(state: &mut BrokerState, destination: &str, frames: Vec<Frame>) {
        let queue = state.queues.entry(destination.to_string()).or_default();
        for frame in frames.into_iter().rev() {
            queue.push_front(frame);
        }
    }

    fn close_session(&self, session_id: u64) {
        let mut state = self.state();
        let Some(token) = state.sessions.remove(&session_id) else {
            return;
        };
        token.cancel();
        state.subscribers.retain(|s| s.session_id != session_id);
        self.requeue_unacked(&mut state, |unacked| unacked.session_id == session_id);
    }

    /// Return matching delivered-but-unacked messages to their queues
    fn requeue_unacked(&self, state: &mut BrokerState, matches: impl Fn(&Unacked) -> bool) {
        let ids: Vec<String> = state
            .unacked
            .iter()
            .filter(|(_, unacked)| matches(unacked))
            .map(|(id, _)| id.clone())
            .collect();
        let mut orphaned: Vec<Unacked> = ids
            .iter()
            .filter_map(|id| state.unacked.remove(id))
            .collect();
        orphaned.sort_by_key(|unacked| unacked.seq);

        let mut by_destination: HashMap<String, Vec<Frame>> = HashMap::new();
        for unacked in orphaned {
            by_destination
                .entry(unacked.destination)
                .or_default()
                .push(unacked.frame);
        }
        for (destination, frames) in by_destination {
            Self::requeue(state, &destination, frames);
            self.dispatch(state, &destination);
        }
    }

    fn take_unacked(&self, message: &Frame) -> Result<Unacked, TransportError> {
        let id = message
            .get(header::ACK)
            .ok_or_else(|| TransportError::Protocol("MESSAGE frame has no ack header".into()))?;
        self.state()
            .unacked
            .remove(id)
            .ok_or_else(|| TransportError::Rejected(format!("unknown message {id}")))
    }
}

struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn dial(&self, _options: &ConnectOptions) -> Result<Arc<dyn Session>, TransportError> {
        let broker = &self.broker;
        broker.inner.counters.dials.fetch_add(1, Ordering::SeqCst);
        if broker.inner.switches.fail_dial.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock broker refused connection",
            )));
        }

        let id = broker.next_id();
        let closed = CancellationToken::new();
        broker.state().sessions.insert(id, closed.clone());

        Ok(Arc::new(MockSession {
            id,
            broker: broker.clone(),
            closed,
        }))
    }
}

/// One session against a [`MockBroker`]
pub struct MockSession {
    id: u64,
    broker: MockBroker,
    closed: CancellationToken,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn switch(&self, flag: &AtomicBool, operation: &str) -> Result<(), TransportError> {
        if flag.load(Ordering::SeqCst) {
            Err(TransportError::Rejected(format!("injected {operation} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn send(
        &self,
        destination: &str,
        frame: Frame,
        transaction: Option<&TransactionId>,
    ) -> Result<(), TransportError> {
        let delay = self.broker.send_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_open()?;
        self.switch(&self.broker.inner.switches.fail_send, "send")?;

        let mut state = self.broker.state();
        match transaction {
            Some(tx) => {
                let buffer = state.transactions.get_mut(&tx.0).ok_or_else(|| {
                    TransportError::Protocol(format!("unknown transaction {tx}"))
                })?;
                buffer.push((destination.to_string(), frame));
            }
            None => {
                MockBroker::enqueue(&mut state, destination, frame);
                self.broker.dispatch(&mut state, destination);
            }
        }
        Ok(())
    }

    async fn begin(&self) -> Result<TransactionId, TransportError> {
        self.ensure_open()?;
        let id = TransactionId(format!("tx-{}", self.broker.next_id()));
        self.broker
            .state()
            .transactions
            .insert(id.0.clone(), Vec::new());
        Ok(id)
    }

    async fn commit(&self, transaction: &TransactionId) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let sends = state
            .transactions
            .remove(&transaction.0)
            .ok_or_else(|| TransportError::Protocol(format!("unknown transaction {transaction}")))?;
        for (destination, frame) in sends {
            MockBroker::enqueue(&mut state, &destination, frame);
            self.broker.dispatch(&mut state, &destination);
        }
        self.broker.inner.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self, transaction: &TransactionId) -> Result<(), TransportError> {
        self.broker.state().transactions.remove(&transaction.0);
        self.broker.inner.counters.aborts.fetch_add(1, Ordering::SeqCst);
        self.switch(&self.broker.inner.switches.fail_abort, "abort")?;
        self.ensure_open()
    }

    async fn subscribe(
        &self,
        destination: &str,
        _ack_mode: AckMode,
    ) -> Result<SessionSubscription, TransportError> {
        self.ensure_open()?;
        self.switch(&self.broker.inner.switches.fail_subscribe, "subscribe")?;

        let id = format!("sub-{}", self.broker.next_id());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.state();
        state.subscribed_destinations.push(destination.to_string());
        state.subscribers.push(Subscriber {
            session_id: self.id,
            id: id.clone(),
            destination: destination.to_string(),
            tx,
        });
        self.broker.dispatch(&mut state, destination);

        Ok(SessionSubscription {
            id,
            destination: destination.to_string(),
            frames: rx,
        })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.subscribers.retain(|s| s.id != subscription_id);
        self.broker
            .requeue_unacked(&mut state, |unacked| unacked.subscription_id == subscription_id);
        Ok(())
    }

    async fn ack(&self, message: &Frame) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.switch(&self.broker.inner.switches.fail_ack, "ack")?;
        self.broker.take_unacked(message)?;
        self.broker.inner.counters.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, message: &Frame) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.switch(&self.broker.inner.switches.fail_nack, "nack")?;
        let unacked = self.broker.take_unacked(message)?;
        self.broker.inner.counters.nacks.fetch_add(1, Ordering::SeqCst);

        let mut state = self.broker.state();
        MockBroker::requeue(&mut state, &unacked.destination, vec![unacked.frame]);
        self.broker.dispatch(&mut state, &unacked.destination);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker
            .inner
            .counters
            .disconnects
            .fetch_add(1, Ordering::SeqCst);
        self.broker.close_session(self.id);
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
