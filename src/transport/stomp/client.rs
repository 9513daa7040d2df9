//! TCP STOMP session
//!
//! One [`StompClient`] is one broker connection. A background reader task
//! routes MESSAGE frames to subscriptions and RECEIPT frames to the requests
//! waiting on them; writes go through a mutex-guarded sink. When the reader
//! stops (EOF, I/O error, ERROR frame) every subscription stream ends and
//! every pending receipt fails with [`TransportError::ConnectionClosed`].

use super::codec::StompCodec;
use super::frame::{command, header, Frame};
use crate::transport::{
    AckMode, ConnectOptions, Connector, Session, SessionSubscription, TransactionId,
    TransportError,
};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

type FramedStream = Framed<TcpStream, StompCodec>;
type ReceiptResult = Result<(), TransportError>;

/// Dials [`StompClient`] sessions
#[derive(Debug, Clone, Default)]
pub struct StompConnector;

#[async_trait]
impl Connector for StompConnector {
    async fn dial(&self, options: &ConnectOptions) -> Result<Arc<dyn Session>, TransportError> {
        let client = StompClient::connect(options).await?;
        Ok(Arc::new(client))
    }
}

/// State shared between the client handle and its reader task
struct Shared {
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>,
    receipts: Mutex<HashMap<String, oneshot::Sender<ReceiptResult>>>,
    closed: CancellationToken,
}

impl Shared {
    fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Route one inbound frame. Returns false when the session must stop.
    fn dispatch(&self, frame: Frame) -> bool {
        match frame.command.as_str() {
            command::MESSAGE => {
                let Some(id) = frame.get(header::SUBSCRIPTION).map(str::to_string) else {
                    warn!("MESSAGE frame without subscription header dropped");
                    return true;
                };
                let sender = lock(&self.subscriptions).get(&id).cloned();
                match sender {
                    Some(tx) => {
                        if tx.send(frame).is_err() {
                            debug!(subscription = %id, "Subscription receiver gone, frame dropped");
                        }
                    }
                    None => debug!(subscription = %id, "MESSAGE for unknown subscription"),
                }
                true
            }
            command::RECEIPT => {
                if let Some(id) = frame.get(header::RECEIPT_ID) {
                    if let Some(tx) = lock(&self.receipts).remove(id) {
                        let _ = tx.send(Ok(()));
                    }
                }
                true
            }
            command::ERROR => {
                let err = broker_error(&frame);
                error!(error = %err, "STOMP broker sent ERROR frame");
                if let Some(id) = frame.get(header::RECEIPT_ID) {
                    if let Some(tx) = lock(&self.receipts).remove(id) {
                        let _ = tx.send(Err(err));
                    }
                }
                false
            }
            other => {
                debug!(command = other, "Ignoring unexpected STOMP frame");
                true
            }
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        lock(&self.subscriptions).clear();
        for (_, tx) in lock(&self.receipts).drain() {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
    }
}

/// Poison-tolerant lock; the guarded maps stay consistent across panics
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn broker_error(frame: &Frame) -> TransportError {
    TransportError::Broker {
        message: frame
            .get(header::MESSAGE)
            .unwrap_or("unspecified broker error")
            .to_string(),
        details: String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

/// Host part of `host:port`, without IPv6 brackets
fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(addr)
        .trim_start_matches('[')
        .trim_end_matches(']')
}

fn accepts_family(network: &str, addr: &SocketAddr) -> bool {
    match network {
        "tcp4" => addr.is_ipv4(),
        "tcp6" => addr.is_ipv6(),
        _ => true,
    }
}

async fn dial_tcp(options: &ConnectOptions) -> Result<TcpStream, TransportError> {
    if !matches!(options.network.as_str(), "tcp" | "tcp4" | "tcp6") {
        return Err(TransportError::UnsupportedNetwork(options.network.clone()));
    }

    let mut last_error = None;
    for addr in lookup_host(options.addr.as_str()).await? {
        if !accepts_family(&options.network, &addr) {
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) => TransportError::Io(e),
        None => TransportError::Rejected(format!(
            "no {} address found for {}",
            options.network, options.addr
        )),
    })
}

async fn read_loop(mut stream: SplitStream<FramedStream>, shared: Arc<Shared>) {
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                trace!(frame = %frame, "STOMP frame received");
                if !shared.dispatch(frame) {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "STOMP read failed");
                break;
            }
            None => {
                debug!("STOMP connection closed by peer");
                break;
            }
        }
    }
    shared.shutdown();
}

/// A connected STOMP 1.2 session
pub struct StompClient {
    writer: tokio::sync::Mutex<SplitSink<FramedStream, Frame>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    receipt_timeout: Duration,
    server: Option<String>,
}

impl StompClient {
    /// Open a TCP connection and complete the CONNECT/CONNECTED handshake
    pub async fn connect(options: &ConnectOptions) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(options.timeout, dial_tcp(options))
            .await
            .map_err(|_| TransportError::Timeout(format!("TCP connect to {}", options.addr)))??;
        let mut framed = Framed::new(stream, StompCodec::new());

        let host = options
            .host
            .clone()
            .unwrap_or_else(|| host_of(&options.addr).to_string());
        let mut connect = Frame::new(command::CONNECT)
            .header(header::ACCEPT_VERSION, "1.2")
            .header(header::HOST, host)
            .header(header::HEART_BEAT, "0,0");
        if let Some(login) = &options.login {
            connect.add_header(header::LOGIN, login.as_str());
        }
        if let Some(passcode) = &options.passcode {
            connect.add_header(header::PASSCODE, passcode.as_str());
        }
        framed.send(connect).await?;

        let reply = tokio::time::timeout(options.timeout, framed.next())
            .await
            .map_err(|_| TransportError::Timeout("CONNECTED frame".to_string()))?;
        let connected = match reply {
            Some(Ok(frame)) if frame.is(command::CONNECTED) => frame,
            Some(Ok(frame)) if frame.is(command::ERROR) => return Err(broker_error(&frame)),
            Some(Ok(frame)) => {
                return Err(TransportError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    frame.command
                )))
            }
            Some(Err(e)) => return Err(e),
            None => return Err(TransportError::ConnectionClosed),
        };

        let server = connected.get("server").map(str::to_string);
        debug!(
            version = connected.get(header::VERSION).unwrap_or("1.0"),
            server = server.as_deref().unwrap_or("unknown"),
            "STOMP session established"
        );

        let (sink, stream) = framed.split();
        let shared = Arc::new(Shared::new());
        tokio::spawn(read_loop(stream, shared.clone()));

        Ok(Self {
            writer: tokio::sync::Mutex::new(sink),
            shared,
            next_id: AtomicU64::new(0),
            receipt_timeout: options.timeout,
            server,
        })
    }

    /// Value of the `server` header from CONNECTED
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        trace!(frame = %frame, "Sending STOMP frame");
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            self.shared.shutdown();
            return Err(e);
        }
        Ok(())
    }

    /// Send `frame` with a receipt header and wait for the matching RECEIPT
    async fn write_with_receipt(&self, frame: Frame) -> Result<(), TransportError> {
        let receipt = format!("rcpt-{}", self.next_id());
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.receipts).insert(receipt.clone(), tx);

        if let Err(e) = self.write(frame.header(header::RECEIPT, receipt.as_str())).await {
            lock(&self.shared.receipts).remove(&receipt);
            return Err(e);
        }

        match tokio::time::timeout(self.receipt_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                lock(&self.shared.receipts).remove(&receipt);
                Err(TransportError::Timeout(format!("receipt {receipt}")))
            }
        }
    }

    fn ack_id(message: &Frame) -> Result<String, TransportError> {
        message
            .get(header::ACK)
            .or_else(|| message.get(header::MESSAGE_ID))
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::Protocol("MESSAGE frame has neither ack nor message-id".to_string())
            })
    }
}

#[async_trait]
impl Session for StompClient {
    async fn send(
        &self,
        destination: &str,
        frame: Frame,
        transaction: Option<&TransactionId>,
    ) -> Result<(), TransportError> {
        let mut send = Frame::new(command::SEND).header(header::DESTINATION, destination);
        if let Some(tx) = transaction {
            send.add_header(header::TRANSACTION, tx.0.as_str());
        }
        send.headers.extend(frame.headers);
        send.body = frame.body;
        self.write(send).await
    }

    async fn begin(&self) -> Result<TransactionId, TransportError> {
        let id = TransactionId(format!("tx-{}", Uuid::new_v4()));
        self.write(Frame::new(command::BEGIN).header(header::TRANSACTION, id.0.as_str()))
            .await?;
        Ok(id)
    }

    async fn commit(&self, transaction: &TransactionId) -> Result<(), TransportError> {
        self.write_with_receipt(
            Frame::new(command::COMMIT).header(header::TRANSACTION, transaction.0.as_str()),
        )
        .await
    }

    async fn abort(&self, transaction: &TransactionId) -> Result<(), TransportError> {
        self.write_with_receipt(
            Frame::new(command::ABORT).header(header::TRANSACTION, transaction.0.as_str()),
        )
        .await
    }

    async fn subscribe(
        &self,
        destination: &str,
        ack_mode: AckMode,
    ) -> Result<SessionSubscription, TransportError> {
        let id = self.next_id().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscriptions).insert(id.clone(), tx);

        let frame = Frame::new(command::SUBSCRIBE)
            .header(header::ID, id.as_str())
            .header(header::DESTINATION, destination)
            .header(header::ACK, ack_mode.as_str());
        if let Err(e) = self.write_with_receipt(frame).await {
            lock(&self.shared.subscriptions).remove(&id);
            return Err(e);
        }

        Ok(SessionSubscription {
            id,
            destination: destination.to_string(),
            frames: rx,
        })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), TransportError> {
        lock(&self.shared.subscriptions).remove(subscription_id);
        self.write(Frame::new(command::UNSUBSCRIBE).header(header::ID, subscription_id))
            .await
    }

    async fn ack(&self, message: &Frame) -> Result<(), TransportError> {
        let id = Self::ack_id(message)?;
        self.write(Frame::new(command::ACK).header(header::ID, id))
            .await
    }

    async fn nack(&self, message: &Frame) -> Result<(), TransportError> {
        let id = Self::ack_id(message)?;
        self.write(Frame::new(command::NACK).header(header::ID, id))
            .await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        let result = self
            .write_with_receipt(Frame::new(command::DISCONNECT))
            .await;
        self.shared.shutdown();
        let _ = self.writer.lock().await.close().await;
        result
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl Drop for StompClient {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}
