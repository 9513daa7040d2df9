//! STOMP client tests against a scripted in-process server
//!
//! The fake server speaks just enough STOMP 1.2 for the client: CONNECTED,
//! receipts, transactions and MESSAGE delivery to one subscription per
//! destination. Every inbound frame is reported to the test.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stomp_pubsub::transport::stomp::StompClient;
use stomp_pubsub::transport::{
    AckMode, ConnectOptions, Frame, Session, StompCodec, StompConnector, TransportError,
};
use stomp_pubsub::{
    ConnectionConfig, ConnectionManager, DefaultMarshaler, Message, Publisher, QueueNaming,
    Subscriber,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Greeting {
    Connected,
    Error,
    Hangup,
}

async fn start_server(greeting: Greeting) -> (String, mpsc::UnboundedReceiver<Frame>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, greeting, seen_tx.clone()));
        }
    });

    (addr, seen_rx)
}

async fn serve(stream: TcpStream, greeting: Greeting, seen: mpsc::UnboundedSender<Frame>) {
    let mut framed = Framed::new(stream, StompCodec::new());
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    let mut transactions: HashMap<String, Vec<Frame>> = HashMap::new();
    let mut next_message = 0u64;

    while let Some(Ok(frame)) = framed.next().await {
        let _ = seen.send(frame.clone());

        let mut deliveries = Vec::new();
        match frame.command.as_str() {
            "CONNECT" | "STOMP" => {
                let reply = match greeting {
                    Greeting::Connected => Frame::new("CONNECTED")
                        .header("version", "1.2")
                        .header("server", "fake/1.0"),
                    Greeting::Error => Frame::new("ERROR")
                        .header("message", "bad credentials")
                        .body(&b"login refused"[..]),
                    Greeting::Hangup => return,
                };
                if framed.send(reply).await.is_err() {
                    return;
                }
                continue;
            }
            "SUBSCRIBE" => {
                let destination = frame.get("destination").unwrap_or_default().to_string();
                let id = frame.get("id").unwrap_or_default().to_string();
                subscriptions.insert(destination, id);
            }
            "BEGIN" => {
                let tx = frame.get("transaction").unwrap_or_default().to_string();
                transactions.insert(tx, Vec::new());
            }
            "SEND" => match frame.get("transaction") {
                Some(tx) => transactions.entry(tx.to_string()).or_default().push(frame.clone()),
                None => deliveries.push(frame.clone()),
            },
            "COMMIT" => {
                let tx = frame.get("transaction").unwrap_or_default();
                deliveries.extend(transactions.remove(tx).unwrap_or_default());
            }
            "ABORT" => {
                let tx = frame.get("transaction").unwrap_or_default();
                transactions.remove(tx);
            }
            _ => {}
        }

        for send in deliveries {
            let destination = send.get("destination").unwrap_or_default().to_string();
            let Some(subscription) = subscriptions.get(&destination) else {
                continue;
            };
            next_message += 1;
            let id = format!("m-{next_message}");
            let mut message = Frame::new("MESSAGE")
                .header("destination", destination.as_str())
                .header("message-id", id.as_str())
                .header("subscription", subscription.as_str())
                .header("ack", id.as_str());
            message.headers.extend(
                send.headers
                    .iter()
                    .filter(|(k, _)| k != "destination" && k != "transaction")
                    .cloned(),
            );
            message.body = send.body.clone();
            if framed.send(message).await.is_err() {
                return;
            }
        }

        if let Some(receipt) = frame.get("receipt") {
            let reply = Frame::new("RECEIPT").header("receipt-id", receipt);
            if framed.send(reply).await.is_err() {
                return;
            }
        }
        if frame.command == "DISCONNECT" {
            return;
        }
    }
}

/// Read reported frames until one with `command` shows up
async fn expect_frame(seen: &mut mpsc::UnboundedReceiver<Frame>, command: &str) -> Frame {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let frame = seen.recv().await.expect("server still running");
            if frame.command == command {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("server never saw {command}"))
}

fn options(addr: &str) -> ConnectOptions {
    ConnectOptions {
        network: "tcp".to_string(),
        addr: addr.to_string(),
        host: None,
        login: Some("guest".to_string()),
        passcode: Some("guest".to_string()),
        timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_connect_handshake() {
    let (addr, mut seen) = start_server(Greeting::Connected).await;

    let client = StompClient::connect(&options(&addr)).await.unwrap();
    assert_eq!(client.server(), Some("fake/1.0"));
    assert!(!client.is_closed());

    let connect = expect_frame(&mut seen, "CONNECT").await;
    assert_eq!(connect.get("accept-version"), Some("1.2"));
    assert_eq!(connect.get("host"), Some("127.0.0.1"));
    assert_eq!(connect.get("login"), Some("guest"));
    assert_eq!(connect.get("passcode"), Some("guest"));
    assert_eq!(connect.get("heart-beat"), Some("0,0"));

    client.disconnect().await.unwrap();
    expect_frame(&mut seen, "DISCONNECT").await;
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_error_frame_rejects_connect() {
    let (addr, _seen) = start_server(Greeting::Error).await;

    let err = match StompClient::connect(&options(&addr)).await {
        Ok(_) => panic!("connect should fail"),
        Err(e) => e,
    };
    match err {
        TransportError::Broker { message, details } => {
            assert_eq!(message, "bad credentials");
            assert_eq!(details, "login refused");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unsupported_network() {
    let mut opts = options("127.0.0.1:1");
    opts.network = "udp".to_string();
    assert!(matches!(
        StompClient::connect(&opts).await,
        Err(TransportError::UnsupportedNetwork(_))
    ));
}

#[tokio::test]
async fn test_server_hangup_fails_connect() {
    let (addr, _seen) = start_server(Greeting::Hangup).await;
    assert!(StompClient::connect(&options(&addr)).await.is_err());
}

#[tokio::test]
async fn test_subscription_receives_messages_and_acks_by_id() {
    let (addr, mut seen) = start_server(Greeting::Connected).await;
    let client = StompClient::connect(&options(&addr)).await.unwrap();

    let mut subscription = client
        .subscribe("/queue/a", AckMode::ClientIndividual)
        .await
        .unwrap();
    let subscribe = expect_frame(&mut seen, "SUBSCRIBE").await;
    assert_eq!(subscribe.get("ack"), Some("client-individual"));
    assert_eq!(subscribe.get("id"), Some(subscription.id.as_str()));

    client
        .send(
            "/queue/a",
            Frame::new("SEND").header("color", "blue\nish").body(&b"hi"[..]),
            None,
        )
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), subscription.frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.get("color"), Some("blue\nish"));
    assert_eq!(&message.body[..], b"hi");

    client.ack(&message).await.unwrap();
    let ack = expect_frame(&mut seen, "ACK").await;
    assert_eq!(ack.get("id"), message.get("ack"));

    client.nack(&message).await.unwrap();
    let nack = expect_frame(&mut seen, "NACK").await;
    assert_eq!(nack.get("id"), message.get("ack"));
}

#[tokio::test]
async fn test_publish_and_consume_through_pubsub_layer() {
    let (addr, mut seen) = start_server(Greeting::Connected).await;

    let manager = Arc::new(
        ConnectionManager::new(ConnectionConfig::new("tcp", addr), Arc::new(StompConnector))
            .unwrap(),
    );
    manager.connect().await.unwrap();

    let marshaler = Arc::new(DefaultMarshaler::default());
    let subscriber = Subscriber::new(
        manager.clone(),
        Arc::new(QueueNaming::with_suffix("q")),
        marshaler.clone(),
    );
    let publisher = Publisher::new(manager.clone(), marshaler);

    let mut rx = subscriber.subscribe(CancellationToken::new(), "orders").unwrap();
    let subscribe = expect_frame(&mut seen, "SUBSCRIBE").await;
    assert_eq!(subscribe.get("destination"), Some("orders_q"));

    let batch = vec![
        Message::new("m-1", "first").with_metadata("region", "eu"),
        Message::new("m-2", "second"),
    ];
    publisher.publish("orders_q", &batch).await.unwrap();

    let begin = expect_frame(&mut seen, "BEGIN").await;
    let tx = begin.get("transaction").unwrap().to_string();
    let send = expect_frame(&mut seen, "SEND").await;
    assert_eq!(send.get("transaction"), Some(tx.as_str()));
    assert_eq!(send.get("_message_uuid"), Some("m-1"));
    let commit = expect_frame(&mut seen, "COMMIT").await;
    assert_eq!(commit.get("transaction"), Some(tx.as_str()));

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.uuid, "m-1");
    assert_eq!(first.metadata.get("region"), Some("eu"));
    assert_eq!(&first.payload[..], b"first");
    first.ack();
    expect_frame(&mut seen, "ACK").await;

    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.uuid, "m-2");
    second.ack();
    expect_frame(&mut seen, "ACK").await;

    manager.close().await.unwrap();
    expect_frame(&mut seen, "DISCONNECT").await;
    assert!(rx.recv().await.is_none());
}
