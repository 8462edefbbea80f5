//! HTTP transport integration tests
//!
//! Runs a real receiver on an ephemeral port and drives it with the sender:
//! batch delivery, the background queue, asks, token rejection and the
//! body size limit.

use async_trait::async_trait;
use codec::ContentEncoding;
use network::{
    ActorRegistry, HttpReceiver, HttpSender, InboxHandler, MessageSender, TransportError,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use types::{ActorMessage, NodeSpec};

const SUBPATH: &str = "/api/v1/actor";

#[derive(Default)]
struct RecordingInbox {
    delivered: Mutex<Vec<ActorMessage>>,
}

#[async_trait]
impl InboxHandler for RecordingInbox {
    async fn deliver(&self, messages: Vec<ActorMessage>) -> anyhow::Result<()> {
        self.delivered.lock().extend(messages);
        Ok(())
    }

    async fn ask(&self, message: ActorMessage) -> anyhow::Result<Option<Vec<u8>>> {
        match message.dst.as_str() {
            "echo.reverse" => {
                let mut content = message.content;
                content.reverse();
                Ok(Some(content))
            }
            "echo.silent" => Ok(None),
            other => anyhow::bail!("no actor {}", other),
        }
    }

    fn health(&self) -> serde_json::Value {
        serde_json::json!({ "status": "ok" })
    }
}

struct TestServer {
    addr: SocketAddr,
    inbox: Arc<RecordingInbox>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server(token: Option<&str>) -> TestServer {
    start_server_with_limit(token, network::DEFAULT_MAX_BODY_SIZE).await
}

async fn start_server_with_limit(token: Option<&str>, max_body_size: usize) -> TestServer {
    let inbox = Arc::new(RecordingInbox::default());
    let (tx, rx) = oneshot::channel::<()>();
    let receiver = HttpReceiver::new(
        "127.0.0.1:0".parse().unwrap(),
        SUBPATH,
        token.map(|t| t.to_string()),
        ContentEncoding::Json,
        inbox.clone(),
    )
    .with_max_body_size(max_body_size);
    let (addr, _handle) = receiver
        .start(async move {
            let _ = rx.await;
        })
        .await
        .unwrap();
    TestServer {
        addr,
        inbox,
        shutdown: Some(tx),
    }
}

fn sender_for(server: &TestServer, encoding: ContentEncoding, token: Option<&str>) -> HttpSender {
    let current = NodeSpec::new("client")
        .with_module("client")
        .with_network("test", "http://127.0.0.1:1/unused");
    let remote = NodeSpec::new("server")
        .with_module("echo")
        .with_network("test", format!("http://{}{}", server.addr, SUBPATH));
    let registry = Arc::new(ActorRegistry::new(current, Some(remote)));
    HttpSender::new(
        registry,
        encoding,
        token.map(|t| t.to_string()),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_batch_delivery_fills_source_fields() {
    let server = start_server(None).await;
    let sender = sender_for(&server, ContentEncoding::BinaryGzip, None);

    let messages = vec![
        ActorMessage::new("client.main", "echo.store", b"one".to_vec()).with_require_ack(true),
        ActorMessage::new("client.main", "echo.store", b"two".to_vec()).with_id("fixed-id"),
    ];
    sender.send(messages).await.unwrap();

    let delivered = server.inbox.delivered.lock().clone();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|m| m.src_node == "client"));
    assert!(delivered.iter().all(|m| m.dst_node.as_deref() == Some("server")));
    assert!(delivered[0].require_ack);
    assert!(!delivered[0].id.is_empty());
    assert_eq!(delivered[1].id, "fixed-id");
    assert_eq!(delivered[1].content, b"two".to_vec());

    let stats = sender.stats();
    assert_eq!(stats.messages_sent, 2);
    assert_eq!(stats.send_failures, 0);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let server = start_server_with_limit(None, 4 * 1024).await;
    let sender = sender_for(&server, ContentEncoding::Json, None);

    let big = vec![ActorMessage::new("client.main", "echo.store", vec![b'x'; 16 * 1024])];
    let err = sender.send(big).await.unwrap_err();
    assert!(matches!(err, TransportError::Remote { status: 413, .. }), "{err:?}");
    assert!(!err.is_retryable());
    assert!(server.inbox.delivered.lock().is_empty());

    let small = vec![ActorMessage::new("client.main", "echo.store", b"ok".to_vec())];
    sender.send(small).await.unwrap();
    assert_eq!(server.inbox.delivered.lock().len(), 1);
}

#[tokio::test]
async fn test_ask_round_trip() {
    let server = start_server(None).await;
    let sender = sender_for(&server, ContentEncoding::Json, None);

    let result = sender
        .ask(ActorMessage::new("client.main", "echo.reverse", b"abc".to_vec()))
        .await
        .unwrap();
    assert_eq!(result, Some(b"cba".to_vec()));

    let empty = sender
        .ask(ActorMessage::new("client.main", "echo.silent", vec![]))
        .await
        .unwrap();
    assert_eq!(empty, None);
}

#[tokio::test]
async fn test_ask_handler_error_is_remote_error() {
    let server = start_server(None).await;
    let sender = sender_for(&server, ContentEncoding::Json, None);

    let err = sender
        .ask(ActorMessage::new("client.main", "echo.missing", vec![]))
        .await
        .unwrap_err();
    match err {
        TransportError::Remote { status, message } => {
            assert_eq!(status, 500);
            assert!(message.contains("echo.missing"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sender.stats().ask_failures, 1);
}

#[tokio::test]
async fn test_token_is_enforced() {
    let server = start_server(Some("secret")).await;

    let anonymous = sender_for(&server, ContentEncoding::Json, None);
    let err = anonymous
        .send(vec![ActorMessage::new("client.main", "echo.store", vec![])])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Remote { status: 401, .. }));
    assert!(server.inbox.delivered.lock().is_empty());

    let trusted = sender_for(&server, ContentEncoding::Json, Some("secret"));
    trusted
        .send(vec![ActorMessage::new("client.main", "echo.store", vec![])])
        .await
        .unwrap();
    assert_eq!(server.inbox.delivered.lock().len(), 1);
}

#[tokio::test]
async fn test_unknown_destination_is_dropped() {
    let server = start_server(None).await;
    let sender = sender_for(&server, ContentEncoding::Json, None);

    sender
        .send(vec![ActorMessage::new("client.main", "nobody.home", vec![])])
        .await
        .unwrap();
    assert!(server.inbox.delivered.lock().is_empty());
    assert_eq!(sender.stats().send_failures, 1);
}

#[tokio::test]
async fn test_message_sender_queue_drains_in_background() {
    let server = start_server(None).await;
    let sender = Arc::new(sender_for(&server, ContentEncoding::Json, None));
    let (queue, drain) = MessageSender::channel(8);
    let handle = tokio::spawn(drain.run(sender.clone()));

    for i in 0..3 {
        queue
            .submit(ActorMessage::new("client.main", "echo.store", vec![i]))
            .await
            .unwrap();
    }
    drop(queue);
    handle.await.unwrap();

    assert_eq!(server.inbox.delivered.lock().len(), 3);
    assert_eq!(sender.stats().messages_sent, 3);
}
