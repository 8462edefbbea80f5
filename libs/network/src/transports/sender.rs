//! HTTP Sender
//!
//! Delivers messages to other nodes. Fire-and-forget messages are batched
//! per destination URL and posted to the remote inbox endpoint; asks are a
//! single request whose response carries the handler result.
//!
//! `MessageSender` is the queue in front of `HttpSender`: workers hand
//! messages to it from any thread and a background task drains it in
//! batches.

use crate::discovery::ActorRegistry;
use crate::protocol::{headers, AskHeaders};
use crate::{Result, TransportError};
use codec::ContentEncoding;
use futures::future::join_all;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use types::ActorMessage;

/// Most messages posted in one batch request
pub const MAX_BATCH_SIZE: usize = 100;

/// Sender counters
#[derive(Debug, Default)]
pub struct SenderMetrics {
    pub batches_sent: AtomicU64,
    pub messages_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub asks_sent: AtomicU64,
    pub ask_failures: AtomicU64,
}

/// Snapshot of `SenderMetrics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SenderStats {
    pub batches_sent: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub asks_sent: u64,
    pub ask_failures: u64,
}

impl SenderMetrics {
    pub fn snapshot(&self) -> SenderStats {
        SenderStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            asks_sent: self.asks_sent.load(Ordering::Relaxed),
            ask_failures: self.ask_failures.load(Ordering::Relaxed),
        }
    }
}

/// HTTP client side of the transport
pub struct HttpSender {
    client: reqwest::Client,
    registry: Arc<ActorRegistry>,
    content_encoding: ContentEncoding,
    token: Option<String>,
    ask_timeout: Duration,
    metrics: SenderMetrics,
}

impl HttpSender {
    pub fn new(
        registry: Arc<ActorRegistry>,
        content_encoding: ContentEncoding,
        token: Option<String>,
        ask_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ask_timeout)
            .build()
            .map_err(|e| TransportError::network_with_source("Failed to build HTTP client", e))?;
        Ok(Self {
            client,
            registry,
            content_encoding,
            token: token.filter(|t| !t.is_empty()),
            ask_timeout,
            metrics: SenderMetrics::default(),
        })
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> SenderStats {
        self.metrics.snapshot()
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(url)
            .header(headers::CONTENT_ENCODING, self.content_encoding.as_str());
        if let Some(token) = &self.token {
            request = request.header(headers::TOKEN, token.as_str());
        }
        request
    }

    /// Group messages by destination URL and post every group
    pub async fn send(&self, messages: Vec<ActorMessage>) -> Result<()> {
        let mut groups: HashMap<String, Vec<ActorMessage>> = HashMap::new();
        for message in messages {
            let message = self.registry.complete_message(message);
            let message = match self.registry.resolve_destination(message) {
                Ok(message) => message,
                Err(e) => {
                    self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Dropping message without destination");
                    continue;
                }
            };
            match message.dst_url.clone() {
                Some(url) => groups.entry(url).or_default().push(message),
                None => warn!(
                    message_id = %message.id,
                    dst = %message.dst,
                    "Local message handed to the sender, dropped"
                ),
            }
        }

        let tasks = groups
            .into_iter()
            .map(|(url, items)| async move { (url.clone(), self.send_group(&url, &items).await) });
        let mut first_error = None;
        for (url, result) in join_all(tasks).await {
            if let Err(e) = result {
                self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
                error!(dst_url = %url, error = %e, "Batch delivery failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send_group(&self, url: &str, messages: &[ActorMessage]) -> Result<()> {
        for chunk in messages.chunks(MAX_BATCH_SIZE) {
            debug!(dst_url = %url, count = chunk.len(), "Sending message batch");
            let body = codec::batch_encode(chunk, self.content_encoding)?;
            let response = self.request(url).body(body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(TransportError::remote(status.as_u16(), text));
            }
            self.metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .messages_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Synchronous request to a remote actor, `None` when it returned nothing
    pub async fn ask(&self, message: ActorMessage) -> Result<Option<Vec<u8>>> {
        self.metrics.asks_sent.fetch_add(1, Ordering::Relaxed);
        let result = self.ask_inner(message).await;
        if result.is_err() {
            self.metrics.ask_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn ask_inner(&self, message: ActorMessage) -> Result<Option<Vec<u8>>> {
        let message = self.registry.complete_message(message.into_ask());
        let message = self.registry.resolve_destination(message)?;
        let url = message.dst_url.clone().ok_or_else(|| {
            TransportError::topology(format!("ask to local actor {} sent over HTTP", message.dst))
        })?;
        let ask_headers = AskHeaders::from_message(&message);
        let mut request = self
            .request(&url)
            .body(codec::encode_payload(&message.content, self.content_encoding)?);
        for (name, value) in ask_headers.pairs() {
            request = request.header(name, value);
        }

        debug!(message_id = %message.id, dst = %message.dst, dst_url = %url, "Sending ask");
        let response = tokio::time::timeout(self.ask_timeout, request.send())
            .await
            .map_err(|_| {
                TransportError::timeout(
                    format!("ask {}", message.dst),
                    self.ask_timeout.as_millis() as u64,
                )
            })??;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let encoding = response
            .headers()
            .get(headers::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(TransportError::remote(
                status.as_u16(),
                String::from_utf8_lossy(&body).to_string(),
            ));
        }
        let codec = ContentEncoding::from_header(encoding.as_deref())?;
        Ok(Some(codec::decode_payload(&body, codec)?))
    }
}

/// Queue in front of `HttpSender`, drained by a background task
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<ActorMessage>,
}

/// Receiving end of a `MessageSender`, run it on the runtime to deliver
pub struct SenderQueue {
    rx: mpsc::Receiver<ActorMessage>,
}

impl MessageSender {
    pub fn channel(capacity: usize) -> (Self, SenderQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, SenderQueue { rx })
    }

    /// Queue from async code, waits while the queue is full
    pub async fn submit(&self, message: ActorMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::system("sender stopped"))
    }
}

impl SenderQueue {
    /// Deliver in batches until every `MessageSender` is dropped
    pub async fn run(mut self, sender: Arc<HttpSender>) {
        info!("Message sender started");
        while let Some(first) = self.rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH_SIZE {
                match self.rx.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }
            // failures are counted and logged by send()
            let _ = sender.send(batch).await;
        }
        info!("Message sender stopped");
    }
}
