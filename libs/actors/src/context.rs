//! Actor Context
//!
//! Handed to every handler invocation. Messages told through the context
//! become children of the message being handled: they are recorded with
//! the outcome once the handler returns and delivered by the outbox
//! machinery, so a failed handler never leaks half of its sends.

use crate::error::Result;
use crate::executor::Executor;
use crate::queue::ActorMessageQueue;
use network::ActorRegistry;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use types::{generate_message_id, ActorMessage};

#[derive(Clone)]
pub struct ActorContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    executor: Arc<Executor>,
    /// Message being handled, without content
    message: ActorMessage,
    outbox: Mutex<Vec<ActorMessage>>,
}

fn decode_result<R: DeserializeOwned>(result: Option<Vec<u8>>) -> Result<R> {
    let bytes = result.unwrap_or_else(|| b"null".to_vec());
    Ok(serde_json::from_slice(&bytes)?)
}

impl ActorContext {
    pub(crate) fn new(executor: Arc<Executor>, message: &ActorMessage) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                executor,
                message: message.meta(),
                outbox: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn message(&self) -> &ActorMessage {
        &self.inner.message
    }

    /// Name of the actor handling the message
    pub fn actor_name(&self) -> &str {
        &self.inner.message.dst
    }

    pub fn node_name(&self) -> &str {
        self.inner.executor.registry().current_node_name()
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        self.inner.executor.registry()
    }

    pub fn queue(&self) -> &Arc<ActorMessageQueue> {
        self.inner.executor.queue()
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.inner.executor
    }

    /// Queue `message` as a child of the current message. Id, source and
    /// parent are filled in.
    pub fn emit(&self, mut message: ActorMessage) {
        if message.id.is_empty() {
            message.id = generate_message_id();
        }
        message.src = self.actor_name().to_string();
        message.src_node = self.node_name().to_string();
        message.parent_id = Some(self.inner.message.id.clone());
        self.inner.outbox.lock().push(message);
    }

    /// Reliable send: retried until the destination acks
    pub fn tell<T: Serialize>(&self, dst: &str, content: &T) -> Result<()> {
        let message = ActorMessage::with_json("", dst, content)?.with_require_ack(true);
        self.emit(message);
        Ok(())
    }

    /// Reliable send to one node
    pub fn tell_node<T: Serialize>(&self, dst: &str, content: &T, dst_node: &str) -> Result<()> {
        let message = ActorMessage::with_json("", dst, content)?
            .with_require_ack(true)
            .with_dst_node(dst_node);
        self.emit(message);
        Ok(())
    }

    /// Best-effort send: delivered at most once, never acked
    pub fn hope<T: Serialize>(&self, dst: &str, content: &T) -> Result<()> {
        self.emit(ActorMessage::with_json("", dst, content)?);
        Ok(())
    }

    fn ask_message<T: Serialize>(&self, dst: &str, content: &T, dst_node: Option<&str>) -> Result<ActorMessage> {
        let mut message = ActorMessage::with_json(self.actor_name(), dst, content)?
            .with_src_node(self.node_name())
            .into_ask();
        if let Some(node) = dst_node {
            message = message.with_dst_node(node);
        }
        Ok(message)
    }

    /// Request/response with any node hosting `dst`
    pub async fn ask<T: Serialize, R: DeserializeOwned>(&self, dst: &str, content: &T) -> Result<R> {
        let message = self.ask_message(dst, content, None)?;
        decode_result(self.inner.executor.ask(message).await?)
    }

    pub async fn ask_node<T: Serialize, R: DeserializeOwned>(
        &self,
        dst: &str,
        content: &T,
        dst_node: &str,
    ) -> Result<R> {
        let message = self.ask_message(dst, content, Some(dst_node))?;
        decode_result(self.inner.executor.ask(message).await?)
    }

    /// `ask` for blocking handlers. Must not be called from async code.
    pub fn ask_blocking<T: Serialize, R: DeserializeOwned>(&self, dst: &str, content: &T) -> Result<R> {
        let message = self.ask_message(dst, content, None)?;
        let executor = Arc::clone(&self.inner.executor);
        let result = executor.runtime().block_on(executor.ask(message))?;
        decode_result(result)
    }

    pub(crate) fn take_outbox(&self) -> Vec<ActorMessage> {
        std::mem::take(&mut *self.inner.outbox.lock())
    }
}

impl std::fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContext")
            .field("actor", &self.actor_name())
            .field("message_id", &self.inner.message.id)
            .finish()
    }
}

