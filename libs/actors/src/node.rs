//! Actor Node
//!
//! Owns every runtime component of one node and wires them together:
//!
//! ```text
//! HttpReceiver ─> NodeInbox ─> ActorMessageQueue <─> Executor workers
//!                                     │                   │
//!                               DurableState         MessageSender ─> HttpSender
//! ```
//!
//! Lifecycle: `new` validates configuration, registers the builtin and user
//! actors and recovers the log. `start` rebuilds the mailboxes, starts the
//! workers, timers, sender and receiver, runs the startup hooks and sends
//! the system message. `shutdown` reverses it.

use crate::builtin::builtin_actors;
use crate::error::{ActorError, Result};
use crate::executor::{Executor, Workers};
use crate::health::{HealthStatus, NodeHealth};
use crate::messages::AckContent;
use crate::queue::ActorMessageQueue;
use crate::registry::{Actor, ActorTable};
use crate::storage::DurableState;
use crate::timer::run_timers;
use actor_config::NodeConfig;
use async_trait::async_trait;
use network::{ActorRegistry, HttpReceiver, HttpSender, InboxHandler, MessageSender, SenderQueue};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::names::{ACTOR_INIT, ACTOR_MESSAGE_ACKER, ACTOR_SYSTEM};
use types::{ActorMessage, NodeSpec, ASK_PRIORITY};

/// How long shutdown waits for the sender to drain
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook run with the node on startup or shutdown
pub type NodeHook = Box<dyn FnOnce(&ActorNode) -> anyhow::Result<()> + Send>;

/// Receiver side of the node: inbound batches and asks
struct NodeInbox {
    executor: Arc<Executor>,
}

#[async_trait]
impl InboxHandler for NodeInbox {
    async fn deliver(&self, messages: Vec<ActorMessage>) -> anyhow::Result<()> {
        if self.executor.status().get() == HealthStatus::Stopping {
            anyhow::bail!("node is stopping");
        }
        let queue = self.executor.queue();
        for message in messages {
            let message = self.executor.registry().complete_message(message);
            if message.dst == ACTOR_MESSAGE_ACKER {
                match message.decode_content::<AckContent>() {
                    Ok(ack) => {
                        if let Err(e) = queue.acked(&message.id, ack.status) {
                            warn!(message_id = %message.id, error = %e, "Ack rejected");
                        }
                    }
                    Err(e) => warn!(message_id = %message.id, error = %e, "Malformed ack"),
                }
                continue;
            }
            let message_id = message.id.clone();
            match queue.inbox(message) {
                Ok(()) => {}
                Err(ActorError::State(e)) => {
                    debug!(message_id = %message_id, error = %e, "Inbound message skipped")
                }
                Err(e) => warn!(message_id = %message_id, error = %e, "Inbound message dropped"),
            }
        }
        Ok(())
    }

    async fn ask(&self, message: ActorMessage) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.executor.ask(message).await?)
    }

    fn health(&self) -> serde_json::Value {
        self.executor.health().to_json()
    }
}

#[derive(Default)]
struct RunningNode {
    workers: Workers,
    sender_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
    receiver_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

pub struct ActorNode {
    config: Arc<NodeConfig>,
    executor: Arc<Executor>,
    sender_queue: Mutex<Option<SenderQueue>>,
    running: Mutex<RunningNode>,
    stop_workers: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    startup_hooks: Mutex<Vec<NodeHook>>,
    shutdown_hooks: Mutex<Vec<NodeHook>>,
}

impl std::fmt::Debug for ActorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorNode")
            .field("name", &self.name())
            .field("status", &self.executor.status().get())
            .finish()
    }
}

impl ActorNode {
    /// Build a node hosting `actors` next to the builtin ones. Must be
    /// called inside a tokio runtime.
    pub fn new(config: NodeConfig, actors: Vec<Actor>) -> Result<Self> {
        config.validate().map_err(ActorError::Config)?;
        let runtime = Handle::try_current().map_err(|e| {
            ActorError::Config(anyhow::anyhow!("actor node needs a tokio runtime: {}", e))
        })?;

        let mut table = ActorTable::new();
        for actor in builtin_actors().into_iter().chain(actors) {
            table.register(actor)?;
        }

        let node_name = config.node_name();
        let current_node = NodeSpec {
            name: node_name.clone(),
            modules: table.modules().into_iter().collect(),
            networks: config.all_networks(),
        };
        let registry = Arc::new(ActorRegistry::new(current_node, config.registry_node.clone()));

        let state = match &config.storage_dir {
            Some(dir) => DurableState::open(dir, config.queue.max_complete_size, config.storage.sync_mode)?,
            None => {
                info!("No storage directory configured, using memory storage");
                DurableState::memory(config.queue.max_complete_size)
            }
        };
        let queue = Arc::new(ActorMessageQueue::new(
            node_name.clone(),
            config.queue.clone(),
            config.storage.clone(),
            state,
        ));
        for actor in table.iter() {
            queue.register(actor.name.clone(), actor.kind());
        }

        let ask_timeout = Duration::from_secs(config.ask_timeout_secs);
        let http = Arc::new(HttpSender::new(
            Arc::clone(&registry),
            config.content_encoding,
            config.token.clone(),
            ask_timeout,
        )?);
        let (sender, sender_queue) = MessageSender::channel(2 * config.concurrency);

        let config = Arc::new(config);
        let executor = Arc::new(Executor::new(
            Arc::clone(&config),
            Arc::new(table),
            queue,
            registry,
            http,
            sender,
            runtime,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        info!(node = %node_name, actors = executor.table().len(), "Actor node created");
        Ok(Self {
            config,
            executor,
            sender_queue: Mutex::new(Some(sender_queue)),
            running: Mutex::new(RunningNode::default()),
            stop_workers: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            startup_hooks: Mutex::new(Vec::new()),
            shutdown_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.executor.registry().current_node_name()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        self.executor.registry()
    }

    pub fn queue(&self) -> &Arc<ActorMessageQueue> {
        self.executor.queue()
    }

    /// Address the receiver is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().local_addr
    }

    pub fn on_startup(&self, hook: impl FnOnce(&ActorNode) -> anyhow::Result<()> + Send + 'static) {
        self.startup_hooks.lock().push(Box::new(hook));
    }

    pub fn on_shutdown(&self, hook: impl FnOnce(&ActorNode) -> anyhow::Result<()> + Send + 'static) {
        self.shutdown_hooks.lock().push(Box::new(hook));
    }

    fn run_hooks(&self, hooks: &Mutex<Vec<NodeHook>>, stage: &str) -> anyhow::Result<()> {
        let hooks: Vec<NodeHook> = std::mem::take(&mut *hooks.lock());
        for hook in hooks {
            hook(self).map_err(|e| e.context(format!("{} hook failed", stage)))?;
        }
        Ok(())
    }

    /// Start every component and return the bound receiver address
    pub async fn start(&self) -> Result<SocketAddr> {
        let sender_queue = self
            .sender_queue
            .lock()
            .take()
            .ok_or_else(|| ActorError::Config(anyhow::anyhow!("actor node already started")))?;

        self.queue().restart();

        let sender_task = tokio::spawn(sender_queue.run(Arc::clone(self.executor.http())));
        let workers = self.executor.start(Arc::clone(&self.stop_workers))?;
        let timer_task = tokio::spawn(run_timers(
            Arc::clone(self.queue()),
            self.executor.table().timers(),
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let receiver = HttpReceiver::new(
            self.config.listen_addr().map_err(ActorError::Config)?,
            self.config.subpath.clone(),
            self.config.token.clone(),
            self.config.content_encoding,
            Arc::new(NodeInbox {
                executor: Arc::clone(&self.executor),
            }),
        )
        .with_max_body_size(self.config.max_body_size);
        let (local_addr, receiver_task) = receiver
            .start(async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            })
            .await?;

        {
            let mut running = self.running.lock();
            running.workers = workers;
            running.sender_task = Some(sender_task);
            running.timer_task = Some(timer_task);
            running.receiver_task = Some(receiver_task);
            running.local_addr = Some(local_addr);
        }
        self.executor.status().set(HealthStatus::Healthy);
        info!(
            node = %self.name(),
            url = %format!("http://{}{}", local_addr, self.config.subpath),
            "Actor node started"
        );
        debug!(nodes = ?self.registry().to_spec(), "Current registry");

        self.run_hooks(&self.startup_hooks, "startup")
            .map_err(ActorError::Config)?;
        self.send_system_message()?;
        Ok(local_addr)
    }

    fn send_system_message(&self) -> Result<()> {
        let message = ActorMessage::new(ACTOR_SYSTEM, ACTOR_SYSTEM, b"null".to_vec())
            .with_src_node(self.name())
            .with_dst_node(self.name())
            .with_priority(ASK_PRIORITY);
        let message = self.registry().complete_message(message);
        self.queue().inbox(message)
    }

    fn client_message<T: Serialize>(&self, dst: &str, content: &T, dst_node: Option<&str>) -> Result<ActorMessage> {
        let mut message = ActorMessage::with_json(ACTOR_INIT, dst, content)?.with_src_node(self.name());
        if let Some(node) = dst_node {
            message = message.with_dst_node(node);
        }
        Ok(message)
    }

    /// Send `content` to `dst` without waiting for the result
    pub async fn tell<T: Serialize>(&self, dst: &str, content: &T) -> Result<()> {
        let message = self.client_message(dst, content, None)?;
        self.executor.submit(message).await
    }

    pub async fn tell_node<T: Serialize>(&self, dst: &str, content: &T, dst_node: &str) -> Result<()> {
        let message = self.client_message(dst, content, Some(dst_node))?;
        self.executor.submit(message).await
    }

    /// Run `dst` with `content` and decode its result
    pub async fn ask<T: Serialize, R: DeserializeOwned>(&self, dst: &str, content: &T) -> Result<R> {
        let message = self.client_message(dst, content, None)?;
        let result = self.executor.ask(message).await?;
        Ok(serde_json::from_slice(result.as_deref().unwrap_or(b"null"))?)
    }

    pub async fn ask_node<T: Serialize, R: DeserializeOwned>(
        &self,
        dst: &str,
        content: &T,
        dst_node: &str,
    ) -> Result<R> {
        let message = self.client_message(dst, content, Some(dst_node))?;
        let result = self.executor.ask(message).await?;
        Ok(serde_json::from_slice(result.as_deref().unwrap_or(b"null"))?)
    }

    pub fn health(&self) -> NodeHealth {
        self.executor.health()
    }

    /// Stop receiving, drain the workers and stop the background tasks
    pub async fn shutdown(&self) -> Result<()> {
        if self.executor.status().get() == HealthStatus::Stopping {
            return Ok(());
        }
        info!(node = %self.name(), "Shutting down actor node");
        self.executor.status().set(HealthStatus::Stopping);
        if let Err(e) = self.run_hooks(&self.shutdown_hooks, "shutdown") {
            warn!(error = %format!("{:#}", e), "Shutdown hook failed");
        }

        // receiver and timers watch this
        self.shutdown_tx.send_replace(true);
        self.stop_workers.store(true, Ordering::SeqCst);
        self.queue().notify_all();

        let running = std::mem::take(&mut *self.running.lock());
        if let Some(task) = running.receiver_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Receiver task failed");
            }
        }
        if let Some(task) = running.timer_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Timer task failed");
            }
        }
        for task in running.workers.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Cooperative worker failed");
            }
        }
        let threads = running.workers.threads;
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                if thread.join().is_err() {
                    warn!("Blocking worker panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "Failed to join blocking workers");
        }
        self.executor.cancel_asks();

        if let Some(mut task) = running.sender_task {
            // the executor keeps a sender handle, so the queue never closes
            if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!(node = %self.name(), "Actor node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ActorContext;

    fn config() -> NodeConfig {
        NodeConfig {
            name: Some("unit".to_string()),
            host: "127.0.0.1".to_string(),
            port: 0,
            concurrency: 4,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_new_requires_runtime() {
        let err = ActorNode::new(config(), Vec::new()).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_new_rejects_builtin_name() {
        let clash = Actor::cooperative(ACTOR_SYSTEM, |_ctx: ActorContext, _: ()| async { Ok(()) });
        let err = ActorNode::new(config(), vec![clash]).unwrap_err();
        assert_eq!(err.category(), "registration");
    }

    #[tokio::test]
    async fn test_registry_advertises_modules() {
        let echo = Actor::blocking("demo.echo", |_ctx: &ActorContext, text: String| Ok(text));
        let node = ActorNode::new(config(), vec![echo]).unwrap();
        let modules = &node.registry().current_node().modules;
        assert!(modules.contains("demo"));
        assert!(modules.contains("actor"));
        assert_eq!(node.registry().find_dst_nodes("demo.echo"), vec!["unit".to_string()]);
    }
}
