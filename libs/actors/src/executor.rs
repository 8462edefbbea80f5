//! Actor Executor
//!
//! Two worker pools drain the queue:
//!
//! - blocking workers: OS threads parked on the queue condition variable,
//!   each running one handler at a time
//! - cooperative workers: tokio tasks polling the queue, spawning handler
//!   futures bounded by a semaphore
//!
//! A handler outcome is recorded the same way for both: children go to the
//! outbox, otherwise the message is done. Local asks are resolved through a
//! oneshot channel keyed by message id.

use crate::context::ActorContext;
use crate::error::{ActorError, Result};
use crate::health::{NodeHealth, NodeStatus};
use crate::queue::ActorMessageQueue;
use crate::registry::{ActorHandler, ActorTable};
use actor_config::NodeConfig;
use dashmap::DashMap;
use futures::FutureExt;
use network::{ActorRegistry, HttpSender, MessageSender};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::{ActorMessage, TerminalStatus};

/// Sleep of an idle cooperative worker
const COOPERATIVE_IDLE: Duration = Duration::from_millis(100);

type AskOutcome = std::result::Result<Option<Vec<u8>>, String>;

/// `(cooperative, blocking)` worker counts for a concurrency level
pub fn pool_sizes(concurrency: usize) -> (usize, usize) {
    let num_cooperative = (concurrency / 30 + 1).min(3);
    let num_blocking = concurrency.saturating_sub(num_cooperative).max(1);
    (num_cooperative, num_blocking)
}

#[derive(Debug, Default)]
struct ExecutorMetrics {
    executed: AtomicU64,
    failed: AtomicU64,
    asks_local: AtomicU64,
    asks_remote: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub concurrency: usize,
    pub num_cooperative_workers: usize,
    pub num_blocking_workers: usize,
    pub executed: u64,
    pub failed: u64,
    pub asks_local: u64,
    pub asks_remote: u64,
    pub pending_asks: usize,
}

/// Worker handles, joined on shutdown
#[derive(Debug, Default)]
pub struct Workers {
    pub threads: Vec<std::thread::JoinHandle<()>>,
    pub tasks: Vec<JoinHandle<()>>,
}

pub struct Executor {
    config: Arc<NodeConfig>,
    table: Arc<ActorTable>,
    queue: Arc<ActorMessageQueue>,
    registry: Arc<ActorRegistry>,
    http: Arc<HttpSender>,
    sender: MessageSender,
    runtime: Handle,
    pending_asks: DashMap<String, oneshot::Sender<AskOutcome>>,
    ask_timeout: Duration,
    num_cooperative: usize,
    num_blocking: usize,
    cooperative_permits: Arc<Semaphore>,
    metrics: ExecutorMetrics,
    status: NodeStatus,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("node", &self.registry.current_node_name())
            .field("num_cooperative", &self.num_cooperative)
            .field("num_blocking", &self.num_blocking)
            .finish()
    }
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        table: Arc<ActorTable>,
        queue: Arc<ActorMessageQueue>,
        registry: Arc<ActorRegistry>,
        http: Arc<HttpSender>,
        sender: MessageSender,
        runtime: Handle,
    ) -> Self {
        let (num_cooperative, num_blocking) = pool_sizes(config.concurrency);
        let permits = (config.concurrency * 10 / num_cooperative).max(10);
        Self {
            ask_timeout: Duration::from_secs(config.ask_timeout_secs),
            config,
            table,
            queue,
            registry,
            http,
            sender,
            runtime,
            pending_asks: DashMap::new(),
            num_cooperative,
            num_blocking,
            cooperative_permits: Arc::new(Semaphore::new(permits)),
            metrics: ExecutorMetrics::default(),
            status: NodeStatus::default(),
        }
    }

    pub fn config(&self) -> &Arc<NodeConfig> {
        &self.config
    }

    pub fn table(&self) -> &Arc<ActorTable> {
        &self.table
    }

    pub fn queue(&self) -> &Arc<ActorMessageQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.registry
    }

    pub fn http(&self) -> &Arc<HttpSender> {
        &self.http
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth::collect(self, &self.status)
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            concurrency: self.config.concurrency,
            num_cooperative_workers: self.num_cooperative,
            num_blocking_workers: self.num_blocking,
            executed: self.metrics.executed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            asks_local: self.metrics.asks_local.load(Ordering::Relaxed),
            asks_remote: self.metrics.asks_remote.load(Ordering::Relaxed),
            pending_asks: self.pending_asks.len(),
        }
    }

    /// Start both pools. Workers stop once `shutdown` is set and the queue
    /// condition variable is notified.
    pub fn start(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<Workers> {
        let mut workers = Workers::default();
        for i in 0..self.num_blocking {
            let executor = Arc::clone(self);
            let shutdown = Arc::clone(&shutdown);
            let thread = std::thread::Builder::new()
                .name(format!("actor-worker-{}", i))
                .spawn(move || executor.blocking_worker(&shutdown))
                .map_err(|e| ActorError::Config(anyhow::anyhow!("failed to spawn worker: {}", e)))?;
            workers.threads.push(thread);
        }
        for i in 0..self.num_cooperative {
            let executor = Arc::clone(self);
            let shutdown = Arc::clone(&shutdown);
            workers
                .tasks
                .push(self.runtime.spawn(executor.cooperative_worker(i, shutdown)));
        }
        info!(
            blocking = self.num_blocking,
            cooperative = self.num_cooperative,
            "Executor started"
        );
        Ok(workers)
    }

    fn blocking_worker(self: Arc<Self>, shutdown: &AtomicBool) {
        debug!("Blocking worker started");
        while let Some(message) = self.queue.execute_blocking(shutdown) {
            self.run_blocking(message);
        }
        debug!("Blocking worker stopped");
    }

    async fn cooperative_worker(self: Arc<Self>, index: usize, shutdown: Arc<AtomicBool>) {
        debug!(worker = index, "Cooperative worker started");
        while !shutdown.load(Ordering::SeqCst) {
            let Some(message) = self.queue.try_execute() else {
                tokio::time::sleep(COOPERATIVE_IDLE).await;
                continue;
            };
            let permit = match Arc::clone(&self.cooperative_permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = Arc::clone(&self);
            tokio::spawn(async move {
                executor.run_cooperative(message).await;
                drop(permit);
            });
        }
        debug!(worker = index, "Cooperative worker stopped");
    }

    fn run_blocking(self: &Arc<Self>, message: ActorMessage) {
        let handler = match self.table.get(&message.dst).map(|a| a.handler.clone()) {
            Some(ActorHandler::Blocking(handler)) => handler,
            _ => {
                self.reject(&message);
                return;
            }
        };
        let ctx = ActorContext::new(Arc::clone(self), &message);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx, &message)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));
        self.finish(&message, ctx.take_outbox(), result);
    }

    async fn run_cooperative(self: Arc<Self>, message: ActorMessage) {
        let handler = match self.table.get(&message.dst).map(|a| a.handler.clone()) {
            Some(ActorHandler::Cooperative(handler)) => handler,
            _ => {
                self.reject(&message);
                return;
            }
        };
        let ctx = ActorContext::new(Arc::clone(&self), &message);
        let result = AssertUnwindSafe(handler(ctx.clone(), message.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));
        self.finish(&message, ctx.take_outbox(), result);
    }

    fn reject(&self, message: &ActorMessage) {
        error!(message_id = %message.id, dst = %message.dst, "No handler of the right kind");
        if let Err(e) = self.queue.done(&message.id, TerminalStatus::ErrorNotry) {
            warn!(message_id = %message.id, error = %e, "Done rejected");
        }
        self.resolve_ask(message, Err(format!("no handler for {}", message.dst)));
    }

    /// Record a handler outcome and resolve a waiting ask
    fn finish(&self, message: &ActorMessage, children: Vec<ActorMessage>, result: anyhow::Result<Vec<u8>>) {
        self.metrics.executed.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(output) => {
                let recorded = if children.is_empty() {
                    self.queue.done(&message.id, TerminalStatus::Ok)
                } else {
                    let count = children.len();
                    self.queue.outbox(&message.id, children).map(|()| {
                        debug!(message_id = %message.id, count, "Children queued");
                    })
                };
                if let Err(e) = recorded {
                    error!(message_id = %message.id, error = %e, "Failed to record handler outcome");
                    if let Err(e) = self.queue.done(&message.id, TerminalStatus::Error) {
                        warn!(message_id = %message.id, error = %e, "Done rejected");
                    }
                }
                let output = (output.as_slice() != b"null").then_some(output);
                self.resolve_ask(message, Ok(output));
            }
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message.id, dst = %message.dst, error = %format!("{:#}", e), "Handler failed");
                if let Err(e) = self.queue.done(&message.id, TerminalStatus::Error) {
                    warn!(message_id = %message.id, error = %e, "Done rejected");
                }
                self.resolve_ask(message, Err(format!("{:#}", e)));
            }
        }
    }

    fn resolve_ask(&self, message: &ActorMessage, outcome: AskOutcome) {
        if !message.is_ask {
            return;
        }
        if let Some((_, tx)) = self.pending_asks.remove(&message.id) {
            // the caller may have timed out already
            let _ = tx.send(outcome);
        }
    }

    /// Deliver `message` to its actor, locally or through the sender
    pub async fn submit(&self, message: ActorMessage) -> Result<()> {
        let message = self.registry.complete_message(message);
        if self.registry.is_local_message(&message) {
            self.queue.inbox(message)
        } else {
            Ok(self.sender.submit(message).await?)
        }
    }

    /// Run `message` as an ask and wait for the handler result
    pub async fn ask(&self, message: ActorMessage) -> Result<Option<Vec<u8>>> {
        let message = self.registry.complete_message(message.into_ask());
        if !self.registry.is_local_message(&message) {
            self.metrics.asks_remote.fetch_add(1, Ordering::Relaxed);
            return Ok(self.http.ask(message).await?);
        }

        self.metrics.asks_local.fetch_add(1, Ordering::Relaxed);
        let message_id = message.id.clone();
        let dst = message.dst.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_asks.insert(message_id.clone(), tx);
        if let Err(e) = self.queue.inbox(message) {
            self.pending_asks.remove(&message_id);
            return Err(e);
        }
        match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(message))) => Err(ActorError::handler(dst, message)),
            Ok(Err(_)) => Err(ActorError::Shutdown),
            Err(_) => {
                self.pending_asks.remove(&message_id);
                Err(ActorError::Timeout {
                    dst,
                    timeout_ms: self.ask_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fail every waiting ask, used on shutdown
    pub fn cancel_asks(&self) {
        self.pending_asks.clear();
    }
}
