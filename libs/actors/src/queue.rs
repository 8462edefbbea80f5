//! Actor Message Queue
//!
//! Per-actor inbox and outbox heaps over the durable state machine. All
//! mutation happens under one mutex: a writer validates the transition,
//! appends it to the WAL and updates the heaps before releasing the lock.
//!
//! ```text
//!            ┌──────────── ActorQueue (per local actor) ─────────────┐
//! inbox ───> │ inbox heap (priority, seq)                            │ ──> execute
//!            │ dst_outbox[dst]            children for any node      │
//!            │ dst_node_outbox[node][dst] children pinned to a node  │ ──> export
//!            └───────────────────────────────────────────────────────┘
//! ```
//!
//! Children leave through `export`, called by the local fetcher or by the
//! exporter on behalf of a downstream node. Housekeeping work (fetch,
//! notify, compaction) is scheduled as messages to the builtin actors.

use crate::error::{ActorError, Result, StateError};
use crate::messages::{AckContent, DstInfo, DstNodeInfo, FetchRequest, NotifyRequest};
use crate::registry::ActorKind;
use crate::state::{ActorState, WalRecord};
use crate::storage::{CompactPlan, DurableState, StorageResult, WalStats};
use actor_config::{QueueSettings, StorageSettings};
use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use types::names::{
    ACTOR_MESSAGE_ACKER, ACTOR_MESSAGE_FETCHER, ACTOR_MESSAGE_NOTIFY_SENDER,
    ACTOR_STORAGE_COMPACTOR, ACTOR_SYSTEM,
};
use types::{
    generate_message_id, unix_now, ActorMessage, MessageStatus, OutboxStatus, TerminalStatus,
    ASK_PRIORITY,
};

/// How long a blocking worker sleeps on the condition variable before
/// re-checking shutdown
const EXECUTE_WAIT: Duration = Duration::from_millis(100);

/// Priority of housekeeping messages
const HOUSEKEEPING_PRIORITY: u32 = ASK_PRIORITY;

/// `(priority, seq, message id)`, popped smallest first
type HeapEntry = Reverse<(u32, u64, String)>;

#[derive(Debug)]
struct ActorQueue {
    kind: ActorKind,
    inbox: BinaryHeap<HeapEntry>,
    dst_outbox: HashMap<String, BinaryHeap<HeapEntry>>,
    dst_node_outbox: HashMap<String, HashMap<String, BinaryHeap<HeapEntry>>>,
    is_fetching: bool,
}

impl ActorQueue {
    fn new(kind: ActorKind) -> Self {
        Self {
            kind,
            inbox: BinaryHeap::new(),
            dst_outbox: HashMap::new(),
            dst_node_outbox: HashMap::new(),
            is_fetching: false,
        }
    }

    fn inbox_size(&self) -> usize {
        self.inbox.len()
    }

    fn queued_outbox_size(&self) -> usize {
        let unpinned: usize = self.dst_outbox.values().map(BinaryHeap::len).sum();
        let pinned: usize = self
            .dst_node_outbox
            .values()
            .flat_map(|by_dst| by_dst.values())
            .map(BinaryHeap::len)
            .sum();
        unpinned + pinned
    }

    fn push_outbox(&mut self, child: &ActorMessage, seq: u64) {
        let entry = Reverse((child.priority, seq, child.id.clone()));
        let heap = match &child.dst_node {
            Some(node) => self
                .dst_node_outbox
                .entry(node.clone())
                .or_default()
                .entry(child.dst.clone())
                .or_default(),
            None => self.dst_outbox.entry(child.dst.clone()).or_default(),
        };
        heap.push(entry);
    }

    fn clear_heaps(&mut self) {
        self.inbox.clear();
        self.dst_outbox.clear();
        self.dst_node_outbox.clear();
    }
}

/// Outbox depth counts children still queued plus finished messages whose
/// ack has not been exported yet
fn outbox_size(queue: &ActorQueue, state: &ActorState, name: &str) -> usize {
    queue.queued_outbox_size() + state.pending_ack_count(name)
}

#[derive(Debug)]
struct QueueInner {
    state: DurableState,
    queues: BTreeMap<String, ActorQueue>,
    seq: u64,
    is_notifying: bool,
    is_compacting: bool,
}

impl QueueInner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Depth of one actor queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorQueueStats {
    pub kind: ActorKind,
    pub inbox_size: usize,
    pub outbox_size: usize,
    pub is_fetching: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub inbox_size: usize,
    pub outbox_size: usize,
    pub active_messages: usize,
    pub completed_messages: usize,
    pub actors: BTreeMap<String, ActorQueueStats>,
    pub wal: Option<WalStats>,
}

/// Mailboxes of every local actor over one durable state
#[derive(Debug)]
pub struct ActorMessageQueue {
    node_name: String,
    settings: QueueSettings,
    storage_settings: StorageSettings,
    inner: Mutex<QueueInner>,
    execute_cond: Condvar,
}

impl ActorMessageQueue {
    pub fn new(
        node_name: impl Into<String>,
        settings: QueueSettings,
        storage_settings: StorageSettings,
        state: DurableState,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            settings,
            storage_settings,
            inner: Mutex::new(QueueInner {
                state,
                queues: BTreeMap::new(),
                seq: 0,
                is_notifying: false,
                is_compacting: false,
            }),
            execute_cond: Condvar::new(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Give `name` a mailbox served by the `kind` worker pool
    pub fn register(&self, name: impl Into<String>, kind: ActorKind) {
        let name = name.into();
        debug!(actor = %name, ?kind, "Queue registered");
        self.inner.lock().queues.insert(name, ActorQueue::new(kind));
    }

    /// Read the state machine under the queue lock
    pub fn with_state<R>(&self, f: impl FnOnce(&ActorState) -> R) -> R {
        f(self.inner.lock().state.state())
    }

    pub fn message_status(&self, message_id: &str) -> Option<MessageStatus> {
        self.with_state(|state| state.get_status(message_id))
    }

    /// Wake every blocked worker, used on shutdown
    pub fn notify_all(&self) {
        self.execute_cond.notify_all();
    }

    fn housekeeping_message<T: Serialize>(
        &self,
        src: &str,
        dst: &str,
        content: &T,
    ) -> Option<ActorMessage> {
        match serde_json::to_vec(content) {
            Ok(content) => Some(
                ActorMessage::new(src, dst, content)
                    .with_id(generate_message_id())
                    .with_src_node(self.node_name.clone())
                    .with_dst_node(self.node_name.clone())
                    .with_priority(HOUSEKEEPING_PRIORITY),
            ),
            Err(e) => {
                warn!(dst, error = %e, "Failed to encode housekeeping message");
                None
            }
        }
    }

    /// Accept a message into the inbox of its destination actor. Expired
    /// messages are dropped.
    pub fn inbox(&self, message: ActorMessage) -> Result<()> {
        let mut inner = self.inner.lock();
        self.inbox_locked(&mut inner, message)?;
        drop(inner);
        self.execute_cond.notify_one();
        Ok(())
    }

    fn inbox_locked(&self, inner: &mut QueueInner, message: ActorMessage) -> Result<()> {
        if message.is_expired(unix_now()) {
            warn!(message_id = %message.id, dst = %message.dst, "Dropping expired message");
            return Ok(());
        }
        if !inner.queues.contains_key(&message.dst) {
            return Err(ActorError::unknown_actor(&message.dst));
        }
        let entry = (message.priority, message.id.clone());
        let dst = message.dst.clone();
        inner.state.apply(WalRecord::Inbox { message })?;
        let seq = inner.next_seq();
        if let Some(queue) = inner.queues.get_mut(&dst) {
            queue.inbox.push(Reverse((entry.0, seq, entry.1)));
        }
        Ok(())
    }

    /// Next message for a blocking worker, waiting until one is ready.
    /// Returns `None` once `shutdown` is set.
    pub fn execute_blocking(&self, shutdown: &AtomicBool) -> Option<ActorMessage> {
        let mut inner = self.inner.lock();
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(message) = self.execute_locked(&mut inner, ActorKind::Blocking) {
                return Some(message);
            }
            self.execute_cond.wait_for(&mut inner, EXECUTE_WAIT);
        }
    }

    /// Next message for a cooperative worker, without waiting
    pub fn try_execute(&self) -> Option<ActorMessage> {
        let mut inner = self.inner.lock();
        self.execute_locked(&mut inner, ActorKind::Cooperative)
    }

    /// Least backed-up actor of `kind` with work: lowest
    /// `priority × outbox_size / outbox_highsize`, then the oldest head
    fn pick_queue(&self, inner: &QueueInner, kind: ActorKind) -> Option<String> {
        let highsize = self.settings.outbox_highsize.max(1);
        let mut best: Option<(f64, u32, u64, &String)> = None;
        for (name, queue) in &inner.queues {
            if queue.kind != kind {
                continue;
            }
            let Some(Reverse((priority, seq, _))) = queue.inbox.peek() else {
                continue;
            };
            let outbox = outbox_size(queue, inner.state.state(), name);
            if outbox >= highsize {
                continue;
            }
            let score = *priority as f64 * (outbox as f64 / highsize as f64);
            let better = match &best {
                None => true,
                Some((best_score, best_priority, best_seq, _)) => {
                    (score, *priority, *seq) < (*best_score, *best_priority, *best_seq)
                }
            };
            if better {
                best = Some((score, *priority, *seq, name));
            }
        }
        best.map(|(_, _, _, name)| name.clone())
    }

    fn execute_locked(&self, inner: &mut QueueInner, kind: ActorKind) -> Option<ActorMessage> {
        loop {
            let name = self.pick_queue(inner, kind)?;
            let Some(Reverse((_, _, message_id))) =
                inner.queues.get_mut(&name).and_then(|q| q.inbox.pop())
            else {
                continue;
            };
            let message = match inner.state.state().get_message(&message_id) {
                Some(message)
                    if inner.state.state().get_status(&message_id) == Some(MessageStatus::Inbox) =>
                {
                    message.clone()
                }
                _ => {
                    debug!(message_id = %message_id, "Skipping stale inbox entry");
                    continue;
                }
            };
            if let Err(e) = inner.state.apply(WalRecord::Execute {
                message_id: message_id.clone(),
            }) {
                warn!(message_id = %message_id, error = %e, "Execute rejected");
                continue;
            }
            if message.is_expired(unix_now()) {
                warn!(message_id = %message_id, dst = %message.dst, "Message expired before execution");
                self.done_locked(inner, &message_id, TerminalStatus::ErrorNotry);
                continue;
            }
            self.schedule_fetch(inner, &name);
            debug!(message_id = %message_id, actor = %name, "Executing");
            return Some(message);
        }
    }

    /// Record the children spawned by `message_id` and queue them
    pub fn outbox(&self, message_id: &str, outbox_messages: Vec<ActorMessage>) -> Result<()> {
        let mut inner = self.inner.lock();
        let dst = inner
            .state
            .state()
            .get_message(message_id)
            .map(|m| m.dst.clone())
            .ok_or_else(|| ActorError::State(StateError::not_found(message_id)))?;
        inner.state.apply(WalRecord::Outbox {
            message_id: message_id.to_string(),
            outbox_messages: outbox_messages.clone(),
        })?;
        for child in &outbox_messages {
            let seq = inner.next_seq();
            if let Some(queue) = inner.queues.get_mut(&dst) {
                queue.push_outbox(child, seq);
            }
        }
        self.schedule_notifier(&mut inner);
        drop(inner);
        self.execute_cond.notify_one();
        Ok(())
    }

    /// Finish a message executed locally
    pub fn done(&self, message_id: &str, status: TerminalStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        let result = self.try_done_locked(&mut inner, message_id, status);
        drop(inner);
        self.execute_cond.notify_one();
        result
    }

    fn done_locked(&self, inner: &mut QueueInner, message_id: &str, status: TerminalStatus) {
        if let Err(e) = self.try_done_locked(inner, message_id, status) {
            warn!(message_id, error = %e, "Done rejected");
        }
    }

    fn try_done_locked(&self, inner: &mut QueueInner, message_id: &str, status: TerminalStatus) -> Result<()> {
        let message = inner
            .state
            .state()
            .get_message(message_id)
            .map(ActorMessage::meta)
            .ok_or_else(|| ActorError::State(StateError::not_found(message_id)))?;
        inner.state.apply(WalRecord::Done {
            message_id: message_id.to_string(),
            status,
        })?;
        match message.dst.as_str() {
            ACTOR_MESSAGE_FETCHER => {
                if let Some(queue) = inner.queues.get_mut(&message.src) {
                    queue.is_fetching = false;
                }
                self.schedule_fetch(inner, &message.src);
            }
            ACTOR_MESSAGE_NOTIFY_SENDER => inner.is_notifying = false,
            ACTOR_STORAGE_COMPACTOR => inner.is_compacting = false,
            _ => {}
        }
        if message.require_ack {
            self.schedule_notifier(inner);
        }
        self.schedule_fetch(inner, &message.dst);
        Ok(())
    }

    /// Take up to `max_count` children for `dst` on behalf of `dst_node`.
    /// For the acker pseudo-destination the finished messages owed to
    /// `dst_node` are drained as ack messages instead.
    pub fn export(&self, dst: &str, dst_node: &str, max_count: usize) -> Vec<ActorMessage> {
        let mut inner = self.inner.lock();
        let exported = if dst == ACTOR_MESSAGE_ACKER {
            self.export_acks(&mut inner, dst_node, max_count)
        } else {
            self.export_children(&mut inner, dst, dst_node, max_count)
        };
        drop(inner);
        if !exported.is_empty() {
            debug!(dst, dst_node, count = exported.len(), "Exported");
            self.execute_cond.notify_all();
        }
        exported
    }

    fn export_acks(&self, inner: &mut QueueInner, src_node: &str, max_count: usize) -> Vec<ActorMessage> {
        let acks = inner.state.state().pending_acks_for(src_node, max_count);
        let mut messages = Vec::with_capacity(acks.len());
        for ack in acks {
            if let Err(e) = inner.state.apply(WalRecord::Complete {
                message_id: ack.message_id.clone(),
                status: None,
            }) {
                warn!(message_id = %ack.message_id, error = %e, "Complete rejected");
                continue;
            }
            let content = match serde_json::to_vec(&AckContent { status: ack.status }) {
                Ok(content) => content,
                Err(e) => {
                    warn!(message_id = %ack.message_id, error = %e, "Failed to encode ack");
                    continue;
                }
            };
            messages.push(
                ActorMessage::new(ack.dst.clone(), ACTOR_MESSAGE_ACKER, content)
                    .with_id(ack.message_id)
                    .with_src_node(self.node_name.clone())
                    .with_dst_node(src_node)
                    .with_priority(HOUSEKEEPING_PRIORITY),
            );
            self.schedule_fetch(inner, &ack.dst);
        }
        messages
    }

    fn pop_child(inner: &mut QueueInner, name: &str, dst: &str, dst_node: &str) -> Option<String> {
        let queue = inner.queues.get_mut(name)?;
        if let Some(heap) = queue
            .dst_node_outbox
            .get_mut(dst_node)
            .and_then(|by_dst| by_dst.get_mut(dst))
        {
            if let Some(Reverse((_, _, id))) = heap.pop() {
                return Some(id);
            }
        }
        queue
            .dst_outbox
            .get_mut(dst)
            .and_then(BinaryHeap::pop)
            .map(|Reverse((_, _, id))| id)
    }

    fn export_children(
        &self,
        inner: &mut QueueInner,
        dst: &str,
        dst_node: &str,
        max_count: usize,
    ) -> Vec<ActorMessage> {
        let now = unix_now();
        let names: Vec<String> = inner.queues.keys().cloned().collect();
        let mut exported = Vec::new();
        for name in names {
            while exported.len() < max_count {
                let Some(child_id) = Self::pop_child(inner, &name, dst, dst_node) else {
                    break;
                };
                let state = inner.state.state();
                let (Some(child), Some(outbox_state)) = (
                    state.get_outbox_message(&child_id).cloned(),
                    state.get_outbox_state(&child_id).cloned(),
                ) else {
                    continue;
                };
                if outbox_state.status != OutboxStatus::Outbox {
                    continue;
                }
                if child.is_expired(now) {
                    warn!(message_id = %child_id, dst, "Outbox message expired before export");
                    self.acked_locked(inner, &child_id, TerminalStatus::ErrorNotry);
                    continue;
                }
                let retry_at = now
                    + self.settings.cycle_time_secs
                    + self.backoff_delay(outbox_state.executed_count);
                if let Err(e) = inner.state.apply(WalRecord::Export {
                    outbox_message_id: child_id.clone(),
                    retry_at: Some(retry_at),
                }) {
                    warn!(message_id = %child_id, error = %e, "Export rejected");
                    continue;
                }
                let mut child = child;
                child.dst_node = Some(dst_node.to_string());
                exported.push(child);
            }
            self.schedule_fetch(inner, &name);
            if exported.len() >= max_count {
                break;
            }
        }
        exported
    }

    /// 8s, 64s, 512s, ... plus up to 8s of jitter, capped
    fn backoff_delay(&self, executed_count: u32) -> f64 {
        let jitter = rand::thread_rng().gen_range(0.0..8.0);
        let exp = 8f64.powi(executed_count.min(16) as i32);
        (exp + jitter).min(self.settings.max_retry_time_secs)
    }

    /// Record the downstream outcome of a child
    pub fn acked(&self, outbox_message_id: &str, status: TerminalStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        let result = self.try_acked_locked(&mut inner, outbox_message_id, status);
        drop(inner);
        self.execute_cond.notify_one();
        result
    }

    fn acked_locked(&self, inner: &mut QueueInner, outbox_message_id: &str, status: TerminalStatus) {
        if let Err(e) = self.try_acked_locked(inner, outbox_message_id, status) {
            warn!(message_id = outbox_message_id, error = %e, "Acked rejected");
        }
    }

    fn try_acked_locked(
        &self,
        inner: &mut QueueInner,
        outbox_message_id: &str,
        status: TerminalStatus,
    ) -> Result<()> {
        let parent_dst = {
            let state = inner.state.state();
            state
                .get_outbox_message(outbox_message_id)
                .and_then(|child| child.parent_id.as_deref())
                .and_then(|parent_id| state.get_message(parent_id))
                .map(|parent| (parent.dst.clone(), parent.require_ack))
        };
        inner.state.apply(WalRecord::Acked {
            outbox_message_id: outbox_message_id.to_string(),
            status,
        })?;
        if let Some((dst, require_ack)) = parent_dst {
            if require_ack {
                self.schedule_notifier(inner);
            }
            self.schedule_fetch(inner, &dst);
        }
        Ok(())
    }

    /// Upstream bookkeeping: `src_node` has (or no longer has) messages for `dst`
    pub fn notify(&self, dst: &str, src_node: &str, available: bool) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.state.apply(WalRecord::Notify {
            dst: dst.to_string(),
            src_node: src_node.to_string(),
            available,
        }) {
            warn!(dst, src_node, error = %e, "Notify rejected");
        }
        self.schedule_fetch(&mut inner, dst);
        drop(inner);
        self.execute_cond.notify_one();
    }

    fn schedule_fetch(&self, inner: &mut QueueInner, name: &str) {
        let upstream = inner.state.state().upstream(name);
        let Some(queue) = inner.queues.get(name) else {
            return;
        };
        if queue.is_fetching || upstream.is_empty() {
            return;
        }
        let inbox_size = queue.inbox_size();
        if outbox_size(queue, inner.state.state(), name) > self.settings.outbox_highsize
            || inbox_size >= self.settings.inbox_lowsize
        {
            return;
        }
        let upstream_list: Vec<String> = upstream
            .choose_multiple(&mut rand::thread_rng(), self.settings.fetcher_concurrency.max(1))
            .cloned()
            .collect();
        let request = FetchRequest {
            actor_name: name.to_string(),
            upstream_list,
            max_count: self.settings.inbox_highsize.saturating_sub(inbox_size).max(1),
        };
        let Some(message) = self.housekeeping_message(name, ACTOR_MESSAGE_FETCHER, &request) else {
            return;
        };
        match self.inbox_locked(inner, message) {
            Ok(()) => {
                if let Some(queue) = inner.queues.get_mut(name) {
                    queue.is_fetching = true;
                }
                debug!(actor = name, upstream = ?request.upstream_list, "Fetch scheduled");
            }
            Err(e) => warn!(actor = name, error = %e, "Failed to schedule fetch"),
        }
    }

    fn schedule_notifier(&self, inner: &mut QueueInner) {
        if inner.is_notifying {
            return;
        }
        let mut dst_info = BTreeSet::new();
        let mut dst_node_info = BTreeSet::new();
        for queue in inner.queues.values() {
            for (dst, heap) in &queue.dst_outbox {
                if !heap.is_empty() {
                    dst_info.insert(DstInfo { dst: dst.clone() });
                }
            }
            for (dst_node, by_dst) in &queue.dst_node_outbox {
                for (dst, heap) in by_dst {
                    if !heap.is_empty() {
                        dst_node_info.insert(DstNodeInfo {
                            dst: dst.clone(),
                            dst_node: dst_node.clone(),
                        });
                    }
                }
            }
        }
        for (src_node, _) in inner.state.state().pending_ack_nodes() {
            dst_node_info.insert(DstNodeInfo {
                dst: ACTOR_MESSAGE_ACKER.to_string(),
                dst_node: src_node,
            });
        }
        let request = NotifyRequest {
            dst_info: dst_info.into_iter().collect(),
            dst_node_info: dst_node_info.into_iter().collect(),
        };
        if request.is_empty() {
            return;
        }
        let Some(message) =
            self.housekeeping_message(ACTOR_SYSTEM, ACTOR_MESSAGE_NOTIFY_SENDER, &request)
        else {
            return;
        };
        match self.inbox_locked(inner, message) {
            Ok(()) => inner.is_notifying = true,
            Err(e) => warn!(error = %e, "Failed to schedule notifier"),
        }
    }

    fn schedule_compactor(&self, inner: &mut QueueInner) {
        if inner.is_compacting
            || !inner.queues.contains_key(ACTOR_STORAGE_COMPACTOR)
            || !inner.state.should_compact(&self.storage_settings)
        {
            return;
        }
        let Some(message) =
            self.housekeeping_message(ACTOR_SYSTEM, ACTOR_STORAGE_COMPACTOR, &serde_json::Value::Null)
        else {
            return;
        };
        match self.inbox_locked(inner, message) {
            Ok(()) => {
                inner.is_compacting = true;
                info!("Storage compaction scheduled");
            }
            Err(e) => warn!(error = %e, "Failed to schedule compactor"),
        }
    }

    /// Retry or give up on children whose ack is overdue. Returns how many
    /// were given up.
    fn check_timeout_and_retry(&self, inner: &mut QueueInner, now: f64) -> usize {
        let max_retry = self.settings.max_retry_count.max(1);
        let overdue: Vec<(String, u32)> = inner
            .state
            .state()
            .outbox_children()
            .into_iter()
            .filter(|(_, s)| matches!(s.status, OutboxStatus::Exported | OutboxStatus::Error))
            .filter(|(_, s)| matches!(s.retry_at, Some(at) if at <= now))
            .map(|(id, s)| (id, s.executed_count))
            .collect();

        let mut given_up = 0;
        for (child_id, executed_count) in overdue {
            let child = inner.state.state().get_outbox_message(&child_id).cloned();
            let Some(child) = child else { continue };
            if executed_count >= max_retry - 1 {
                warn!(message_id = %child_id, executed_count, "Giving up on outbox message");
                self.acked_locked(inner, &child_id, TerminalStatus::ErrorNotry);
                given_up += 1;
                continue;
            }
            if child.is_expired(now) {
                warn!(message_id = %child_id, "Outbox message expired waiting for ack");
                self.acked_locked(inner, &child_id, TerminalStatus::ErrorNotry);
                given_up += 1;
                continue;
            }
            if let Err(e) = inner.state.apply(WalRecord::Retry {
                outbox_message_id: child_id.clone(),
                executed_count: None,
            }) {
                warn!(message_id = %child_id, error = %e, "Retry rejected");
                continue;
            }
            let parent_dst = child
                .parent_id
                .as_deref()
                .and_then(|id| inner.state.state().get_message(id))
                .map(|parent| parent.dst.clone());
            let seq = inner.next_seq();
            if let Some(queue) = parent_dst.and_then(|dst| inner.queues.get_mut(&dst)) {
                queue.push_outbox(&child, seq);
            }
            debug!(message_id = %child_id, attempt = executed_count + 1, "Retrying outbox message");
        }
        given_up
    }

    /// Periodic housekeeping, driven by the message monitor
    pub fn tick(&self, now: f64) {
        let mut inner = self.inner.lock();
        self.schedule_notifier(&mut inner);
        self.schedule_compactor(&mut inner);
        let given_up = self.check_timeout_and_retry(&mut inner, now);
        if given_up > 0 {
            info!(given_up, "Outbox messages given up");
        }
        let names: Vec<String> = inner.queues.keys().cloned().collect();
        for name in names {
            self.schedule_fetch(&mut inner, &name);
        }
        drop(inner);
        self.execute_cond.notify_all();
    }

    /// Fail what was running before a restart and rebuild the heaps from
    /// the recovered state
    pub fn restart(&self) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.state.apply(WalRecord::Restart) {
            warn!(error = %e, "Restart rejected");
        }
        inner.is_notifying = false;
        inner.is_compacting = false;
        for queue in inner.queues.values_mut() {
            queue.clear_heaps();
            queue.is_fetching = false;
        }

        let mut pending: Vec<ActorMessage> = {
            let state = inner.state.state();
            state
                .message_ids_with_status(MessageStatus::Inbox)
                .iter()
                .filter_map(|id| state.get_message(id).cloned())
                .collect()
        };
        pending.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        let mut requeued = 0usize;
        for message in pending {
            if inner.queues.contains_key(&message.dst) {
                let seq = inner.next_seq();
                if let Some(queue) = inner.queues.get_mut(&message.dst) {
                    queue.inbox.push(Reverse((message.priority, seq, message.id.clone())));
                    requeued += 1;
                }
                // a recovered housekeeping message is still in flight
                match message.dst.as_str() {
                    ACTOR_MESSAGE_FETCHER => {
                        if let Some(queue) = inner.queues.get_mut(&message.src) {
                            queue.is_fetching = true;
                        }
                    }
                    ACTOR_MESSAGE_NOTIFY_SENDER => inner.is_notifying = true,
                    ACTOR_STORAGE_COMPACTOR => inner.is_compacting = true,
                    _ => {}
                }
                continue;
            }
            warn!(message_id = %message.id, dst = %message.dst, "No local actor for recovered message");
            if let Err(e) = inner.state.apply(WalRecord::Execute {
                message_id: message.id.clone(),
            }) {
                warn!(message_id = %message.id, error = %e, "Execute rejected");
                continue;
            }
            self.done_locked(&mut inner, &message.id, TerminalStatus::ErrorNotry);
        }

        let parents = inner.state.state().message_ids_with_status(MessageStatus::Outbox);
        let mut requeued_children = 0usize;
        for parent_id in parents {
            let (dst, children) = {
                let state = inner.state.state();
                let Some(parent) = state.get_message(&parent_id) else {
                    continue;
                };
                let children: Vec<ActorMessage> = state
                    .get_state(&parent_id)
                    .map(|s| {
                        s.outbox_states
                            .iter()
                            .filter(|(_, child)| child.status == OutboxStatus::Outbox)
                            .filter_map(|(id, _)| state.get_outbox_message(id).cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                (parent.dst.clone(), children)
            };
            if !inner.queues.contains_key(&dst) {
                warn!(message_id = %parent_id, dst = %dst, "No local actor for recovered outbox");
                self.done_locked(&mut inner, &parent_id, TerminalStatus::ErrorNotry);
                continue;
            }
            for child in children {
                let seq = inner.next_seq();
                if let Some(queue) = inner.queues.get_mut(&dst) {
                    queue.push_outbox(&child, seq);
                    requeued_children += 1;
                }
            }
        }
        info!(
            inbox = requeued,
            outbox = requeued_children,
            active = inner.state.state().active_len(),
            "Queue restarted"
        );
        drop(inner);
        self.execute_cond.notify_all();
    }

    /// Rotate the log and capture the dump, under the lock
    pub fn prepare_compaction(&self) -> Option<StorageResult<CompactPlan>> {
        self.inner.lock().state.prepare_compaction()
    }

    pub fn commit_compaction(&self, plan: &CompactPlan) {
        self.inner.lock().state.commit_compaction(plan);
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let state = inner.state.state();
        let mut actors = BTreeMap::new();
        let mut inbox_total = 0;
        let mut outbox_total = 0;
        for (name, queue) in &inner.queues {
            let inbox_size = queue.inbox_size();
            let outbox = outbox_size(queue, state, name);
            inbox_total += inbox_size;
            outbox_total += outbox;
            actors.insert(
                name.clone(),
                ActorQueueStats {
                    kind: queue.kind,
                    inbox_size,
                    outbox_size: outbox,
                    is_fetching: queue.is_fetching,
                },
            );
        }
        QueueStats {
            inbox_size: inbox_total,
            outbox_size: outbox_total,
            active_messages: state.active_len(),
            completed_messages: state.complete_ring().len(),
            actors,
            wal: inner.state.wal_stats(),
        }
    }
}
