//! Message State Machine
//!
//! Tracks every message the node is responsible for, from the moment it
//! lands in a local inbox until the upstream node has been told the outcome.
//!
//! ```text
//! inbox ──execute──> EXECUTING ──done──> OK | ERROR | ERROR_NOTRY ──complete──> ring
//!                        │                      ▲
//!                        └──outbox──> OUTBOX ───┘ (all children resolved)
//!
//! child: OUTBOX ──export──> EXPORTED ──acked──> OK | ERROR | ERROR_NOTRY
//!          ▲                                        │
//!          └──────────────── retry ─────────────────┘ (EXPORTED | ERROR)
//! ```
//!
//! Transitions never read the clock: retry deadlines are computed by the
//! queue and stored as given, so replaying the same records always yields
//! the same state. Every transition is also a `WalRecord`, which is what the
//! write-ahead log stores and what `dump()` produces.

use crate::error::StateError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;
use types::{ActorMessage, MessageStatus, OutboxStatus, TerminalStatus};

pub type StateResult<T> = std::result::Result<T, StateError>;

/// One state transition, as appended to the write-ahead log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    Inbox {
        message: ActorMessage,
    },
    Execute {
        message_id: String,
    },
    Outbox {
        message_id: String,
        outbox_messages: Vec<ActorMessage>,
    },
    Done {
        message_id: String,
        status: TerminalStatus,
    },
    Complete {
        message_id: String,
        status: Option<TerminalStatus>,
    },
    Export {
        outbox_message_id: String,
        retry_at: Option<f64>,
    },
    Acked {
        outbox_message_id: String,
        status: TerminalStatus,
    },
    Retry {
        outbox_message_id: String,
        executed_count: Option<u32>,
    },
    Notify {
        dst: String,
        src_node: String,
        available: bool,
    },
    Restart,
}

impl WalRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            WalRecord::Inbox { .. } => "inbox",
            WalRecord::Execute { .. } => "execute",
            WalRecord::Outbox { .. } => "outbox",
            WalRecord::Done { .. } => "done",
            WalRecord::Complete { .. } => "complete",
            WalRecord::Export { .. } => "export",
            WalRecord::Acked { .. } => "acked",
            WalRecord::Retry { .. } => "retry",
            WalRecord::Notify { .. } => "notify",
            WalRecord::Restart => "restart",
        }
    }
}

/// Delivery state of one child message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxState {
    pub status: OutboxStatus,
    /// Number of retries so far
    pub executed_count: u32,
    pub retry_at: Option<f64>,
}

impl OutboxState {
    fn new() -> Self {
        Self {
            status: OutboxStatus::Outbox,
            executed_count: 0,
            retry_at: None,
        }
    }
}

/// State of one inbox message and its children
#[derive(Debug, Clone, PartialEq)]
pub struct MessageState {
    pub status: MessageStatus,
    pub outbox_states: BTreeMap<String, OutboxState>,
}

impl MessageState {
    fn new(status: MessageStatus) -> Self {
        Self {
            status,
            outbox_states: BTreeMap::new(),
        }
    }
}

/// Bounded record of recently completed message ids, oldest evicted first
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteRing {
    capacity: usize,
    order: VecDeque<String>,
    statuses: HashMap<String, TerminalStatus>,
}

impl CompleteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            statuses: HashMap::new(),
        }
    }

    fn record(&mut self, message_id: &str, status: TerminalStatus) {
        if let Some(current) = self.statuses.get_mut(message_id) {
            *current = status;
            return;
        }
        self.order.push_back(message_id.to_string());
        self.statuses.insert(message_id.to_string(), status);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.statuses.remove(&evicted);
            }
        }
    }

    pub fn get(&self, message_id: &str) -> Option<TerminalStatus> {
        self.statuses.get(message_id).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries oldest first
    pub fn iter(&self) -> impl Iterator<Item = (&str, TerminalStatus)> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.statuses.get(id).map(|status| (id.as_str(), *status)))
    }
}

/// Pending ack drained by the exporter
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAck {
    pub message_id: String,
    pub dst: String,
    pub status: TerminalStatus,
}

/// The state machine
#[derive(Debug, Clone, PartialEq)]
pub struct ActorState {
    states: HashMap<String, MessageState>,
    /// Inbox messages by id, content dropped once executing
    messages: HashMap<String, ActorMessage>,
    /// Child messages by id, kept apart so a local child can reuse its id in
    /// the inbox of its destination
    outbox_messages: HashMap<String, ActorMessage>,
    /// dst -> src_node -> finished message ids waiting for the upstream ack
    done_message_ids: HashMap<String, HashMap<String, BTreeSet<String>>>,
    /// dst -> nodes that announced messages for it
    upstream: HashMap<String, BTreeSet<String>>,
    complete: CompleteRing,
}

impl ActorState {
    pub fn new(max_complete_size: usize) -> Self {
        Self {
            states: HashMap::new(),
            messages: HashMap::new(),
            outbox_messages: HashMap::new(),
            done_message_ids: HashMap::new(),
            upstream: HashMap::new(),
            complete: CompleteRing::new(max_complete_size),
        }
    }

    pub fn get_status(&self, message_id: &str) -> Option<MessageStatus> {
        self.states.get(message_id).map(|s| s.status)
    }

    pub fn get_state(&self, message_id: &str) -> Option<&MessageState> {
        self.states.get(message_id)
    }

    pub fn get_message(&self, message_id: &str) -> Option<&ActorMessage> {
        self.messages.get(message_id)
    }

    pub fn get_outbox_message(&self, outbox_message_id: &str) -> Option<&ActorMessage> {
        self.outbox_messages.get(outbox_message_id)
    }

    pub fn get_outbox_state(&self, outbox_message_id: &str) -> Option<&OutboxState> {
        let child = self.outbox_messages.get(outbox_message_id)?;
        let parent_id = child.parent_id.as_deref()?;
        self.states.get(parent_id)?.outbox_states.get(outbox_message_id)
    }

    pub fn complete_status(&self, message_id: &str) -> Option<TerminalStatus> {
        self.complete.get(message_id)
    }

    pub fn complete_ring(&self) -> &CompleteRing {
        &self.complete
    }

    /// Number of tracked messages, completed ones excluded
    pub fn active_len(&self) -> usize {
        self.states.len()
    }

    pub fn upstream(&self, dst: &str) -> Vec<String> {
        self.upstream
            .get(dst)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Finished messages of `dst` still waiting to be acked upstream
    pub fn pending_ack_count(&self, dst: &str) -> usize {
        self.done_message_ids
            .get(dst)
            .map(|by_node| by_node.values().map(|ids| ids.len()).sum())
            .unwrap_or(0)
    }

    /// `(src_node, dst)` pairs with pending acks
    pub fn pending_ack_nodes(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (dst, by_node) in &self.done_message_ids {
            for (src_node, ids) in by_node {
                if !ids.is_empty() {
                    pairs.push((src_node.clone(), dst.clone()));
                }
            }
        }
        pairs.sort();
        pairs
    }

    /// Up to `max` pending acks owed to `src_node`
    pub fn pending_acks_for(&self, src_node: &str, max: usize) -> Vec<PendingAck> {
        let mut dsts: Vec<&String> = self.done_message_ids.keys().collect();
        dsts.sort();
        let mut acks = Vec::new();
        for dst in dsts {
            let Some(ids) = self.done_message_ids.get(dst).and_then(|m| m.get(src_node)) else {
                continue;
            };
            for id in ids {
                if acks.len() >= max {
                    return acks;
                }
                if let Some(status) = self.get_status(id).and_then(|s| s.terminal()) {
                    acks.push(PendingAck {
                        message_id: id.clone(),
                        dst: dst.clone(),
                        status,
                    });
                }
            }
        }
        acks
    }

    /// Ids of messages in `status`, sorted
    pub fn message_ids_with_status(&self, status: MessageStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| state.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// `(child id, state)` for every child of every OUTBOX message
    pub fn outbox_children(&self) -> Vec<(String, OutboxState)> {
        let mut children = Vec::new();
        for state in self.states.values() {
            if state.status != MessageStatus::Outbox {
                continue;
            }
            for (child_id, outbox_state) in &state.outbox_states {
                children.push((child_id.clone(), outbox_state.clone()));
            }
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    pub fn apply(&mut self, record: &WalRecord) -> StateResult<()> {
        match record {
            WalRecord::Inbox { message } => self.inbox(message.clone()),
            WalRecord::Execute { message_id } => self.execute(message_id),
            WalRecord::Outbox {
                message_id,
                outbox_messages,
            } => self.outbox(message_id, outbox_messages.clone()),
            WalRecord::Done { message_id, status } => self.done(message_id, *status),
            WalRecord::Complete { message_id, status } => self.complete(message_id, *status),
            WalRecord::Export {
                outbox_message_id,
                retry_at,
            } => self.export(outbox_message_id, *retry_at),
            WalRecord::Acked {
                outbox_message_id,
                status,
            } => self.acked(outbox_message_id, *status),
            WalRecord::Retry {
                outbox_message_id,
                executed_count,
            } => self.retry(outbox_message_id, *executed_count),
            WalRecord::Notify {
                dst,
                src_node,
                available,
            } => {
                self.notify(dst, src_node, *available);
                Ok(())
            }
            WalRecord::Restart => {
                self.restart();
                Ok(())
            }
        }
    }

    pub fn notify(&mut self, dst: &str, src_node: &str, available: bool) {
        debug!(dst, src_node, available, "apply notify");
        if available {
            self.upstream
                .entry(dst.to_string())
                .or_default()
                .insert(src_node.to_string());
        } else if let Some(nodes) = self.upstream.get_mut(dst) {
            nodes.remove(src_node);
            if nodes.is_empty() {
                self.upstream.remove(dst);
            }
        }
    }

    /// Validate `record` against the current state without applying it.
    /// A record that passes applies cleanly, which lets the log take it
    /// before the state does.
    pub fn check(&self, record: &WalRecord) -> StateResult<()> {
        match record {
            WalRecord::Inbox { message } => self.check_inbox(message),
            WalRecord::Execute { message_id } => self.check_execute(message_id),
            WalRecord::Outbox {
                message_id,
                outbox_messages,
            } => self.check_outbox(message_id, outbox_messages),
            WalRecord::Done { message_id, .. } => self.check_done(message_id),
            WalRecord::Complete { message_id, status } => match self.states.get(message_id) {
                Some(state) => final_complete_status(message_id, state.status, *status).map(drop),
                None if status.is_some() => Ok(()),
                None => Err(StateError::not_found(message_id)),
            },
            WalRecord::Export {
                outbox_message_id, ..
            } => self.check_export(outbox_message_id).map(drop),
            WalRecord::Acked {
                outbox_message_id,
                status,
            } => self.check_acked(outbox_message_id, *status).map(drop),
            WalRecord::Retry {
                outbox_message_id,
                executed_count,
            } => {
                let parent_id = self.outbox_parent(outbox_message_id, "retry")?;
                let outbox_state = self.outbox_state(&parent_id, outbox_message_id)?;
                retry_count(outbox_message_id, outbox_state, *executed_count).map(drop)
            }
            WalRecord::Notify { .. } | WalRecord::Restart => Ok(()),
        }
    }

    fn check_inbox(&self, message: &ActorMessage) -> StateResult<()> {
        if message.id.is_empty() {
            return Err(StateError::invalid("inbox message without id"));
        }
        if let Some(state) = self.states.get(&message.id) {
            if !state.status.is_error() {
                return Err(StateError::duplicate(&message.id));
            }
        }
        if self.complete.get(&message.id) == Some(TerminalStatus::Ok) {
            return Err(StateError::duplicate(&message.id));
        }
        Ok(())
    }

    pub fn inbox(&mut self, message: ActorMessage) -> StateResult<()> {
        debug!(message_id = %message.id, dst = %message.dst, "apply inbox");
        self.check_inbox(&message)?;
        // redelivery of a failed message replaces it, its old ack is moot
        if let Some(previous) = self.messages.get(&message.id).cloned() {
            self.remove_pending_ack(&previous);
        }
        self.states
            .insert(message.id.clone(), MessageState::new(MessageStatus::Inbox));
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    fn check_execute(&self, message_id: &str) -> StateResult<()> {
        let state = self
            .states
            .get(message_id)
            .ok_or_else(|| StateError::not_found(message_id))?;
        if state.status != MessageStatus::Inbox {
            return Err(StateError::invalid_status(
                message_id,
                "execute",
                state.status,
                "INBOX",
            ));
        }
        Ok(())
    }

    pub fn execute(&mut self, message_id: &str) -> StateResult<()> {
        debug!(message_id, "apply execute");
        self.check_execute(message_id)?;
        if let Some(state) = self.states.get_mut(message_id) {
            state.status = MessageStatus::Executing;
        }
        if let Some(message) = self.messages.get_mut(message_id) {
            message.content = Vec::new();
        }
        Ok(())
    }

    fn check_outbox(&self, message_id: &str, outbox_messages: &[ActorMessage]) -> StateResult<()> {
        if outbox_messages.is_empty() {
            return Err(StateError::invalid(format!(
                "outbox of {} without messages",
                message_id
            )));
        }
        let state = self
            .states
            .get(message_id)
            .ok_or_else(|| StateError::not_found(message_id))?;
        if state.status != MessageStatus::Executing {
            return Err(StateError::invalid_status(
                message_id,
                "outbox",
                state.status,
                "EXECUTING",
            ));
        }
        let mut seen = BTreeSet::new();
        for child in outbox_messages {
            if child.parent_id.as_deref() != Some(message_id) {
                return Err(StateError::invalid(format!(
                    "outbox message {} has parent {:?}, expected {}",
                    child.id, child.parent_id, message_id
                )));
            }
            if child.id.is_empty()
                || !seen.insert(child.id.as_str())
                || self.outbox_messages.contains_key(&child.id)
            {
                return Err(StateError::invalid(format!(
                    "outbox message id {:?} is empty or not unique",
                    child.id
                )));
            }
        }
        Ok(())
    }

    pub fn outbox(&mut self, message_id: &str, outbox_messages: Vec<ActorMessage>) -> StateResult<()> {
        debug!(message_id, count = outbox_messages.len(), "apply outbox");
        self.check_outbox(message_id, &outbox_messages)?;
        let mut outbox_states = BTreeMap::new();
        for child in outbox_messages {
            outbox_states.insert(child.id.clone(), OutboxState::new());
            self.outbox_messages.insert(child.id.clone(), child);
        }
        if let Some(state) = self.states.get_mut(message_id) {
            state.status = MessageStatus::Outbox;
            state.outbox_states = outbox_states;
        }
        Ok(())
    }

    fn check_done(&self, message_id: &str) -> StateResult<()> {
        let state = self
            .states
            .get(message_id)
            .ok_or_else(|| StateError::not_found(message_id))?;
        if !matches!(state.status, MessageStatus::Executing | MessageStatus::Outbox) {
            return Err(StateError::invalid_status(
                message_id,
                "done",
                state.status,
                "EXECUTING or OUTBOX",
            ));
        }
        if !self.messages.contains_key(message_id) {
            return Err(StateError::not_found(message_id));
        }
        Ok(())
    }

    pub fn done(&mut self, message_id: &str, status: TerminalStatus) -> StateResult<()> {
        debug!(message_id, %status, "apply done");
        self.check_done(message_id)?;
        let children = match self.states.get_mut(message_id) {
            Some(state) => {
                state.status = status.into();
                std::mem::take(&mut state.outbox_states)
            }
            None => BTreeMap::new(),
        };
        for child_id in children.keys() {
            self.outbox_messages.remove(child_id);
        }

        let message = self
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| StateError::not_found(message_id))?;
        if message.require_ack {
            self.done_message_ids
                .entry(message.dst.clone())
                .or_default()
                .entry(message.src_node.clone())
                .or_default()
                .insert(message_id.to_string());
            Ok(())
        } else {
            self.complete(message_id, None)
        }
    }

    pub fn complete(&mut self, message_id: &str, status: Option<TerminalStatus>) -> StateResult<()> {
        debug!(message_id, ?status, "apply complete");
        let Some(state) = self.states.get(message_id) else {
            return match status {
                Some(status) => {
                    self.complete.record(message_id, status);
                    Ok(())
                }
                None => Err(StateError::not_found(message_id)),
            };
        };
        let final_status = final_complete_status(message_id, state.status, status)?;

        self.states.remove(message_id);
        if let Some(message) = self.messages.remove(message_id) {
            self.remove_pending_ack(&message);
        }
        self.complete.record(message_id, final_status);
        Ok(())
    }

    fn remove_pending_ack(&mut self, message: &ActorMessage) {
        let Some(by_node) = self.done_message_ids.get_mut(&message.dst) else {
            return;
        };
        if let Some(ids) = by_node.get_mut(&message.src_node) {
            ids.remove(&message.id);
            if ids.is_empty() {
                by_node.remove(&message.src_node);
            }
        }
        if by_node.is_empty() {
            self.done_message_ids.remove(&message.dst);
        }
    }

    /// Resolve a child id to `(parent id, child)` and check the parent is OUTBOX
    fn outbox_parent(&self, outbox_message_id: &str, operation: &'static str) -> StateResult<String> {
        let child = self
            .outbox_messages
            .get(outbox_message_id)
            .ok_or_else(|| StateError::not_found(outbox_message_id))?;
        let parent_id = child
            .parent_id
            .clone()
            .ok_or_else(|| StateError::invalid(format!("outbox message {} has no parent", child.id)))?;
        let parent = self
            .states
            .get(&parent_id)
            .ok_or_else(|| StateError::not_found(&parent_id))?;
        if parent.status != MessageStatus::Outbox {
            return Err(StateError::invalid_status(
                &parent_id,
                operation,
                parent.status,
                "OUTBOX",
            ));
        }
        Ok(parent_id)
    }

    fn outbox_state(&self, parent_id: &str, outbox_message_id: &str) -> StateResult<&OutboxState> {
        self.states
            .get(parent_id)
            .and_then(|state| state.outbox_states.get(outbox_message_id))
            .ok_or_else(|| StateError::not_found(outbox_message_id))
    }

    fn outbox_state_mut(&mut self, parent_id: &str, outbox_message_id: &str) -> StateResult<&mut OutboxState> {
        self.states
            .get_mut(parent_id)
            .and_then(|state| state.outbox_states.get_mut(outbox_message_id))
            .ok_or_else(|| StateError::not_found(outbox_message_id))
    }

    fn check_export(&self, outbox_message_id: &str) -> StateResult<String> {
        let parent_id = self.outbox_parent(outbox_message_id, "export")?;
        let outbox_state = self.outbox_state(&parent_id, outbox_message_id)?;
        if outbox_state.status != OutboxStatus::Outbox {
            return Err(StateError::invalid_status(
                outbox_message_id,
                "export",
                outbox_state.status,
                "OUTBOX",
            ));
        }
        Ok(parent_id)
    }

    pub fn export(&mut self, outbox_message_id: &str, retry_at: Option<f64>) -> StateResult<()> {
        debug!(outbox_message_id, ?retry_at, "apply export");
        let parent_id = self.check_export(outbox_message_id)?;
        let require_ack = self
            .outbox_messages
            .get(outbox_message_id)
            .map(|child| child.require_ack)
            .unwrap_or(false);
        let outbox_state = self.outbox_state_mut(&parent_id, outbox_message_id)?;
        outbox_state.status = OutboxStatus::Exported;
        if require_ack {
            outbox_state.retry_at = retry_at;
            Ok(())
        } else {
            self.acked(outbox_message_id, TerminalStatus::Ok)
        }
    }

    fn check_acked(&self, outbox_message_id: &str, status: TerminalStatus) -> StateResult<String> {
        let parent_id = self.outbox_parent(outbox_message_id, "acked")?;
        let outbox_state = self.outbox_state(&parent_id, outbox_message_id)?;
        let allowed = match outbox_state.status {
            OutboxStatus::Exported => true,
            // expired before it could be exported, or given up after an error
            OutboxStatus::Outbox | OutboxStatus::Error => status == TerminalStatus::ErrorNotry,
            _ => false,
        };
        if !allowed {
            return Err(StateError::invalid_status(
                outbox_message_id,
                "acked",
                outbox_state.status,
                "EXPORTED",
            ));
        }
        Ok(parent_id)
    }

    pub fn acked(&mut self, outbox_message_id: &str, status: TerminalStatus) -> StateResult<()> {
        debug!(outbox_message_id, %status, "apply acked");
        let parent_id = self.check_acked(outbox_message_id, status)?;
        let outbox_state = self.outbox_state_mut(&parent_id, outbox_message_id)?;
        outbox_state.status = status.into();
        if status != TerminalStatus::Error {
            outbox_state.retry_at = None;
        }
        if outbox_state.status.is_resolved() {
            if let Some(child) = self.outbox_messages.get_mut(outbox_message_id) {
                child.content = Vec::new();
            }
        }

        let parent_status = self.states.get(&parent_id).and_then(|state| {
            let children = state.outbox_states.values();
            let mut all_ok = true;
            for child in children {
                if !child.status.is_resolved() {
                    return None;
                }
                all_ok &= child.status == OutboxStatus::Ok;
            }
            Some(if all_ok {
                TerminalStatus::Ok
            } else {
                TerminalStatus::ErrorNotry
            })
        });
        match parent_status {
            Some(status) => self.done(&parent_id, status),
            None => Ok(()),
        }
    }

    pub fn retry(&mut self, outbox_message_id: &str, executed_count: Option<u32>) -> StateResult<()> {
        debug!(outbox_message_id, ?executed_count, "apply retry");
        let parent_id = self.outbox_parent(outbox_message_id, "retry")?;
        let outbox_state = self.outbox_state_mut(&parent_id, outbox_message_id)?;
        let count = retry_count(outbox_message_id, outbox_state, executed_count)?;
        outbox_state.status = OutboxStatus::Outbox;
        outbox_state.executed_count = count;
        outbox_state.retry_at = None;
        Ok(())
    }

    /// Fail everything that was running when the node stopped
    pub fn restart(&mut self) {
        debug!("apply restart");
        for message_id in self.message_ids_with_status(MessageStatus::Executing) {
            if let Err(e) = self.done(&message_id, TerminalStatus::Error) {
                debug!(message_id = %message_id, error = %e, "restart done skipped");
            }
        }
        // nobody is waiting for these answers anymore
        let asks: Vec<String> = self
            .message_ids_with_status(MessageStatus::Inbox)
            .into_iter()
            .filter(|id| self.messages.get(id).map(|m| m.is_ask).unwrap_or(false))
            .collect();
        for message_id in asks {
            if let Err(e) = self.complete(&message_id, Some(TerminalStatus::Error)) {
                debug!(message_id = %message_id, error = %e, "restart complete skipped");
            }
        }
    }

    fn dump_outbox_state(
        &self,
        outbox_message_id: &str,
        outbox_state: &OutboxState,
        records: &mut Vec<WalRecord>,
    ) {
        let require_ack = self
            .outbox_messages
            .get(outbox_message_id)
            .map(|child| child.require_ack)
            .unwrap_or(false);
        if outbox_state.executed_count > 0 {
            records.push(WalRecord::Retry {
                outbox_message_id: outbox_message_id.to_string(),
                executed_count: Some(outbox_state.executed_count),
            });
        }
        let export = |retry_at| WalRecord::Export {
            outbox_message_id: outbox_message_id.to_string(),
            retry_at,
        };
        let acked = |status| WalRecord::Acked {
            outbox_message_id: outbox_message_id.to_string(),
            status,
        };
        match outbox_state.status {
            OutboxStatus::Outbox => {}
            OutboxStatus::Exported => records.push(export(outbox_state.retry_at)),
            OutboxStatus::Ok => {
                records.push(export(None));
                if require_ack {
                    records.push(acked(TerminalStatus::Ok));
                }
            }
            OutboxStatus::Error => {
                records.push(export(outbox_state.retry_at));
                records.push(acked(TerminalStatus::Error));
            }
            OutboxStatus::ErrorNotry => records.push(acked(TerminalStatus::ErrorNotry)),
        }
    }

    /// Minimal records that rebuild an equivalent state in a fresh machine
    pub fn dump(&self) -> Vec<WalRecord> {
        let mut records = Vec::new();
        for (message_id, status) in self.complete.iter() {
            records.push(WalRecord::Complete {
                message_id: message_id.to_string(),
                status: Some(status),
            });
        }

        let mut ids: Vec<&String> = self.states.keys().collect();
        ids.sort();
        for message_id in ids {
            let (Some(state), Some(message)) =
                (self.states.get(message_id), self.messages.get(message_id))
            else {
                continue;
            };
            records.push(WalRecord::Inbox {
                message: message.clone(),
            });
            if state.status == MessageStatus::Inbox {
                continue;
            }
            records.push(WalRecord::Execute {
                message_id: message_id.clone(),
            });
            match state.status {
                MessageStatus::Outbox => {
                    let outbox_messages = state
                        .outbox_states
                        .keys()
                        .filter_map(|id| self.outbox_messages.get(id).cloned())
                        .collect();
                    records.push(WalRecord::Outbox {
                        message_id: message_id.clone(),
                        outbox_messages,
                    });
                    for (child_id, outbox_state) in &state.outbox_states {
                        self.dump_outbox_state(child_id, outbox_state, &mut records);
                    }
                }
                status => {
                    if let Some(terminal) = status.terminal() {
                        records.push(WalRecord::Done {
                            message_id: message_id.clone(),
                            status: terminal,
                        });
                    }
                }
            }
        }

        let mut dsts: Vec<&String> = self.upstream.keys().collect();
        dsts.sort();
        for dst in dsts {
            for src_node in &self.upstream[dst] {
                records.push(WalRecord::Notify {
                    dst: dst.clone(),
                    src_node: src_node.clone(),
                    available: true,
                });
            }
        }
        records
    }

    /// `dump().len()` without cloning any message
    pub fn dump_len(&self) -> usize {
        let mut n = self.complete.len();
        for state in self.states.values() {
            n += match state.status {
                MessageStatus::Inbox => 1,
                MessageStatus::Executing => 2,
                MessageStatus::Ok | MessageStatus::Error | MessageStatus::ErrorNotry => 3,
                MessageStatus::Outbox => {
                    let mut n = 3;
                    for (child_id, child) in &state.outbox_states {
                        let mut records = Vec::new();
                        self.dump_outbox_state(child_id, child, &mut records);
                        n += records.len();
                    }
                    n
                }
            };
        }
        n + self.upstream.values().map(|nodes| nodes.len()).sum::<usize>()
    }
}

/// Status a message is completed with: the explicit one, else its terminal
/// status. Messages still in INBOX need an explicit one.
fn final_complete_status(
    message_id: &str,
    current: MessageStatus,
    status: Option<TerminalStatus>,
) -> StateResult<TerminalStatus> {
    match (current, status) {
        (MessageStatus::Inbox, Some(status)) => Ok(status),
        (MessageStatus::Inbox, None) => Err(StateError::invalid(format!(
            "complete of inbox message {} needs a status",
            message_id
        ))),
        (current, status) => match (current.terminal(), status) {
            (Some(_), Some(status)) => Ok(status),
            (Some(terminal), None) => Ok(terminal),
            (None, _) => Err(StateError::invalid_status(
                message_id,
                "complete",
                current,
                "INBOX or a terminal status",
            )),
        },
    }
}

/// Count a retried child ends up with. Replayed dumps pass it explicitly.
fn retry_count(
    outbox_message_id: &str,
    outbox_state: &OutboxState,
    executed_count: Option<u32>,
) -> StateResult<u32> {
    match executed_count {
        None => {
            if !matches!(outbox_state.status, OutboxStatus::Exported | OutboxStatus::Error) {
                return Err(StateError::invalid_status(
                    outbox_message_id,
                    "retry",
                    outbox_state.status,
                    "EXPORTED or ERROR",
                ));
            }
            Ok(outbox_state.executed_count + 1)
        }
        Some(count) => {
            if outbox_state.status != OutboxStatus::Outbox {
                return Err(StateError::invalid_status(
                    outbox_message_id,
                    "retry",
                    outbox_state.status,
                    "OUTBOX",
                ));
            }
            Ok(count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(id: &str, require_ack: bool) -> ActorMessage {
        ActorMessage::new("demo.src", "demo.dst", b"payload".to_vec())
            .with_id(id)
            .with_src_node("node-a")
            .with_require_ack(require_ack)
    }

    fn child(parent: &str, id: &str, require_ack: bool) -> ActorMessage {
        ActorMessage::new("demo.dst", "demo.next", b"child".to_vec())
            .with_id(id)
            .with_src_node("node-a")
            .with_parent(parent)
            .with_require_ack(require_ack)
    }

    fn replay(records: &[WalRecord]) -> ActorState {
        let mut state = ActorState::new(128);
        for record in records {
            state.apply(record).unwrap();
        }
        state
    }

    #[test]
    fn test_complete_flow_m1_c1() {
        let mut state = ActorState::new(128);
        state.inbox(message("m1", false)).unwrap();
        state.execute("m1").unwrap();
        assert!(state.get_message("m1").unwrap().content.is_empty());

        state.outbox("m1", vec![child("m1", "c1", true)]).unwrap();
        assert_eq!(state.get_status("m1"), Some(MessageStatus::Outbox));

        state.export("c1", Some(1000.0)).unwrap();
        let c1 = state.get_outbox_state("c1").unwrap();
        assert_eq!(c1.status, OutboxStatus::Exported);
        assert_eq!(c1.retry_at, Some(1000.0));

        state.acked("c1", TerminalStatus::Ok).unwrap();
        // parent done OK and completed right away, it needs no ack
        assert_eq!(state.get_status("m1"), None);
        assert_eq!(state.complete_status("m1"), Some(TerminalStatus::Ok));
        assert!(state.get_outbox_message("c1").is_none());
        assert_eq!(state.active_len(), 0);
    }

    #[test]
    fn test_duplicate_inbox() {
        let mut state = ActorState::new(128);
        state.inbox(message("m1", false)).unwrap();
        assert_eq!(
            state.inbox(message("m1", false)),
            Err(StateError::duplicate("m1"))
        );

        state.execute("m1").unwrap();
        state.done("m1", TerminalStatus::Ok).unwrap();
        // completed OK, still remembered by the ring
        assert_eq!(
            state.inbox(message("m1", false)),
            Err(StateError::duplicate("m1"))
        );
    }

    #[test]
    fn test_failed_message_may_be_redelivered() {
        let mut state = ActorState::new(128);
        state.inbox(message("m1", true)).unwrap();
        state.execute("m1").unwrap();
        state.done("m1", TerminalStatus::Error).unwrap();
        assert_eq!(state.pending_ack_count("demo.dst"), 1);

        state.inbox(message("m1", true)).unwrap();
        assert_eq!(state.get_status("m1"), Some(MessageStatus::Inbox));
        assert_eq!(state.pending_ack_count("demo.dst"), 0);
    }

    #[test]
    fn test_require_ack_message_waits_for_complete() {
        let mut state = ActorState::new(128);
        state.inbox(message("m1", true)).unwrap();
        state.execute("m1").unwrap();
        state.done("m1", TerminalStatus::Ok).unwrap();
        assert_eq!(state.get_status("m1"), Some(MessageStatus::Ok));
        assert_eq!(state.pending_ack_nodes(), vec![("node-a".to_string(), "demo.dst".to_string())]);

        let acks = state.pending_acks_for("node-a", 10);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, TerminalStatus::Ok);

        state.complete("m1", None).unwrap();
        assert_eq!(state.get_status("m1"), None);
        assert_eq!(state.pending_ack_count("demo.dst"), 0);
        assert_eq!(state.complete_status("m1"), Some(TerminalStatus::Ok));
    }

    #[test]
    fn test_child_without_ack_never_needs_acked() {
        let mut state = ActorState::new(128);
        state.inbox(message("m1", false)).unwrap();
        state.execute("m1").unwrap();
        state
            .outbox("m1", vec![child("m1", "c1", false), child("m1", "c2", false)])
            .unwrap();
        state.export("c1", Some(5.0)).unwrap();
        assert_eq!(state.get_outbox_state("c1").unwrap().status, OutboxStatus::Ok);
        assert_eq!(state.get_status("m1"), Some(MessageStatus::Outbox));
        state.export("c2", Some(5.0)).unwrap();
        assert_eq!(state.complete_status("m1"), Some(TerminalStatus::Ok));
    }

    #[test]
    fn test_mixed_children_resolve_to_error_notry() {
        let mut state = ActorState::new(128);
        state.inbox(message("m1", true)).unwrap();
        state.execute("m1").unwrap();
        state
            .outbox("m1", vec![child("m1", "c1", true), child("m1", "c2", true)])
            .unwrap();
        state.export("c1", Some(5.0)).unwrap();
        state.acked("c1", TerminalStatus::Ok).unwrap();
        assert!(state.get_outbox_message("c1").unwrap().content.is_empty());

        // c2 expired before export
        state.acked("c2", TerminalStatus::ErrorNotry).unwrap();
        assert_eq!(state.get_status("m1"), Some(MessageStatus::ErrorNotry));
        assert_eq!(state.pending_ack_count("demo.dst"), 1);
    }

    #[test]
    fn test_error_child_keeps_retry_at_and_retries() {
        let mut state = ActorState::new(128);
        state.inbox(message("m1", false)).unwrap();
        state.execute("m1").unwrap();
        state.outbox("m1", vec![child("m1", "c1", true)]).unwrap();
        state.export("c1", Some(42.0)).unwrap();
        state.acked("c1", TerminalStatus::Error).unwrap();

        let c1 = state.get_outbox_state("c1").unwrap();
        assert_eq!(c1.status, OutboxStatus::Error);
        assert_eq!(c1.retry_at, Some(42.0));
        assert_eq!(state.get_status("m1"), Some(MessageStatus::Outbox));

        state.retry("c1", None).unwrap();
        let c1 = state.get_outbox_state("c1").unwrap();
        assert_eq!(c1.status, OutboxStatus::Outbox);
        assert_eq!(c1.executed_count, 1);
        assert_eq!(c1.retry_at, None);

        assert!(matches!(
            state.retry("c1", None),
            Err(StateError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = ActorState::new(128);
        assert_eq!(state.execute("nope"), Err(StateError::not_found("nope")));
        state.inbox(message("m1", false)).unwrap();
        assert!(matches!(
            state.done("m1", TerminalStatus::Ok),
            Err(StateError::InvalidStatus { .. })
        ));
        state.execute("m1").unwrap();
        assert!(matches!(
            state.outbox("m1", vec![]),
            Err(StateError::Invalid { .. })
        ));
        assert!(matches!(
            state.outbox("m1", vec![child("other", "c1", true)]),
            Err(StateError::Invalid { .. })
        ));
        assert!(matches!(
            state.outbox("m1", vec![child("m1", "c1", true), child("m1", "c1", true)]),
            Err(StateError::Invalid { .. })
        ));
        assert!(matches!(
            state.complete("m1", None),
            Err(StateError::InvalidStatus { .. })
        ));
        state.outbox("m1", vec![child("m1", "c1", true)]).unwrap();
        assert!(matches!(
            state.acked("c1", TerminalStatus::Ok),
            Err(StateError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn test_complete_unknown_id_records_ring() {
        let mut state = ActorState::new(2);
        assert_eq!(state.complete("x", None), Err(StateError::not_found("x")));
        state.complete("a", Some(TerminalStatus::Ok)).unwrap();
        state.complete("b", Some(TerminalStatus::Error)).unwrap();
        state.complete("c", Some(TerminalStatus::Ok)).unwrap();
        // capacity 2, the oldest entry is gone
        assert_eq!(state.complete_status("a"), None);
        let ring: Vec<(&str, TerminalStatus)> = state.complete_ring().iter().collect();
        assert_eq!(
            ring,
            vec![("b", TerminalStatus::Error), ("c", TerminalStatus::Ok)]
        );
    }

    #[test]
    fn test_restart() {
        let mut state = ActorState::new(128);
        state.inbox(message("running", true)).unwrap();
        state.execute("running").unwrap();
        state.inbox(message("finished", true)).unwrap();
        state.execute("finished").unwrap();
        state.done("finished", TerminalStatus::Ok).unwrap();
        state
            .inbox(message("ask", false).into_ask())
            .unwrap();
        state.inbox(message("queued", false)).unwrap();

        state.restart();
        assert_eq!(state.get_status("running"), Some(MessageStatus::Error));
        assert_eq!(state.get_status("finished"), Some(MessageStatus::Ok));
        assert_eq!(state.get_status("ask"), None);
        assert_eq!(state.complete_status("ask"), Some(TerminalStatus::Error));
        assert_eq!(state.get_status("queued"), Some(MessageStatus::Inbox));
    }

    #[test]
    fn test_dump_replays_every_child_status() {
        let mut state = ActorState::new(128);
        state.complete("old", Some(TerminalStatus::Ok)).unwrap();
        state.inbox(message("m1", true)).unwrap();
        state.execute("m1").unwrap();
        state
            .outbox(
                "m1",
                vec![
                    child("m1", "c-exported", true),
                    child("m1", "c-error", true),
                    child("m1", "c-notry", true),
                    child("m1", "c-ok", true),
                    child("m1", "c-retried", true),
                    child("m1", "c-waiting", true),
                ],
            )
            .unwrap();
        state.export("c-exported", Some(10.0)).unwrap();
        state.export("c-error", Some(11.0)).unwrap();
        state.acked("c-error", TerminalStatus::Error).unwrap();
        state.acked("c-notry", TerminalStatus::ErrorNotry).unwrap();
        state.export("c-ok", Some(12.0)).unwrap();
        state.acked("c-ok", TerminalStatus::Ok).unwrap();
        state.export("c-retried", Some(13.0)).unwrap();
        state.retry("c-retried", None).unwrap();
        state.export("c-retried", Some(14.0)).unwrap();

        state.inbox(message("m2", true)).unwrap();
        state.execute("m2").unwrap();
        state.done("m2", TerminalStatus::Error).unwrap();
        state.inbox(message("m3", false)).unwrap();
        state.inbox(message("m4", false)).unwrap();
        state.execute("m4").unwrap();
        state.notify("demo.dst", "node-b", true);

        let records = state.dump();
        assert_eq!(records.len(), state.dump_len());
        assert_eq!(replay(&records), state);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Inbox(u8, bool),
        Execute(u8),
        Outbox(u8, u8, bool),
        Done(u8, u8),
        Complete(u8, Option<u8>),
        Export(u8, u8),
        Acked(u8, u8, u8),
        Retry(u8, u8),
        Notify(u8, bool),
        Restart,
    }

    fn status_of(n: u8) -> TerminalStatus {
        match n % 3 {
            0 => TerminalStatus::Ok,
            1 => TerminalStatus::Error,
            _ => TerminalStatus::ErrorNotry,
        }
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, any::<bool>()).prop_map(|(m, ack)| Op::Inbox(m, ack)),
            (0u8..6).prop_map(Op::Execute),
            (0u8..6, 1u8..4, any::<bool>()).prop_map(|(m, n, ack)| Op::Outbox(m, n, ack)),
            (0u8..6, 0u8..3).prop_map(|(m, s)| Op::Done(m, s)),
            (0u8..8, proptest::option::of(0u8..3)).prop_map(|(m, s)| Op::Complete(m, s)),
            (0u8..6, 0u8..3).prop_map(|(m, c)| Op::Export(m, c)),
            (0u8..6, 0u8..3, 0u8..3).prop_map(|(m, c, s)| Op::Acked(m, c, s)),
            (0u8..6, 0u8..3).prop_map(|(m, c)| Op::Retry(m, c)),
            (0u8..3, any::<bool>()).prop_map(|(n, available)| Op::Notify(n, available)),
            Just(Op::Restart),
        ]
    }

    fn run(state: &mut ActorState, op: &Op) {
        let id = |m: &u8| format!("m{}", m);
        let child_id = |m: &u8, c: &u8| format!("m{}-c{}", m, c);
        // rejected transitions are part of the exercise
        let _ = match op {
            Op::Inbox(m, ack) => state.inbox(message(&id(m), *ack)),
            Op::Execute(m) => state.execute(&id(m)),
            Op::Outbox(m, n, ack) => {
                let children = (0..*n)
                    .map(|c| child(&id(m), &child_id(m, &c), *ack || c == 0))
                    .collect();
                state.outbox(&id(m), children)
            }
            Op::Done(m, s) => state.done(&id(m), status_of(*s)),
            Op::Complete(m, s) => state.complete(&id(m), s.map(status_of)),
            Op::Export(m, c) => state.export(&child_id(m, c), Some(100.0 + *c as f64)),
            Op::Acked(m, c, s) => state.acked(&child_id(m, c), status_of(*s)),
            Op::Retry(m, c) => state.retry(&child_id(m, c), None),
            Op::Notify(n, available) => {
                state.notify("demo.dst", &format!("node-{}", n), *available);
                Ok(())
            }
            Op::Restart => {
                state.restart();
                Ok(())
            }
        };
    }

    fn record_of(op: &Op) -> WalRecord {
        let id = |m: &u8| format!("m{}", m);
        let child_id = |m: &u8, c: &u8| format!("m{}-c{}", m, c);
        match op {
            Op::Inbox(m, ack) => WalRecord::Inbox {
                message: message(&id(m), *ack),
            },
            Op::Execute(m) => WalRecord::Execute { message_id: id(m) },
            Op::Outbox(m, n, ack) => WalRecord::Outbox {
                message_id: id(m),
                outbox_messages: (0..*n)
                    .map(|c| child(&id(m), &child_id(m, &c), *ack || c == 0))
                    .collect(),
            },
            Op::Done(m, s) => WalRecord::Done {
                message_id: id(m),
                status: status_of(*s),
            },
            Op::Complete(m, s) => WalRecord::Complete {
                message_id: id(m),
                status: s.map(status_of),
            },
            Op::Export(m, c) => WalRecord::Export {
                outbox_message_id: child_id(m, c),
                retry_at: Some(100.0 + *c as f64),
            },
            Op::Acked(m, c, s) => WalRecord::Acked {
                outbox_message_id: child_id(m, c),
                status: status_of(*s),
            },
            Op::Retry(m, c) => WalRecord::Retry {
                outbox_message_id: child_id(m, c),
                executed_count: None,
            },
            Op::Notify(n, available) => WalRecord::Notify {
                dst: "demo.dst".to_string(),
                src_node: format!("node-{}", n),
                available: *available,
            },
            Op::Restart => WalRecord::Restart,
        }
    }

    proptest! {
        #[test]
        fn prop_dump_replay_is_equivalent(ops in proptest::collection::vec(op_strategy(), 0..80)) {
            let mut state = ActorState::new(4);
            for op in &ops {
                run(&mut state, op);
            }
            let records = state.dump();
            prop_assert_eq!(records.len(), state.dump_len());

            let mut replayed = ActorState::new(4);
            for record in &records {
                prop_assert!(replayed.apply(record).is_ok(), "replay of {:?} failed", record);
            }
            prop_assert_eq!(replayed, state);
        }

        #[test]
        fn prop_check_agrees_with_apply(ops in proptest::collection::vec(op_strategy(), 0..80)) {
            let mut state = ActorState::new(4);
            for op in &ops {
                let record = record_of(op);
                let checked = state.check(&record);
                let before = state.clone();
                let applied = state.apply(&record);
                prop_assert_eq!(checked.is_ok(), applied.is_ok(), "{:?}", record);
                if applied.is_err() {
                    prop_assert_eq!(&state, &before);
                }
            }
        }

        #[test]
        fn prop_max_retry_bounded(attempts in 1u32..10) {
            // the queue gives up once executed_count reaches max_retry_count - 1
            let max_retry_count = 3u32;
            let mut state = ActorState::new(16);
            state.inbox(message("m1", false)).unwrap();
            state.execute("m1").unwrap();
            state.outbox("m1", vec![child("m1", "c1", true)]).unwrap();
            let mut retries = 0;
            for _ in 0..attempts {
                if state.get_outbox_state("c1").is_none() {
                    break;
                }
                state.export("c1", Some(1.0)).unwrap();
                let count = state.get_outbox_state("c1").unwrap().executed_count;
                if count >= max_retry_count - 1 {
                    state.acked("c1", TerminalStatus::ErrorNotry).unwrap();
                } else {
                    state.retry("c1", None).unwrap();
                    retries += 1;
                }
            }
            prop_assert!(retries <= max_retry_count - 1);
        }
    }
}
