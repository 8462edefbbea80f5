//! Builtin Actors
//!
//! Every node hosts the `actor` module. These handlers drive the pull-based
//! delivery protocol between outboxes and inboxes:
//!
//! ```text
//!  node A (sender)                          node B (receiver)
//!  queue.tick ─> notify_sender ── ask ──>  notify_receiver ─> queue.notify
//!                                                                  │
//!  exporter <──────────────── ask ──────── fetcher <── schedule_fetch
//!     └─ queue.export ─────── messages ──>  queue.inbox / queue.acked
//! ```
//!
//! Local delivery takes the same path without the HTTP hops.

use crate::context::ActorContext;
use crate::error::ActorError;
use crate::messages::{
    AckContent, ExportRequest, ExportResponse, FetchRequest, NotifyReceive, NotifyRequest,
    UpdateRegistry,
};
use crate::registry::Actor;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use types::names::{
    ACTOR_HEALTH, ACTOR_INIT, ACTOR_MESSAGE_ACKER, ACTOR_MESSAGE_EXPORTER, ACTOR_MESSAGE_FETCHER,
    ACTOR_MESSAGE_MONITOR, ACTOR_MESSAGE_NOTIFY_RECEIVER, ACTOR_MESSAGE_NOTIFY_SENDER,
    ACTOR_STORAGE_COMPACTOR, ACTOR_SYSTEM, ACTOR_UPDATE_REGISTRY,
};
use types::{unix_now, ActorMessage, ASK_PRIORITY};

/// Most messages pulled from one upstream node per fetch
pub const MAX_FETCH_SIZE: usize = 100;

/// Interval of the message monitor
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Actors every node registers before its own
pub fn builtin_actors() -> Vec<Actor> {
    vec![
        Actor::cooperative(ACTOR_SYSTEM, system),
        Actor::cooperative(ACTOR_MESSAGE_FETCHER, message_fetcher),
        Actor::cooperative(ACTOR_MESSAGE_EXPORTER, message_exporter),
        Actor::cooperative(ACTOR_MESSAGE_ACKER, message_acker),
        Actor::cooperative(ACTOR_MESSAGE_NOTIFY_SENDER, message_notify_sender),
        Actor::cooperative(ACTOR_MESSAGE_NOTIFY_RECEIVER, message_notify_receiver),
        Actor::cooperative(ACTOR_MESSAGE_MONITOR, message_monitor).with_timer(MONITOR_INTERVAL),
        Actor::blocking(ACTOR_STORAGE_COMPACTOR, storage_compactor),
        Actor::cooperative(ACTOR_HEALTH, health),
        Actor::cooperative(ACTOR_UPDATE_REGISTRY, update_registry),
    ]
}

/// Startup message: hands over to `actor.init` when the node has one
async fn system(ctx: ActorContext, _: ()) -> anyhow::Result<()> {
    if !ctx.executor().table().contains(ACTOR_INIT) {
        return Ok(());
    }
    let message = ActorMessage::new(ACTOR_SYSTEM, ACTOR_INIT, b"null".to_vec())
        .with_src_node(ctx.node_name())
        .with_dst_node(ctx.node_name())
        .with_priority(ASK_PRIORITY);
    ctx.executor().submit(message).await?;
    info!("Init message sent");
    Ok(())
}

async fn export_remote(ctx: &ActorContext, dst: &str, src_node: &str, size: usize) -> Vec<ActorMessage> {
    let request = ExportRequest {
        dst: dst.to_string(),
        max_count: size,
    };
    match ctx
        .ask_node::<_, Option<ExportResponse>>(ACTOR_MESSAGE_EXPORTER, &request, src_node)
        .await
    {
        Ok(response) => response
            .unwrap_or_default()
            .messages
            .into_iter()
            .map(ActorMessage::from)
            .collect(),
        Err(e) => {
            warn!(dst, src_node, error = %e, "Fetch failed");
            Vec::new()
        }
    }
}

/// Pull messages for one local actor from its upstream nodes
async fn message_fetcher(ctx: ActorContext, request: FetchRequest) -> anyhow::Result<()> {
    if request.upstream_list.is_empty() {
        return Ok(());
    }
    let size = (request.max_count / request.upstream_list.len()).clamp(1, MAX_FETCH_SIZE);
    let dst = request.actor_name.as_str();
    let node_name = ctx.node_name();
    let queue = ctx.queue();
    debug!(dst, size, upstream = ?request.upstream_list, "Fetching");

    let ctx_ref = &ctx;
    let fetches = request.upstream_list.iter().map(|src_node| async move {
        if src_node == node_name {
            queue.export(dst, src_node, size)
        } else {
            export_remote(ctx_ref, dst, src_node, size).await
        }
    });
    let results = join_all(fetches).await;

    for (src_node, messages) in request.upstream_list.iter().zip(results) {
        if messages.len() < size {
            queue.notify(dst, src_node, false);
        }
        for message in messages {
            if dst == ACTOR_MESSAGE_ACKER {
                accept_ack(&ctx, &message);
                continue;
            }
            let message = ctx.registry().complete_message(message);
            let message_id = message.id.clone();
            match queue.inbox(message) {
                Ok(()) => {}
                Err(ActorError::State(e)) => debug!(message_id = %message_id, error = %e, "Fetched message skipped"),
                Err(e) => warn!(message_id = %message_id, error = %e, "Fetched message dropped"),
            }
        }
    }
    Ok(())
}

fn accept_ack(ctx: &ActorContext, message: &ActorMessage) {
    let ack: AckContent = match message.decode_content() {
        Ok(ack) => ack,
        Err(e) => {
            warn!(message_id = %message.id, error = %e, "Malformed ack");
            return;
        }
    };
    if let Err(e) = ctx.queue().acked(&message.id, ack.status) {
        warn!(message_id = %message.id, error = %e, "Ack rejected");
    }
}

/// Serve a fetch from a downstream node
async fn message_exporter(ctx: ActorContext, request: ExportRequest) -> anyhow::Result<ExportResponse> {
    let dst_node = ctx.message().src_node.clone();
    let messages = ctx
        .queue()
        .export(&request.dst, &dst_node, request.max_count.max(1))
        .iter()
        .map(ActorMessage::to_wire)
        .collect();
    Ok(ExportResponse { messages })
}

/// Ack pushed by a node instead of fetched, the message id is the child
async fn message_acker(ctx: ActorContext, ack: AckContent) -> anyhow::Result<()> {
    ctx.queue().acked(&ctx.message().id, ack.status)?;
    Ok(())
}

/// Tell every node hosting a destination that messages are waiting
async fn message_notify_sender(ctx: ActorContext, request: NotifyRequest) -> anyhow::Result<()> {
    let mut dst_nodes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for info in request.dst_info {
        for node in ctx.registry().find_dst_nodes(&info.dst) {
            dst_nodes.entry(node).or_default().insert(info.dst.clone());
        }
    }
    for info in request.dst_node_info {
        dst_nodes.entry(info.dst_node).or_default().insert(info.dst);
    }

    let node_name = ctx.node_name();
    if let Some(local) = dst_nodes.remove(node_name) {
        for dst in local {
            ctx.queue().notify(&dst, node_name, true);
        }
    }

    let ctx_ref = &ctx;
    let notifies = dst_nodes.into_iter().map(|(dst_node, dst_list)| async move {
        let content = NotifyReceive {
            dst_list: dst_list.into_iter().collect(),
        };
        if let Err(e) = ctx_ref
            .ask_node::<_, serde_json::Value>(ACTOR_MESSAGE_NOTIFY_RECEIVER, &content, &dst_node)
            .await
        {
            warn!(dst_node = %dst_node, error = %e, "Notify failed");
        }
    });
    join_all(notifies).await;
    Ok(())
}

async fn message_notify_receiver(ctx: ActorContext, request: NotifyReceive) -> anyhow::Result<serde_json::Value> {
    let src_node = ctx.message().src_node.clone();
    for dst in &request.dst_list {
        ctx.queue().notify(dst, &src_node, true);
    }
    Ok(serde_json::json!({ "message": "OK" }))
}

async fn message_monitor(ctx: ActorContext, _: ()) -> anyhow::Result<()> {
    ctx.queue().tick(unix_now());
    Ok(())
}

/// Rewrite the log into a snapshot of the live state
fn storage_compactor(ctx: &ActorContext, _: ()) -> anyhow::Result<()> {
    let queue = ctx.queue();
    let plan = match queue.prepare_compaction() {
        Some(plan) => plan?,
        None => return Ok(()),
    };
    plan.execute()?;
    queue.commit_compaction(&plan);
    info!(records = plan.len(), target = plan.target_num, "Storage compacted");
    Ok(())
}

async fn health(ctx: ActorContext, _: ()) -> anyhow::Result<serde_json::Value> {
    Ok(ctx.executor().health().to_json())
}

async fn update_registry(ctx: ActorContext, request: UpdateRegistry) -> anyhow::Result<()> {
    ctx.registry().update(&request.nodes);
    info!(nodes = request.nodes.len(), "Registry updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ActorKind, ActorTable};

    #[test]
    fn test_builtin_actors_register() {
        let mut table = ActorTable::new();
        for actor in builtin_actors() {
            table.register(actor).unwrap();
        }
        assert_eq!(table.len(), 10);
        assert_eq!(table.modules(), BTreeSet::from(["actor".to_string()]));
        assert_eq!(
            table.timers(),
            vec![(ACTOR_MESSAGE_MONITOR.to_string(), MONITOR_INTERVAL)]
        );
        assert_eq!(
            table.get(ACTOR_STORAGE_COMPACTOR).unwrap().kind(),
            ActorKind::Blocking
        );
        assert!(!table.contains(ACTOR_INIT));
    }
}
