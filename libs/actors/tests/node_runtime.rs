//! Actor node integration tests
//!
//! Runs real nodes on ephemeral ports: local asks across both worker pools,
//! children delivered through the outbox and acked, emitted messages, WAL
//! replay after a restart, and a second node reaching the first over HTTP.

use actor_config::NodeConfig;
use messaging_actors::{Actor, ActorContext, ActorNode};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use types::{ActorMessage, MessageStatus, NetworkSpec, NodeSpec};

fn config(name: &str) -> NodeConfig {
    NodeConfig {
        name: Some(name.to_string()),
        host: "127.0.0.1".to_string(),
        port: 0,
        concurrency: 4,
        ask_timeout_secs: 10,
        ..NodeConfig::default()
    }
}

fn echo() -> Actor {
    Actor::blocking("demo.echo", |_ctx: &ActorContext, text: String| {
        Ok(text.to_uppercase())
    })
}

fn counter(count: Arc<AtomicUsize>) -> Actor {
    Actor::blocking("demo.counter", move |_ctx: &ActorContext, n: usize| {
        count.fetch_add(n, Ordering::SeqCst);
        Ok(())
    })
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_ask_blocking_and_cooperative() {
    let relay = Actor::cooperative("demo.relay", |ctx: ActorContext, text: String| async move {
        let upper: String = ctx.ask("demo.echo", &text).await?;
        Ok(format!("relayed {}", upper))
    });
    let fail = Actor::blocking("demo.fail", |_ctx: &ActorContext, _: ()| -> anyhow::Result<()> {
        anyhow::bail!("boom")
    });
    let node = ActorNode::new(config("local"), vec![echo(), relay, fail]).unwrap();
    node.start().await.unwrap();

    let reply: String = node.ask("demo.echo", &"hi").await.unwrap();
    assert_eq!(reply, "HI");

    let reply: String = node.ask("demo.relay", &"hi").await.unwrap();
    assert_eq!(reply, "relayed HI");

    let err = node.ask::<_, ()>("demo.fail", &()).await.unwrap_err();
    assert_eq!(err.category(), "handler");
    assert!(err.to_string().contains("boom"));

    let health: serde_json::Value = node.ask("actor.health", &()).await.unwrap();
    assert_eq!(health["name"], "local");
    assert_eq!(health["status"], "healthy");
    assert!(health["queue"]["actors"]["demo.echo"].is_object());

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_children_are_delivered_and_acked() {
    let count = Arc::new(AtomicUsize::new(0));
    let fanout = Actor::cooperative("demo.fanout", |ctx: ActorContext, n: usize| async move {
        for _ in 0..n {
            ctx.tell("demo.counter", &1usize)?;
        }
        Ok(())
    });
    let node = ActorNode::new(config("fanout"), vec![counter(Arc::clone(&count)), fanout]).unwrap();
    node.start().await.unwrap();

    node.tell("demo.fanout", &3usize).await.unwrap();

    let delivered = wait_until(Duration::from_secs(15), || {
        let count = Arc::clone(&count);
        async move { count.load(Ordering::SeqCst) == 3 }
    })
    .await;
    assert!(delivered, "children not delivered: {}", count.load(Ordering::SeqCst));

    let queue = Arc::clone(node.queue());
    let settled = wait_until(Duration::from_secs(15), || {
        let queue = Arc::clone(&queue);
        async move {
            queue.with_state(|state| {
                state.pending_ack_count("demo.counter") == 0
                    && state.message_ids_with_status(MessageStatus::Outbox).is_empty()
            })
        }
    })
    .await;
    assert!(settled, "acks not settled: {:?}", queue.stats());
    assert_eq!(count.load(Ordering::SeqCst), 3);

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_emitted_messages_are_delivered() {
    let count = Arc::new(AtomicUsize::new(0));
    let emitter = Actor::blocking("demo.emitter", |ctx: &ActorContext, n: usize| {
        ctx.emit(
            ActorMessage::with_json("ignored", "demo.counter", &n)?
                .with_priority(10)
                .with_require_ack(true),
        );
        ctx.hope("demo.counter", &1usize)?;
        Ok(())
    });
    let node = ActorNode::new(config("emitter"), vec![counter(Arc::clone(&count)), emitter]).unwrap();
    node.start().await.unwrap();

    node.tell("demo.emitter", &4usize).await.unwrap();

    let delivered = wait_until(Duration::from_secs(15), || {
        let count = Arc::clone(&count);
        async move { count.load(Ordering::SeqCst) == 5 }
    })
    .await;
    assert!(delivered, "emitted children not delivered: {}", count.load(Ordering::SeqCst));

    let queue = Arc::clone(node.queue());
    let settled = wait_until(Duration::from_secs(15), || {
        let queue = Arc::clone(&queue);
        async move { queue.with_state(|state| state.message_ids_with_status(MessageStatus::Outbox).is_empty()) }
    })
    .await;
    assert!(settled, "emitter parent not finished: {:?}", queue.stats());

    node.shutdown().await.unwrap();
}

fn durable_config(name: &str, dir: &Path) -> NodeConfig {
    NodeConfig {
        storage_dir: Some(dir.to_path_buf()),
        ..config(name)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inbox_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    {
        // never started: the message is only logged
        let node = ActorNode::new(
            durable_config("durable", dir.path()),
            vec![counter(Arc::clone(&count))],
        )
        .unwrap();
        node.tell("demo.counter", &5usize).await.unwrap();
        assert_eq!(node.queue().stats().inbox_size, 1);
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let node = ActorNode::new(
        durable_config("durable", dir.path()),
        vec![counter(Arc::clone(&count))],
    )
    .unwrap();
    node.start().await.unwrap();

    let replayed = wait_until(Duration::from_secs(10), || {
        let count = Arc::clone(&count);
        async move { count.load(Ordering::SeqCst) == 5 }
    })
    .await;
    assert!(replayed);
    assert!(node.queue().stats().wal.is_some());

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_ask_and_tell_over_http() {
    let count = Arc::new(AtomicUsize::new(0));
    let node_a = ActorNode::new(config("node-a"), vec![echo(), counter(Arc::clone(&count))]).unwrap();
    let addr_a = node_a.start().await.unwrap();
    let url_a = format!("http://{}{}", addr_a, node_a.config().subpath);

    let mut config_b = config("node-b");
    config_b.networks = vec![NetworkSpec::new("lan", "http://127.0.0.1:1/unused")];
    config_b.registry_node = Some(
        NodeSpec::new("node-a")
            .with_module("demo")
            .with_network("lan", url_a),
    );
    let node_b = ActorNode::new(config_b, Vec::new()).unwrap();
    node_b.start().await.unwrap();

    assert_eq!(
        node_b.registry().find_dst_nodes("demo.echo"),
        vec!["node-a".to_string()]
    );

    let reply: String = node_b.ask("demo.echo", &"remote").await.unwrap();
    assert_eq!(reply, "REMOTE");

    node_b.tell("demo.counter", &2usize).await.unwrap();
    let delivered = wait_until(Duration::from_secs(10), || {
        let count = Arc::clone(&count);
        async move { count.load(Ordering::SeqCst) == 2 }
    })
    .await;
    assert!(delivered);

    node_b.shutdown().await.unwrap();
    node_a.shutdown().await.unwrap();
}
