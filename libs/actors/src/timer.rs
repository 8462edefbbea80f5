//! Timer Scheduler
//!
//! One task per node sends every timer actor a message once per interval.
//! Timer messages expire after two intervals so a stalled node does not
//! pile them up.

use crate::queue::ActorMessageQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::names::ACTOR_SYSTEM;
use types::{generate_message_id, unix_now, ActorMessage, ASK_PRIORITY};

/// Longest sleep between deadline checks
const MAX_TIMER_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TimerEntry {
    name: String,
    interval: Duration,
    deadline: Instant,
}

/// Build the message a timer actor receives
pub fn timer_message(node_name: &str, dst: &str, interval: Duration) -> ActorMessage {
    ActorMessage::new(ACTOR_SYSTEM, dst, b"null".to_vec())
        .with_id(generate_message_id())
        .with_src_node(node_name)
        .with_dst_node(node_name)
        .with_priority(ASK_PRIORITY)
        .with_expire_at(unix_now() + 2.0 * interval.as_secs_f64())
}

/// Run until `shutdown` flips to true
pub async fn run_timers(
    queue: Arc<ActorMessageQueue>,
    timers: Vec<(String, Duration)>,
    mut shutdown: watch::Receiver<bool>,
) {
    if timers.is_empty() {
        info!("No timers to schedule");
        return;
    }
    let now = Instant::now();
    let mut entries: Vec<TimerEntry> = timers
        .into_iter()
        .map(|(name, interval)| {
            info!(actor = %name, interval_secs = interval.as_secs_f64(), "Timer scheduled");
            TimerEntry {
                name,
                interval,
                deadline: now + interval,
            }
        })
        .collect();

    loop {
        let now = Instant::now();
        for entry in entries.iter_mut().filter(|e| now >= e.deadline) {
            let message = timer_message(queue.node_name(), &entry.name, entry.interval);
            match queue.inbox(message) {
                Ok(()) => debug!(actor = %entry.name, "Timer fired"),
                Err(e) => warn!(actor = %entry.name, error = %e, "Timer message rejected"),
            }
            entry.deadline = now + entry.interval;
        }

        let next = entries
            .iter()
            .map(|e| e.deadline)
            .min()
            .unwrap_or(now + MAX_TIMER_WAIT)
            .min(Instant::now() + MAX_TIMER_WAIT);
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Timers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_message_expiry() {
        let before = unix_now();
        let message = timer_message("node-a", "actor.message_monitor", Duration::from_secs(5));
        assert_eq!(message.dst_node.as_deref(), Some("node-a"));
        assert_eq!(message.priority, ASK_PRIORITY);
        let expire_at = message.expire_at.unwrap();
        assert!(expire_at >= before + 10.0);
        assert!(expire_at <= unix_now() + 10.0);
        assert!(!message.id.is_empty());
    }
}
