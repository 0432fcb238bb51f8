use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::inbox::WorkerInbox;
use super::worker::WorkerPool;
use super::DispatchContext;
use crate::delivery::DeliveryError;
use crate::models::{AgentId, AgentStatus, BROADCAST_TARGET};
use crate::queue::scorer;

/// Dispatcher loop: one cycle per wake-up, enqueue, completion or tick.
pub async fn run_dispatcher(
    ctx: Arc<DispatchContext>,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ctx.settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Dispatcher started");

    loop {
        let routed = dispatch_cycle(&ctx, &pool).await;
        if routed > 0 {
            debug!("Dispatch cycle routed {} messages", routed);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ctx.wake.notified() => {}
            _ = ticker.tick() => {}
        }
    }

    info!("Dispatcher stopped");
}

/// Route as much pending work as the inboxes accept. Returns the number of
/// messages moved out of the store.
///
/// Each step pops one message from the target with the best pending score
/// among targets that can still take work, then re-ranks. Pop order is
/// therefore global score order across agents.
pub async fn dispatch_cycle(ctx: &DispatchContext, pool: &WorkerPool) -> usize {
    let mut routed = 0;

    let urgent = ctx.urgent.lock().await.is_active(Instant::now());
    if urgent {
        routed += promote_interrupting(ctx, pool).await;
    }

    let mut blocked: HashSet<AgentId> = HashSet::new();
    loop {
        let next = ctx
            .store
            .pending_targets()
            .await
            .into_iter()
            .find(|target| !blocked.contains(target));
        let Some(target) = next else {
            break;
        };

        let moved = if target == BROADCAST_TARGET {
            route_broadcast(ctx, pool).await
        } else if let Some(inbox) = pool.inbox(&target).await {
            route_one(ctx, &target, &inbox).await
        } else if !ctx.registry.lock().await.contains(&target) {
            routed += fail_unroutable(ctx, &target).await;
            false
        } else {
            false
        };

        if moved {
            routed += 1;
        } else {
            blocked.insert(target);
        }
    }

    routed
}

/// Pop one message for `target` into its inbox. False when the inbox is
/// full or nothing is deliverable.
async fn route_one(ctx: &DispatchContext, target: &str, inbox: &WorkerInbox) -> bool {
    if !inbox.has_capacity().await {
        return false;
    }
    let Some(message) = ctx.store.dequeue(target).await else {
        return false;
    };
    match inbox.push(message).await {
        Ok(()) => true,
        Err(message) => {
            ctx.store.release(&message.id).await;
            false
        }
    }
}

/// Drain a deregistered target's direct messages to `Failed`. Broadcasts
/// reserved on the way go back to pending.
async fn fail_unroutable(ctx: &DispatchContext, target: &str) -> usize {
    let reason = DeliveryError::TargetNotFound(target.to_string()).to_string();
    let mut failed = 0;
    let mut broadcasts = Vec::new();
    while let Some(message) = ctx.store.dequeue(target).await {
        if message.is_broadcast() {
            broadcasts.push(message.id);
            continue;
        }
        ctx.store.mark_failed(&message.id, &reason).await;
        failed += 1;
    }
    for id in &broadcasts {
        ctx.store.release(id).await;
    }
    if failed > 0 {
        warn!("Failed {} messages for unregistered agent {}", failed, target);
    }
    failed
}

/// Hand the best broadcast-marker message to the first live agent with inbox
/// room that is not its sender. False when nobody can take it.
async fn route_broadcast(ctx: &DispatchContext, pool: &WorkerPool) -> bool {
    let Some(message) = ctx.store.dequeue(BROADCAST_TARGET).await else {
        return false;
    };

    let candidates: Vec<AgentId> = ctx
        .registry
        .lock()
        .await
        .all()
        .into_iter()
        .filter(|a| a.status != AgentStatus::Offline && message.is_addressed_to(&a.agent_id))
        .map(|a| a.agent_id)
        .collect();

    let mut pending = message;
    for agent_id in candidates {
        let Some(inbox) = pool.inbox(&agent_id).await else {
            continue;
        };
        match inbox.push(pending).await {
            Ok(()) => return true,
            Err(message) => pending = message,
        }
    }

    ctx.store.release(&pending.id).await;
    false
}

/// Urgent mode: interrupting messages jump to the head of every inbox.
async fn promote_interrupting(ctx: &DispatchContext, pool: &WorkerPool) -> usize {
    let mut pulled_total = 0;
    for (agent_id, inbox) in pool.inboxes().await {
        inbox
            .promote(|m| scorer::is_interrupting(m.priority, m.urgent))
            .await;

        let mut pulled = Vec::new();
        while let Some(message) = ctx.store.next_interrupting(&agent_id).await {
            pulled.push(message);
        }

        pulled_total += pulled.len();
        for message in pulled.into_iter().rev() {
            inbox.push_front(message).await;
        }
    }
    if pulled_total > 0 {
        debug!("Urgent mode pulled {} interrupting messages ahead", pulled_total);
    }
    pulled_total
}
