use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use super::scorer::{self, Score};
use crate::models::{AgentId, Message, MessageId, MessageStatus, BROADCAST_TARGET};

/// Capacity and retention bounds for a queue store
#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub max_size: usize,
    pub history_retention: Duration,
    pub max_history: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_size: 1000,
            history_retention: Duration::from_secs(24 * 60 * 60),
            max_history: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub dequeued: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub expired: u64,
    pub rejected: u64,
    pub load_errors: u64,
    pub persistence_errors: u64,
    pub current_size: usize,
    pub in_flight: usize,
}

/// Total order over pending messages: best score first, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    score: Reverse<Score>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    at: DateTime<Utc>,
    reason: Option<String>,
}

/// Terminal id set kept in completion order for retention pruning.
#[derive(Debug, Default)]
struct History {
    entries: HashMap<MessageId, HistoryEntry>,
    order: VecDeque<MessageId>,
}

impl History {
    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn insert(&mut self, id: MessageId, at: DateTime<Utc>, reason: Option<String>, cap: usize) {
        if self.entries.contains_key(&id) {
            return;
        }
        self.order.push_back(id.clone());
        self.entries.insert(id, HistoryEntry { at, reason });
        while self.order.len() > cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(front) = self.order.front() {
            let stale = self
                .entries
                .get(front)
                .map(|entry| entry.at < cutoff)
                .unwrap_or(true);
            if !stale {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.entries.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    fn reason(&self, id: &str) -> Option<&str> {
        self.entries.get(id).and_then(|e| e.reason.as_deref())
    }

    fn ids(&self) -> Vec<MessageId> {
        self.order.iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// What a persisted store writes to disk
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub pending: Vec<Message>,
    pub acknowledged: Vec<MessageId>,
    pub failed: Vec<MessageId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub expired: usize,
    pub already_terminal: usize,
}

/// Lifecycle state shared by every queue store implementation.
///
/// A message id lives in exactly one of: pending, in flight, acknowledged,
/// failed, expired. Callers serialize access through a single lock.
#[derive(Debug)]
pub struct QueueState {
    limits: QueueLimits,
    pending: BTreeMap<PendingKey, Message>,
    by_target: HashMap<AgentId, BTreeSet<PendingKey>>,
    keys: HashMap<MessageId, PendingKey>,
    in_flight: HashMap<MessageId, (PendingKey, Message)>,
    acknowledged: History,
    failed: History,
    expired: History,
    next_seq: u64,
    metrics: QueueMetrics,
    dirty: bool,
}

impl QueueState {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits,
            pending: BTreeMap::new(),
            by_target: HashMap::new(),
            keys: HashMap::new(),
            in_flight: HashMap::new(),
            acknowledged: History::default(),
            failed: History::default(),
            expired: History::default(),
            next_seq: 0,
            metrics: QueueMetrics::default(),
            dirty: false,
        }
    }

    fn is_known(&self, id: &str) -> bool {
        self.keys.contains_key(id)
            || self.in_flight.contains_key(id)
            || self.acknowledged.contains(id)
            || self.failed.contains(id)
            || self.expired.contains(id)
    }

    fn insert_pending(&mut self, key: PendingKey, mut message: Message) {
        message.status = MessageStatus::Queued;
        self.by_target
            .entry(message.target_agent.clone())
            .or_default()
            .insert(key);
        self.keys.insert(message.id.clone(), key);
        self.pending.insert(key, message);
    }

    fn remove_pending(&mut self, key: PendingKey) -> Option<Message> {
        let message = self.pending.remove(&key)?;
        self.keys.remove(&message.id);
        if let Some(set) = self.by_target.get_mut(&message.target_agent) {
            set.remove(&key);
            if set.is_empty() {
                self.by_target.remove(&message.target_agent);
            }
        }
        Some(message)
    }

    fn next_key(&mut self, message: &Message) -> PendingKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        PendingKey {
            score: Reverse(scorer::score(message.priority, message.urgent, message.created_at)),
            seq,
        }
    }

    pub fn enqueue(&mut self, message: Message, now: DateTime<Utc>) -> bool {
        if self.is_known(&message.id) {
            debug!("Rejecting duplicate message {}", message.id);
            self.metrics.rejected += 1;
            return false;
        }
        if message.is_expired_at(now) {
            debug!("Rejecting already expired message {}", message.id);
            self.metrics.rejected += 1;
            return false;
        }
        if self.pending.len() + self.in_flight.len() >= self.limits.max_size {
            debug!("Rejecting message {}: queue full", message.id);
            self.metrics.rejected += 1;
            return false;
        }

        let key = self.next_key(&message);
        self.insert_pending(key, message);
        self.metrics.enqueued += 1;
        self.dirty = true;
        true
    }

    /// Pending keys addressed to `agent_id` (directly or by broadcast), best first.
    fn candidate_keys(&self, agent_id: &str) -> Vec<PendingKey> {
        let direct = self.by_target.get(agent_id).into_iter().flatten();
        let broadcast = if agent_id == BROADCAST_TARGET {
            None
        } else {
            self.by_target.get(BROADCAST_TARGET)
        };
        let mut keys: Vec<PendingKey> = direct
            .chain(broadcast.into_iter().flatten())
            .copied()
            .collect();
        keys.sort();
        keys
    }

    fn expire(&mut self, key: PendingKey, now: DateTime<Utc>) {
        if let Some(message) = self.remove_pending(key) {
            debug!("Dropping expired message {}", message.id);
            self.expired
                .insert(message.id, now, None, self.limits.max_history);
            self.metrics.expired += 1;
            self.dirty = true;
        }
    }

    fn reserve(&mut self, key: PendingKey) -> Option<Message> {
        let mut message = self.remove_pending(key)?;
        message.status = MessageStatus::Dispatched;
        self.in_flight
            .insert(message.id.clone(), (key, message.clone()));
        self.metrics.dequeued += 1;
        Some(message)
    }

    fn reserve_first(
        &mut self,
        agent_id: &str,
        now: DateTime<Utc>,
        accept: impl Fn(&Message) -> bool,
    ) -> Option<Message> {
        for key in self.candidate_keys(agent_id) {
            let Some(message) = self.pending.get(&key) else {
                continue;
            };
            if message.is_expired_at(now) {
                self.expire(key, now);
                continue;
            }
            if message.is_addressed_to(agent_id) && accept(message) {
                return self.reserve(key);
            }
        }
        None
    }

    pub fn dequeue(&mut self, agent_id: &str, now: DateTime<Utc>) -> Option<Message> {
        self.reserve_first(agent_id, now, |_| true)
    }

    pub fn next_interrupting(&mut self, agent_id: &str, now: DateTime<Utc>) -> Option<Message> {
        self.reserve_first(agent_id, now, |m| {
            scorer::is_interrupting(m.priority, m.urgent)
        })
    }

    /// Takes a message out of pending or in-flight for a terminal transition.
    fn take_live(&mut self, id: &str) -> bool {
        if self.in_flight.remove(id).is_some() {
            return true;
        }
        match self.keys.get(id).copied() {
            Some(key) => self.remove_pending(key).is_some(),
            None => false,
        }
    }

    pub fn acknowledge(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        if self.acknowledged.contains(id) {
            return true;
        }
        if !self.take_live(id) {
            return false;
        }
        self.acknowledged
            .insert(id.to_string(), now, None, self.limits.max_history);
        self.metrics.acknowledged += 1;
        self.dirty = true;
        true
    }

    pub fn mark_failed(&mut self, id: &str, reason: &str, now: DateTime<Utc>) -> bool {
        if self.failed.contains(id) {
            return true;
        }
        if !self.take_live(id) {
            return false;
        }
        self.failed.insert(
            id.to_string(),
            now,
            Some(reason.to_string()),
            self.limits.max_history,
        );
        self.metrics.failed += 1;
        self.dirty = true;
        true
    }

    pub fn release(&mut self, id: &str) -> bool {
        match self.in_flight.remove(id) {
            Some((key, message)) => {
                self.insert_pending(key, message);
                true
            }
            None => false,
        }
    }

    pub fn queue_size(&self) -> usize {
        self.pending.len()
    }

    pub fn agent_queue_size(&self, agent_id: &str) -> usize {
        self.by_target.get(agent_id).map_or(0, BTreeSet::len)
    }

    pub fn pending_targets(&self) -> Vec<AgentId> {
        let mut best: Vec<(PendingKey, &AgentId)> = self
            .by_target
            .iter()
            .filter_map(|(target, keys)| keys.first().map(|k| (*k, target)))
            .collect();
        best.sort();
        best.into_iter().map(|(_, target)| target.clone()).collect()
    }

    pub fn message_status(&self, id: &str) -> Option<MessageStatus> {
        if self.keys.contains_key(id) {
            Some(MessageStatus::Queued)
        } else if self.in_flight.contains_key(id) {
            Some(MessageStatus::Dispatched)
        } else if self.acknowledged.contains(id) {
            Some(MessageStatus::Delivered)
        } else if self.failed.contains(id) {
            Some(MessageStatus::Failed)
        } else if self.expired.contains(id) {
            Some(MessageStatus::Expired)
        } else {
            None
        }
    }

    pub fn failure_reason(&self, id: &str) -> Option<String> {
        self.failed.reason(id).map(str::to_string)
    }

    pub fn prune_history(&mut self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.limits.history_retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now - retention;
        let persisted =
            self.acknowledged.prune_before(cutoff) + self.failed.prune_before(cutoff);
        let removed = persisted + self.expired.prune_before(cutoff);
        if persisted > 0 {
            self.dirty = true;
        }
        removed
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            current_size: self.pending.len(),
            in_flight: self.in_flight.len(),
            ..self.metrics.clone()
        }
    }

    pub fn history_len(&self) -> (usize, usize, usize) {
        (
            self.acknowledged.len(),
            self.failed.len(),
            self.expired.len(),
        )
    }

    pub fn record_load_errors(&mut self, count: u64) {
        self.metrics.load_errors += count;
    }

    pub fn record_persistence_error(&mut self) {
        self.metrics.persistence_errors += 1;
    }

    /// Returns whether persisted content changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Pending and in-flight messages in pop order, plus terminal id sets.
    ///
    /// In-flight reservations are written back as queued so that a crash
    /// during delivery re-delivers on restart.
    pub fn snapshot(&self) -> Snapshot {
        let mut live: Vec<(PendingKey, Message)> = self
            .pending
            .iter()
            .map(|(key, message)| (*key, message.clone()))
            .chain(self.in_flight.values().cloned())
            .collect();
        live.sort_by_key(|(key, _)| *key);

        Snapshot {
            pending: live
                .into_iter()
                .map(|(_, mut message)| {
                    message.status = MessageStatus::Queued;
                    message
                })
                .collect(),
            acknowledged: self.acknowledged.ids(),
            failed: self.failed.ids(),
        }
    }

    /// Rebuilds state from a snapshot.
    ///
    /// Terminal sets load first so a record that already completed is never
    /// queued again. Expired records are dropped without entering any set.
    pub fn restore(&mut self, snapshot: Snapshot, now: DateTime<Utc>) -> RestoreReport {
        let mut report = RestoreReport::default();
        let cap = self.limits.max_history;

        for id in snapshot.acknowledged {
            self.acknowledged.insert(id, now, None, cap);
        }
        for id in snapshot.failed {
            self.failed.insert(id, now, None, cap);
        }

        for message in snapshot.pending {
            if self.acknowledged.contains(&message.id) || self.failed.contains(&message.id) {
                report.already_terminal += 1;
                continue;
            }
            if message.is_expired_at(now) {
                report.expired += 1;
                continue;
            }
            if self.keys.contains_key(&message.id) {
                continue;
            }
            let key = self.next_key(&message);
            self.insert_pending(key, message);
            report.restored += 1;
        }

        report
    }
}
