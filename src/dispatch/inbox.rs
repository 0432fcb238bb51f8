use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

use crate::models::Message;

/// Bounded per-worker queue of reserved messages.
///
/// The dispatcher is the only producer and the owning worker the only
/// consumer. `push_front` ignores the bound so urgent work always fits.
pub struct WorkerInbox {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
}

impl WorkerInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append at the tail. Hands the message back when the inbox is full.
    pub async fn push(&self, message: Message) -> Result<(), Message> {
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                return Err(message);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn push_front(&self, message: Message) {
        self.queue.lock().await.push_front(message);
        self.notify.notify_one();
    }

    /// Stable partition: matching messages move ahead of the rest.
    pub async fn promote(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        let mut queue = self.queue.lock().await;
        let (front, back): (VecDeque<Message>, VecDeque<Message>) =
            queue.drain(..).partition(|m| predicate(m));
        let promoted = front.len();
        queue.extend(front);
        queue.extend(back);
        promoted
    }

    pub async fn try_pop(&self) -> Option<Message> {
        self.queue.lock().await.pop_front()
    }

    /// Wait for the next message.
    pub async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.try_pop().await {
                return message;
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn has_capacity(&self) -> bool {
        self.queue.lock().await.len() < self.capacity
    }

    pub async fn drain(&self) -> Vec<Message> {
        self.queue.lock().await.drain(..).collect()
    }
}
