use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::core::NodeId;
use super::message::{Message, Priority};

/// Delivery class of the node a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Liveness {
    /// Node is awake right now
    pub awake: bool,
    /// Node listens permanently or frequently
    pub listening: bool,
}

impl Liveness {
    /// Liveness of messages that do not wait on a sleepy node
    pub const REACHABLE: Liveness = Liveness { awake: false, listening: true };

    /// Liveness of a node that is asleep and not listening
    pub const SLEEPING: Liveness = Liveness { awake: false, listening: false };
}

#[derive(Debug)]
struct Entry {
    liveness: Liveness,
    priority: Priority,
    sequence: u64,
    message: Message,
}

impl Entry {
    fn new(message: Message, liveness: Liveness) -> Self {
        Entry {
            liveness,
            priority: message.priority,
            sequence: message.sequence,
            message,
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap, so "greater" means "sent first"
    fn cmp(&self, other: &Self) -> Ordering {
        self.liveness
            .awake
            .cmp(&other.liveness.awake)
            .then_with(|| self.liveness.listening.cmp(&other.liveness.listening))
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Concurrent priority queue of outbound messages
#[derive(Debug, Default)]
pub struct SendQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
}

impl SendQueue {
    /// Creates an empty queue
    pub fn new() -> Self {
        SendQueue::default()
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a message, keyed by the liveness of its target node
    pub fn enqueue(&self, message: Message, liveness: Liveness) {
        self.heap().push(Entry::new(message, liveness));
        self.notify.notify_one();
    }

    /// Removes the next message without waiting
    pub fn try_take(&self) -> Option<Message> {
        self.heap().pop().map(|entry| entry.message)
    }

    /// Removes the next message, waiting until one is available
    pub async fn take(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_take() {
                return message;
            }
            notified.await;
        }
    }

    /// Re-keys every queued message after node liveness changed
    pub fn reprioritize<F>(&self, lookup: F)
    where
        F: Fn(&Message) -> Liveness,
    {
        let mut heap = self.heap();
        let entries = std::mem::take(&mut *heap).into_vec();
        *heap = entries
            .into_iter()
            .map(|entry| {
                let liveness = lookup(&entry.message);
                Entry::new(entry.message, liveness)
            })
            .collect();
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.heap().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }

    /// Number of queued messages addressed to `node`
    pub fn pending_for(&self, node: NodeId) -> usize {
        self.heap()
            .iter()
            .filter(|entry| entry.message.target_node == node)
            .count()
    }

    /// Drops every queued message
    pub fn clear(&self) {
        self.heap().clear();
    }
}
