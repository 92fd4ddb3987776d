use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::commandclass::CommandClassKind;
use crate::core::NodeId;
use crate::protocol::Message;

/// Reachability of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Alive,
    Dead,
}

/// Progress of an inclusion or exclusion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InclusionPhase {
    IncludeStart,
    IncludeSlaveFound,
    IncludeControllerFound,
    IncludeFail,
    IncludeDone,
    ExcludeStart,
    ExcludeSlaveFound,
    ExcludeControllerFound,
    ExcludeFail,
    ExcludeDone,
}

/// Events delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The in-flight message received its matching reply
    TransactionCompleted(Message),
    /// A node finished its initialization stages for the first time
    InitializationCompleted(NodeId),
    /// Every known node finished initializing or is dead
    NetworkInitialized(NodeId),
    /// A node died or came back
    NodeStatusChanged {
        node: NodeId,
        status: NodeStatus,
    },
    /// Inclusion or exclusion progress
    Inclusion {
        node: NodeId,
        phase: InclusionPhase,
    },
    /// A value reported by a command class
    CommandClassValue {
        node: NodeId,
        endpoint: u8,
        command_class: CommandClassKind,
        value: i32,
    },
}

impl Event {
    /// Node the event is about, if any
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Event::TransactionCompleted(message) => Some(message.target_node),
            Event::InitializationCompleted(node) | Event::NetworkInitialized(node) => Some(*node),
            Event::NodeStatusChanged { node, .. }
            | Event::Inclusion { node, .. }
            | Event::CommandClassValue { node, .. } => Some(*node),
        }
    }
}

/// Receives controller events.
///
/// Listeners are called synchronously from the worker that produced the
/// event, so they must not block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelListener(pub mpsc::UnboundedSender<Event>);

impl ChannelListener {
    /// Creates a listener together with its receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelListener(tx), rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &Event) {
        // a dropped receiver just means nobody is interested anymore
        let _ = self.0.send(event.clone());
    }
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Messages and events produced while handling one incoming message.
///
/// The controller flushes it after releasing the node table.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Messages to enqueue, in order
    pub messages: Vec<Message>,
    /// Events to fan out, in order
    pub events: Vec<Event>,
    /// A node's awake state changed and the queue must be re-keyed
    pub liveness_changed: bool,
}

impl Outbox {
    /// Queues a message for sending
    pub fn send(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Queues an event for listeners
    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Whether nothing was produced
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.events.is_empty() && !self.liveness_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_listener() {
        let seen = Mutex::new(Vec::new());
        let listener = |event: &Event| seen.lock().unwrap().push(event.node());
        listener.on_event(&Event::InitializationCompleted(NodeId(4)));
        assert_eq!(*seen.lock().unwrap(), vec![Some(NodeId(4))]);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let (listener, mut rx) = ChannelListener::new();
        let event = Event::NodeStatusChanged { node: NodeId(7), status: NodeStatus::Dead };
        listener.on_event(&event);
        assert_eq!(rx.recv().await, Some(event));
    }

    #[test]
    fn test_listener_ids_unique() {
        assert_ne!(ListenerId::next(), ListenerId::next());
    }

    #[test]
    fn test_outbox() {
        let mut outbox = Outbox::default();
        assert!(outbox.is_empty());
        outbox.emit(Event::InitializationCompleted(NodeId(1)));
        assert!(!outbox.is_empty());
    }
}
