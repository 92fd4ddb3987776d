//! Command dispatch table
//!
//! Maps a message class to the handler that understands its payload. The
//! table is built once at startup and shared by reference; handlers reach
//! the node table and the outbox only through the [`DispatchContext`] they
//! are given.

mod admin;
mod nodes;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::controller::{ControllerState, Outbox};
use crate::core::{ControllerConfig, Error, NodeId, Result};
use crate::node::{Node, StageEnv};
use crate::protocol::{Direction, Message, MessageClass};
use crate::store::{NodeStore, ProductCatalog};

/// Interprets one message class
pub trait MessageHandler: Send + Sync {
    /// Handles a request frame (unsolicited, or a callback)
    fn handle_request(
        &self,
        _ctx: &mut DispatchContext<'_>,
        _last_sent: Option<&Message>,
        incoming: &mut Message,
    ) -> Result<()> {
        warn!(class = %incoming.class, "unexpected request");
        Ok(())
    }

    /// Handles a response frame
    fn handle_response(
        &self,
        _ctx: &mut DispatchContext<'_>,
        _last_sent: Option<&Message>,
        incoming: &mut Message,
    ) -> Result<()> {
        warn!(class = %incoming.class, "unexpected response");
        Ok(())
    }

    /// Whether `incoming` is the reply `last_sent` was waiting for
    fn correlates(&self, last_sent: &Message, incoming: &Message) -> bool {
        last_sent.expected_reply == Some(incoming.class)
    }
}

/// Outcome of dispatching one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The in-flight transaction is still open
    Pending,
    /// The in-flight transaction got its answer
    Complete,
    /// The answer came back as a failure that has already been dealt with
    Resolved,
}

/// What a handler may read and change
pub struct DispatchContext<'a> {
    pub state: &'a mut ControllerState,
    pub outbox: &'a mut Outbox,
    pub config: &'a ControllerConfig,
    pub store: &'a dyn NodeStore,
    pub catalog: &'a dyn ProductCatalog,
}

impl DispatchContext<'_> {
    /// Runs `f` on a known node with a stage environment
    pub fn with_node<R>(&mut self, id: NodeId, f: impl FnOnce(&mut Node, &mut StageEnv<'_>) -> R) -> Result<R> {
        let own_node_id = self.state.info.own_node_id;
        let node = self.state.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        let mut env = StageEnv {
            own_node_id,
            outbox: &mut *self.outbox,
            store: self.store,
            catalog: self.catalog,
        };
        Ok(f(node, &mut env))
    }

    /// Queues `message` again if it has attempts left
    pub fn retry(&mut self, message: &Message) -> bool {
        if message.attempts_remaining == 0 {
            warn!(node = %message.target_node, class = %message.class, "no attempts left, discarding");
            return false;
        }
        let mut again = message.clone();
        again.attempts_remaining -= 1;
        debug!(node = %again.target_node, class = %again.class, attempts = again.attempts_remaining, "retrying");
        self.outbox.send(again);
        true
    }
}

/// Registry of message handlers
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<MessageClass, Box<dyn MessageHandler>>,
}

impl DispatchTable {
    /// Creates an empty table
    pub fn new() -> Self {
        DispatchTable::default()
    }

    /// Table with every handler this crate provides
    pub fn standard() -> Self {
        let mut table = DispatchTable::new();
        admin::register(&mut table);
        nodes::register(&mut table);
        table
    }

    /// Registers `handler` for `class`, replacing any earlier one
    pub fn register(&mut self, class: MessageClass, handler: impl MessageHandler + 'static) {
        self.handlers.insert(class, Box::new(handler));
    }

    pub fn contains(&self, class: MessageClass) -> bool {
        self.handlers.contains_key(&class)
    }

    /// Routes `incoming` to its handler and decides whether it ends the
    /// in-flight transaction.
    ///
    /// Handler failures are logged; they never escape.
    pub fn dispatch(
        &self,
        ctx: &mut DispatchContext<'_>,
        last_sent: Option<&Message>,
        incoming: &mut Message,
    ) -> Completion {
        let Some(handler) = self.handlers.get(&incoming.class) else {
            warn!(class = %incoming.class, "no handler registered");
            return Completion::Pending;
        };

        let result = match incoming.direction {
            Direction::Request => handler.handle_request(ctx, last_sent, incoming),
            Direction::Response => handler.handle_response(ctx, last_sent, incoming),
        };
        if let Err(e) = result {
            warn!(class = %incoming.class, error = %e, "failed to handle message");
            return Completion::Pending;
        }

        match last_sent {
            Some(last) if handler.correlates(last, incoming) => {
                if incoming.canceled {
                    Completion::Resolved
                } else {
                    Completion::Complete
                }
            }
            _ => Completion::Pending,
        }
    }
}
