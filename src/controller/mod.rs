//! Controller
//!
//! The controller owns the node table and the link to the stick. Incoming
//! messages are dispatched under the node table lock; whatever the handlers
//! produce (follow-up messages, events) is collected in an [`Outbox`] and
//! flushed once the lock is released, so listeners never run with the table
//! locked.

mod event;
mod state;

pub use self::event::{ChannelListener, Event, EventListener, InclusionPhase, ListenerId, NodeStatus, Outbox};
pub use self::state::{ControllerInfo, ControllerState, ControllerType};

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::commandclass::{self, lifecycle, CommandClassKind};
use crate::core::{ControllerConfig, Error, NodeId, Result};
use crate::dispatch::{Completion, DispatchContext, DispatchTable};
use crate::network::{transport_for, Link, LinkEvents, StatsSnapshot, Transport, Workers};
use crate::node::{Node, StageEnv};
use crate::protocol::{request, Liveness, Message, MessageClass, Priority, DEFAULT_TRANSMIT_OPTIONS};
use crate::store::{FileNodeStore, NoCatalog, NodeStore, ProductCatalog};

struct Registration {
    id: ListenerId,
    node: Option<NodeId>,
    listener: Arc<dyn EventListener>,
}

/// Shared between the controller handle, the workers and the watchdog
struct Core {
    config: ControllerConfig,
    transport: Box<dyn Transport>,
    state: Mutex<ControllerState>,
    link: Arc<Link>,
    table: Arc<DispatchTable>,
    store: Arc<dyn NodeStore>,
    catalog: Arc<dyn ProductCatalog>,
    listeners: RwLock<Vec<Registration>>,
    workers: AsyncMutex<Option<Workers>>,
    callback_id: AtomicU8,
    network_initialized: AtomicBool,
}

/// Liveness used to order `message` in the send queue
fn liveness_of(state: &ControllerState, message: &Message) -> Liveness {
    if !message.is_node_bound() {
        return Liveness::REACHABLE;
    }
    state
        .nodes
        .get(&message.target_node)
        .map_or(Liveness::REACHABLE, Node::liveness)
}

impl Core {
    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_callback_id(&self) -> u8 {
        loop {
            let id = self.callback_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Enqueues the messages and fans out the events of `outbox`
    fn flush(&self, outbox: Outbox) {
        let Outbox {
            messages,
            events,
            liveness_changed,
        } = outbox;

        if !messages.is_empty() || liveness_changed {
            let mut state = self.lock_state();
            for mut message in messages {
                if message.is_node_bound() {
                    match state.nodes.get_mut(&message.target_node) {
                        Some(node) if node.is_dead() => {
                            debug!(node = %message.target_node, class = %message.class, "node is dead, dropping message");
                            continue;
                        }
                        Some(node) => node.increment_send_count(),
                        None => {}
                    }
                }
                if message.has_send_data_trailer() {
                    message.callback_id = self.next_callback_id();
                    message.transmit_options = DEFAULT_TRANSMIT_OPTIONS;
                }
                let liveness = liveness_of(&state, &message);
                trace!(node = %message.target_node, class = %message.class, ?liveness, "queued");
                self.link.queue().enqueue(message, liveness);
            }
            if liveness_changed {
                self.link.queue().reprioritize(|message| liveness_of(&state, message));
            }
        }

        self.emit(events);
    }

    fn emit(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let targets: Vec<(Option<NodeId>, Arc<dyn EventListener>)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|registration| (registration.node, registration.listener.clone()))
            .collect();

        for event in &events {
            trace!(?event, "event");
            for (scope, listener) in &targets {
                if scope.is_none() || *scope == event.node() {
                    listener.on_event(event);
                }
            }
        }
    }

    fn stage_env<'a>(&'a self, own_node_id: NodeId, outbox: &'a mut Outbox) -> StageEnv<'a> {
        StageEnv {
            own_node_id,
            outbox,
            store: self.store.as_ref(),
            catalog: self.catalog.as_ref(),
        }
    }

    /// Emits `NetworkInitialized` once every node is done or dead
    fn check_network_initialized(&self, state: &mut ControllerState, outbox: &mut Outbox) {
        if self.network_initialized.load(Ordering::Acquire) || state.nodes.is_empty() {
            return;
        }
        if !state.nodes.values().all(|node| node.stage().is_terminal()) {
            return;
        }
        self.network_initialized.store(true, Ordering::Release);
        info!(nodes = state.nodes.len(), "network initialized");
        outbox.emit(Event::NetworkInitialized(state.info.own_node_id));
        for node in state.nodes.values_mut() {
            node.report_dead(outbox);
        }
    }

    /// Marks listening nodes dead that have been stuck in one stage too long
    fn check_stages(&self) {
        let mut outbox = Outbox::default();
        {
            let mut state = self.lock_state();
            let now = Utc::now();
            for node in state.nodes.values_mut() {
                if node.stage().is_terminal() || !(node.listening || node.frequently_listening) {
                    continue;
                }
                let Some(since) = node.query_stage_timestamp() else {
                    continue;
                };
                let stuck = (now - since)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= self.config.query_stage_timeout);
                if stuck {
                    warn!(node = %node.id(), stage = %node.stage(), "node stuck in stage");
                    node.mark_dead(&mut outbox);
                }
            }
            self.check_network_initialized(&mut state, &mut outbox);
        }
        self.flush(outbox);
    }

    async fn start_workers(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if let Some(running) = workers.take() {
            running.stop().await;
        }
        let events: Arc<dyn LinkEvents> = self.clone();
        *workers = Some(Workers::spawn(self.transport.as_ref(), self.link.clone(), events, self.config.soft_reset).await?);
        Ok(())
    }

    async fn stop_workers(&self) {
        if let Some(running) = self.workers.lock().await.take() {
            running.stop().await;
        }
        self.transport.close();
    }

    /// Restarts the workers when either of them stopped
    async fn supervise_workers(self: &Arc<Self>) {
        let running = self.workers.lock().await.as_ref().is_some_and(Workers::is_running);
        if running {
            return;
        }
        warn!(link = %self.transport.describe(), "link down, reconnecting");
        if let Some(interrupted) = self.link.take_in_flight() {
            self.requeue(interrupted);
        }
        if let Err(e) = self.start_workers().await {
            warn!(error = %e, "reconnect failed");
        }
    }
}

impl LinkEvents for Core {
    fn frame_received(&self, message: Message) {
        let mut incoming = message;
        let last_sent = self.link.in_flight();
        let mut outbox = Outbox::default();
        let mut transaction_over = false;

        {
            let mut state = self.lock_state();
            let completion = {
                let mut ctx = DispatchContext {
                    state: &mut state,
                    outbox: &mut outbox,
                    config: &self.config,
                    store: self.store.as_ref(),
                    catalog: self.catalog.as_ref(),
                };
                self.table.dispatch(&mut ctx, last_sent.as_ref(), &mut incoming)
            };

            if completion != Completion::Pending {
                // the send worker may have moved on to another transaction since
                let taken = last_sent.as_ref().and_then(|sent| self.link.take_in_flight_if(sent.sequence));
                if let Some(done) = taken {
                    transaction_over = true;
                    if completion == Completion::Complete {
                        debug!(node = %done.target_node, class = %done.class, "transaction complete");
                        let queued = self.link.queue().pending_for(done.target_node)
                            + outbox.messages.iter().filter(|m| m.target_node == done.target_node).count();
                        if let Some(node) = state.nodes.get_mut(&done.target_node) {
                            lifecycle::after_transaction(node, &done, queued, &mut outbox);
                        }
                        outbox.emit(Event::TransactionCompleted(done));
                    }
                }
            }
            self.check_network_initialized(&mut state, &mut outbox);
        }

        self.flush(outbox);
        if transaction_over {
            self.link.release_gate();
        }
    }

    fn transaction_timed_out(&self, message: Message) {
        let mut message = message;
        let mut outbox = Outbox::default();
        {
            let mut state = self.lock_state();
            let mut target_dead = false;
            if message.is_node_bound() {
                if let Some(node) = state.nodes.get_mut(&message.target_node) {
                    if node.liveness() == Liveness::SLEEPING {
                        debug!(node = %node.id(), "no answer from sleeping node");
                    } else {
                        node.increment_resend_count(&mut outbox);
                    }
                    target_dead = node.is_dead();
                }
            }

            if target_dead {
                info!(node = %message.target_node, class = %message.class, "dropping message for dead node");
            } else if message.attempts_remaining > 0 {
                message.attempts_remaining -= 1;
                debug!(class = %message.class, attempts = message.attempts_remaining, "requeueing after timeout");
                outbox.send(message);
            } else {
                warn!(node = %message.target_node, class = %message.class, "giving up after repeated timeouts");
            }
            self.check_network_initialized(&mut state, &mut outbox);
        }
        self.flush(outbox);
    }

    fn requeue(&self, message: Message) {
        let liveness = liveness_of(&self.lock_state(), &message);
        self.link.queue().enqueue(message, liveness);
    }
}

async fn watchdog(core: Arc<Core>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.config.watchdog_period);
    // the first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        core.supervise_workers().await;
        core.check_stages();
    }
    core.stop_workers().await;
    debug!("watchdog stopped");
}

/// Builds a [`Controller`] with non-default collaborators
pub struct ControllerBuilder {
    config: ControllerConfig,
    transport: Option<Box<dyn Transport>>,
    store: Option<Arc<dyn NodeStore>>,
    catalog: Arc<dyn ProductCatalog>,
    table: Option<Arc<DispatchTable>>,
}

impl ControllerBuilder {
    /// Link to use instead of the one derived from the configured port
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Node store to use instead of the file store under `store_dir`
    pub fn store(mut self, store: impl NodeStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn catalog(mut self, catalog: impl ProductCatalog + 'static) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    /// Dispatch table to use instead of [`DispatchTable::standard`]
    pub fn dispatch_table(mut self, table: Arc<DispatchTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn build(self) -> Result<Controller> {
        self.config.validate()?;
        let transport = self.transport.unwrap_or_else(|| transport_for(&self.config));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FileNodeStore::new(&self.config.store_dir)));
        let table = self.table.unwrap_or_else(|| Arc::new(DispatchTable::standard()));
        let link = Arc::new(Link::new(self.config.effective_response_timeout()));

        info!(link = %transport.describe(), "controller created");
        Ok(Controller {
            core: Arc::new(Core {
                config: self.config,
                transport,
                state: Mutex::new(ControllerState::default()),
                link,
                table,
                store,
                catalog: self.catalog,
                listeners: RwLock::new(Vec::new()),
                workers: AsyncMutex::new(None),
                callback_id: AtomicU8::new(1),
                network_initialized: AtomicBool::new(false),
            }),
            watchdog: Mutex::new(None),
        })
    }
}

/// Handle to a running mesh network coordinator
pub struct Controller {
    core: Arc<Core>,
    watchdog: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Controller {
    /// Creates a controller with the default link, store and catalog
    pub fn new(config: ControllerConfig) -> Result<Self> {
        Controller::builder(config).build()
    }

    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder {
            config,
            transport: None,
            store: None,
            catalog: Arc::new(NoCatalog),
            table: None,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.core.config
    }

    /// Opens the link, starts the workers and queries the stick
    pub async fn connect(&self) -> Result<()> {
        if self.watchdog_slot().is_some() {
            return Err(Error::invalid_state("controller already connected"));
        }
        self.core.start_workers().await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watchdog(self.core.clone(), cancel.clone()));
        *self.watchdog_slot() = Some((cancel, handle));

        info!(link = %self.core.transport.describe(), "connected");
        let mut outbox = Outbox::default();
        for message in [
            request::get_version(),
            request::memory_get_id(),
            request::serial_api_get_capabilities(),
            request::get_suc_node_id(),
        ] {
            outbox.send(message);
        }
        self.core.flush(outbox);
        Ok(())
    }

    /// Stops the workers and drops everything queued
    pub async fn disconnect(&self) {
        let running = self.watchdog_slot().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "watchdog panicked");
            }
        }
        self.core.link.clear();
        info!("disconnected");
    }

    /// Disconnects, forgets every node and drops the node-scoped listeners
    pub async fn close(&self) {
        self.disconnect().await;
        self.core.lock_state().nodes.clear();
        self.core.network_initialized.store(false, Ordering::Release);
        self.core
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|registration| registration.node.is_none());
    }

    /// Whether the workers are running
    pub async fn is_connected(&self) -> bool {
        self.core.workers.lock().await.as_ref().is_some_and(Workers::is_running)
    }

    fn watchdog_slot(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.watchdog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a message for sending
    pub fn enqueue(&self, message: Message) {
        let mut outbox = Outbox::default();
        outbox.send(message);
        self.core.flush(outbox);
    }

    /// Sends a raw command to a node
    pub fn send_data(
        &self,
        node: NodeId,
        command: &[u8],
        expected_reply: Option<MessageClass>,
        priority: Priority,
    ) -> Result<()> {
        self.enqueue(commandclass::send_data(node, command, expected_reply, priority)?);
        Ok(())
    }

    /// Runs `f` on a node with a stage environment, then flushes what it produced
    fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&mut Node, &mut StageEnv<'_>) -> R) -> Result<R> {
        let mut outbox = Outbox::default();
        let result = {
            let mut state = self.core.lock_state();
            let own = state.info.own_node_id;
            let node = state.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
            let mut env = self.core.stage_env(own, &mut outbox);
            f(node, &mut env)
        };
        self.core.flush(outbox);
        Ok(result)
    }

    /// Asks a node for its current value of `kind` on `endpoint`
    pub fn request_value(&self, id: NodeId, endpoint: u8, kind: CommandClassKind) -> Result<()> {
        let message = self.with_node(id, |node, _| {
            let class = node.resolve_command_class(kind, endpoint)?;
            let query = class.value_query(id)?;
            node.encapsulate(query, class, endpoint)
        })?;
        let message = message.ok_or_else(|| Error::invalid_state(format!("node {} cannot report {} on endpoint {}", id, kind, endpoint)))?;
        self.enqueue(message);
        Ok(())
    }

    /// Sets the value of `kind` on `endpoint` of a node
    pub fn set_value(&self, id: NodeId, endpoint: u8, kind: CommandClassKind, value: u8) -> Result<()> {
        let message = self.with_node(id, |node, _| {
            let class = node.resolve_command_class(kind, endpoint)?;
            let set = class.set_value(id, value)?;
            node.encapsulate(set, class, endpoint)
        })?;
        let message = message.ok_or_else(|| Error::invalid_state(format!("node {} cannot set {} on endpoint {}", id, kind, endpoint)))?;
        self.enqueue(message);
        Ok(())
    }

    /// Sets how often a sleeping node wakes up and makes it report here
    pub fn set_wake_up_interval(&self, id: NodeId, seconds: u32) -> Result<()> {
        if seconds > 0x00FF_FFFF {
            return Err(Error::invalid_state(format!("wake up interval {}s does not fit in 24 bits", seconds)));
        }
        let message = self.with_node(id, |node, env| {
            node.command_class(CommandClassKind::WakeUp)
                .map(|_| lifecycle::wake_up_interval_set(id, seconds, env.own_node_id))
        })?;
        let message = message.ok_or_else(|| Error::invalid_state(format!("node {} does not wake up", id)))?;
        self.enqueue(message);
        Ok(())
    }

    /// Re-reads the dynamic values of a finished node
    pub fn refresh_node(&self, id: NodeId) -> Result<()> {
        self.with_node(id, |node, env| node.refresh(env))
    }

    /// Copy of a node
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.core.lock_state().nodes.get(&id).cloned()
    }

    /// Copies of every known node, by id
    pub fn nodes(&self) -> Vec<Node> {
        self.core.lock_state().nodes.values().cloned().collect()
    }

    pub fn controller_info(&self) -> ControllerInfo {
        self.core.lock_state().info.clone()
    }

    /// Whether every node has finished initializing or is dead
    pub fn is_network_initialized(&self) -> bool {
        self.core.network_initialized.load(Ordering::Acquire)
    }

    /// Registers a listener for every event
    pub fn add_listener(&self, listener: impl EventListener + 'static) -> ListenerId {
        self.register(None, Arc::new(listener))
    }

    /// Registers a listener for the events of one node
    pub fn add_node_listener(&self, node: NodeId, listener: impl EventListener + 'static) -> ListenerId {
        self.register(Some(node), Arc::new(listener))
    }

    fn register(&self, node: Option<NodeId>, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId::next();
        self.core
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { id, node, listener });
        id
    }

    /// Unregisters a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.core.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    pub fn start_inclusion(&self) {
        self.enqueue(request::add_node_start());
    }

    pub fn stop_inclusion(&self) {
        self.enqueue(request::add_node_stop());
    }

    pub fn start_exclusion(&self) {
        self.enqueue(request::remove_node_start());
    }

    pub fn stop_exclusion(&self) {
        self.enqueue(request::remove_node_stop());
    }

    /// Reads the protocol info of `node` from the stick
    pub fn identify_node(&self, node: NodeId) {
        self.enqueue(request::identify_node(node));
    }

    pub fn request_node_routing_info(&self, node: NodeId) {
        self.enqueue(request::get_routing_info(node));
    }

    pub fn request_node_info(&self, node: NodeId) {
        self.enqueue(request::request_node_info(node));
    }

    /// Asks the stick whether it considers `node` failed
    pub fn check_failed_node(&self, node: NodeId) {
        self.enqueue(request::is_failed_node(node));
    }

    pub fn remove_failed_node(&self, node: NodeId) {
        self.enqueue(request::remove_failed_node(node));
    }

    /// Rediscovers the neighbors of `node`, then reads its routing table
    pub fn request_neighbor_update(&self, node: NodeId) {
        self.enqueue(request::request_node_neighbor_update(node));
    }

    pub fn assign_return_route(&self, node: NodeId, destination: NodeId) {
        self.enqueue(request::assign_return_route(node, destination));
    }

    pub fn delete_return_route(&self, node: NodeId) {
        self.enqueue(request::delete_return_route(node));
    }

    pub fn assign_suc_return_route(&self, node: NodeId) {
        self.enqueue(request::assign_suc_return_route(node));
    }

    /// Starts the stick's radio over
    pub fn soft_reset(&self) {
        self.enqueue(request::soft_reset());
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.link.stats()
    }

    /// Number of messages waiting to be sent
    pub fn queue_len(&self) -> usize {
        self.core.link.queue().len()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.watchdog_slot().take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::commandclass::{switch, CommandClass};
    use crate::network::DuplexTransport;
    use crate::node::NodeStage;
    use crate::protocol::{encode_frame, Direction};
    use crate::store::MemoryNodeStore;

    fn controller() -> Controller {
        Controller::builder(ControllerConfig::with_port("test"))
            .transport(DuplexTransport::new())
            .store(MemoryNodeStore::new())
            .build()
            .unwrap()
    }

    fn add_node(controller: &Controller, id: u8, stage: NodeStage) {
        let mut state = controller.core.lock_state();
        state.info.own_node_id = NodeId(1);
        let node = state.node_entry(NodeId(id));
        node.listening = true;
        node.add_command_class(CommandClass::new(CommandClassKind::SwitchBinary));
        node.force_stage(stage);
    }

    fn events(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_send_data_is_decorated_and_counted() {
        let controller = controller();
        add_node(&controller, 7, NodeStage::Done);

        controller.set_value(NodeId(7), 1, CommandClassKind::SwitchBinary, 0xFF).unwrap();
        controller.request_value(NodeId(7), 1, CommandClassKind::SwitchBinary).unwrap();

        let first = controller.core.link.queue().try_take().unwrap();
        let second = controller.core.link.queue().try_take().unwrap();
        assert_eq!(first.priority, Priority::Set);
        assert_eq!(first.transmit_options, DEFAULT_TRANSMIT_OPTIONS);
        assert_ne!(first.callback_id, 0);
        assert_ne!(first.callback_id, second.callback_id);
        assert_eq!(controller.node(NodeId(7)).unwrap().send_count(), 2);
    }

    #[test]
    fn test_wake_up_interval_reports_to_controller() {
        let controller = controller();
        add_node(&controller, 7, NodeStage::Done);
        assert!(controller.set_wake_up_interval(NodeId(7), 3600).is_err());

        controller
            .core
            .lock_state()
            .nodes
            .get_mut(&NodeId(7))
            .unwrap()
            .add_command_class(CommandClass::new(CommandClassKind::WakeUp));
        controller.set_wake_up_interval(NodeId(7), 3600).unwrap();

        let sent = controller.core.link.queue().try_take().unwrap();
        assert_eq!(sent.payload, vec![7, 6, 0x84, 0x04, 0x00, 0x0E, 0x10, 1]);
        assert!(controller.set_wake_up_interval(NodeId(7), 0x0100_0000).is_err());
    }

    #[test]
    fn test_unknown_node_rejected() {
        let controller = controller();
        assert!(matches!(
            controller.request_value(NodeId(9), 1, CommandClassKind::SwitchBinary),
            Err(Error::NodeNotFound(NodeId(9)))
        ));
        assert_eq!(controller.queue_len(), 0);
    }

    #[test]
    fn test_repeated_timeouts_kill_node_once() {
        let controller = controller();
        add_node(&controller, 7, NodeStage::Done);
        let (listener, mut rx) = ChannelListener::new();
        controller.add_listener(listener);

        controller.enqueue(switch::binary_get(NodeId(7)));
        while let Some(message) = controller.core.link.queue().try_take() {
            controller.core.transaction_timed_out(message);
        }

        let node = controller.node(NodeId(7)).unwrap();
        assert!(node.is_dead());
        assert_eq!(node.resend_count(), 3);
        assert_eq!(
            events(&mut rx),
            vec![Event::NodeStatusChanged { node: NodeId(7), status: NodeStatus::Dead }]
        );

        // later messages for the dead node never reach the queue
        controller.enqueue(switch::binary_get(NodeId(7)));
        assert_eq!(controller.queue_len(), 0);
    }

    #[test]
    fn test_timeouts_exhaust_attempts() {
        let controller = controller();
        controller.enqueue(request::get_version());
        let mut sent = 0;
        while let Some(message) = controller.core.link.queue().try_take() {
            sent += 1;
            controller.core.transaction_timed_out(message);
        }
        assert_eq!(sent, 4);
    }

    #[test]
    fn test_callback_completes_transaction() {
        let controller = controller();
        add_node(&controller, 7, NodeStage::Ping);
        let (listener, mut rx) = ChannelListener::new();
        controller.add_node_listener(NodeId(7), listener);

        controller.enqueue(lifecycle::no_operation(NodeId(7)));
        let sent = controller.core.link.queue().try_take().unwrap();
        let callback = sent.callback_id;
        controller.core.link.set_in_flight(Some(sent));

        controller
            .core
            .frame_received(Message::incoming(MessageClass::SendData, Direction::Request, vec![callback, 0]));

        assert!(controller.core.link.in_flight().is_none());
        assert_eq!(controller.node(NodeId(7)).unwrap().stage(), NodeStage::Details);
        let next = controller.core.link.queue().try_take().unwrap();
        assert_eq!(next.class, MessageClass::RequestNodeInfo);
        let events = events(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::TransactionCompleted(m) if m.callback_id == callback));
    }

    #[test]
    fn test_node_listener_scoping() {
        let controller = controller();
        let (all, mut all_rx) = ChannelListener::new();
        let (seven, mut seven_rx) = ChannelListener::new();
        controller.add_listener(all);
        let id = controller.add_node_listener(NodeId(7), seven);

        let mut outbox = Outbox::default();
        outbox.emit(Event::InitializationCompleted(NodeId(7)));
        outbox.emit(Event::InitializationCompleted(NodeId(8)));
        controller.core.flush(outbox);
        assert_eq!(events(&mut all_rx).len(), 2);
        assert_eq!(events(&mut seven_rx), vec![Event::InitializationCompleted(NodeId(7))]);

        assert!(controller.remove_listener(id));
        assert!(!controller.remove_listener(id));
        let mut outbox = Outbox::default();
        outbox.emit(Event::InitializationCompleted(NodeId(7)));
        controller.core.flush(outbox);
        assert!(events(&mut seven_rx).is_empty());
    }

    #[test]
    fn test_network_initialized_reports_startup_deaths() {
        let controller = controller();
        add_node(&controller, 1, NodeStage::Done);
        add_node(&controller, 7, NodeStage::Details);
        let (listener, mut rx) = ChannelListener::new();
        controller.add_listener(listener);

        controller.core.check_stages();
        assert!(!controller.is_network_initialized());

        {
            let mut outbox = Outbox::default();
            let mut state = controller.core.lock_state();
            state.nodes.get_mut(&NodeId(7)).unwrap().mark_dead(&mut outbox);
            assert!(outbox.events.is_empty());
        }
        controller.core.check_stages();
        assert!(controller.is_network_initialized());
        assert_eq!(
            events(&mut rx),
            vec![
                Event::NetworkInitialized(NodeId(1)),
                Event::NodeStatusChanged { node: NodeId(7), status: NodeStatus::Dead },
            ]
        );

        controller.core.check_stages();
        assert!(events(&mut rx).is_empty());
    }

    #[test]
    fn test_stuck_listening_node_is_marked_dead() {
        let mut config = ControllerConfig::with_port("test");
        config.query_stage_timeout = Duration::ZERO;
        let controller = Controller::builder(config)
            .transport(DuplexTransport::new())
            .store(MemoryNodeStore::new())
            .build()
            .unwrap();
        add_node(&controller, 7, NodeStage::Details);
        add_node(&controller, 8, NodeStage::WakeUp);
        controller.core.lock_state().nodes.get_mut(&NodeId(8)).unwrap().listening = false;

        controller.core.check_stages();
        assert!(controller.node(NodeId(7)).unwrap().is_dead());
        assert_eq!(controller.node(NodeId(8)).unwrap().stage(), NodeStage::WakeUp);
    }

    #[tokio::test]
    async fn test_close_forgets_nodes_and_node_listeners() {
        let controller = controller();
        add_node(&controller, 7, NodeStage::Done);
        let (all, mut all_rx) = ChannelListener::new();
        let (seven, mut seven_rx) = ChannelListener::new();
        controller.add_listener(all);
        controller.add_node_listener(NodeId(7), seven);
        controller.enqueue(request::get_version());

        controller.close().await;
        assert!(controller.nodes().is_empty());
        assert_eq!(controller.queue_len(), 0);

        let mut outbox = Outbox::default();
        outbox.emit(Event::InitializationCompleted(NodeId(7)));
        controller.core.flush(outbox);
        assert_eq!(events(&mut all_rx).len(), 1);
        assert!(events(&mut seven_rx).is_empty());
    }

    async fn read_frame(stick: &mut DuplexStream) -> Vec<u8> {
        let mut head = [0u8; 2];
        stick.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x01);
        let mut rest = vec![0u8; usize::from(head[1])];
        stick.read_exact(&mut rest).await.unwrap();
        [&head[..], &rest[..]].concat()
    }

    async fn read_byte(stick: &mut DuplexStream) -> u8 {
        let mut byte = [0u8; 1];
        stick.read_exact(&mut byte).await.unwrap();
        byte[0]
    }

    #[tokio::test]
    async fn test_startup_over_link() {
        let transport = DuplexTransport::new();
        let mut stick = transport.add_link();
        let controller = Controller::builder(ControllerConfig::with_port("test"))
            .transport(transport)
            .store(MemoryNodeStore::new())
            .build()
            .unwrap();
        controller.connect().await.unwrap();
        assert!(controller.connect().await.is_err());

        assert_eq!(read_byte(&mut stick).await, 0x15);
        assert_eq!(read_frame(&mut stick).await, vec![0x01, 0x03, 0x00, 0x15, 0xE9]);

        stick.write_all(&[0x06]).await.unwrap();
        let reply = Message::incoming(MessageClass::GetVersion, Direction::Response, b"Z-Wave 2.78\0\x01".to_vec());
        stick.write_all(&encode_frame(&reply).unwrap()).await.unwrap();
        assert_eq!(read_byte(&mut stick).await, 0x06);

        // the next query only goes out once the version reply completed the first
        let next = read_frame(&mut stick).await;
        assert_eq!(next[3], MessageClass::MemoryGetId.code());
        assert_eq!(controller.controller_info().version, "Z-Wave 2.78");
        assert!(controller.is_connected().await);

        controller.disconnect().await;
        assert!(!controller.is_connected().await);
        assert_eq!(controller.queue_len(), 0);
    }
}
