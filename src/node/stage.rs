//! Node initialization stages
//!
//! A node walks `EmptyNode -> ProtocolInfo -> Ping|WakeUp -> Details ->
//! ManufacturerSpec -> Version -> InstancesEndpoints -> StaticValues ->
//! Dynamic -> Done`. Each stage issues the queries it needs and waits until
//! every one of them has been answered before moving on. Outstanding queries
//! are tracked per `(endpoint, command class)`, so a reply only counts
//! towards the query it actually answers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::commandclass::{identity, lifecycle, multi_instance, CommandClass, CommandClassKind};
use crate::controller::{Event, NodeStatus, Outbox};
use crate::core::NodeId;
use crate::protocol::{request, Message};
use crate::store::{NodeStore, ProductCatalog};
use super::Node;

/// Initialization stage of a node, in forward order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum NodeStage {
    #[default]
    EmptyNode,
    ProtocolInfo,
    Ping,
    WakeUp,
    Details,
    ManufacturerSpec,
    Version,
    InstancesEndpoints,
    StaticValues,
    Dynamic,
    Done,
    Dead,
}

impl NodeStage {
    /// Stage that follows this one on the forward path
    pub fn next(&self) -> NodeStage {
        match self {
            NodeStage::EmptyNode => NodeStage::ProtocolInfo,
            NodeStage::ProtocolInfo => NodeStage::Ping,
            NodeStage::Ping | NodeStage::WakeUp => NodeStage::Details,
            NodeStage::Details => NodeStage::ManufacturerSpec,
            NodeStage::ManufacturerSpec => NodeStage::Version,
            NodeStage::Version => NodeStage::InstancesEndpoints,
            NodeStage::InstancesEndpoints => NodeStage::StaticValues,
            NodeStage::StaticValues => NodeStage::Dynamic,
            NodeStage::Dynamic | NodeStage::Done => NodeStage::Done,
            NodeStage::Dead => NodeStage::Dead,
        }
    }

    /// Whether the node has no further initialization work
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStage::Done | NodeStage::Dead)
    }
}

impl fmt::Display for NodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies an outstanding initialization query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey {
    /// Instance or endpoint the query addressed, 1 for the root device
    pub endpoint: u8,
    pub class: CommandClassKind,
}

impl QueryKey {
    pub fn new(endpoint: u8, class: CommandClassKind) -> Self {
        QueryKey { endpoint, class }
    }
}

/// Advancer bookkeeping, never persisted
#[derive(Debug, Clone, Default)]
pub(crate) struct StageProgress {
    /// `None` until the current stage has issued its queries
    pub pending: Option<BTreeMap<QueryKey, u16>>,
    pub initialization_complete: bool,
    pub restored: bool,
}

impl StageProgress {
    fn outstanding(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |pending| pending.values().map(|&n| usize::from(n)).sum())
    }
}

/// What the advancer may touch outside the node
pub struct StageEnv<'a> {
    /// Node id of the controller itself
    pub own_node_id: NodeId,
    pub outbox: &'a mut Outbox,
    pub store: &'a dyn NodeStore,
    pub catalog: &'a dyn ProductCatalog,
}

impl Node {
    /// Moves the node towards `target`.
    ///
    /// Requests for a stage at or behind the current one are ignored, except
    /// for `Done`, which may be re-asserted.
    pub fn advance(&mut self, target: NodeStage, env: &mut StageEnv<'_>) {
        if target <= self.stage && target != NodeStage::Done {
            warn!(node = %self.id, current = %self.stage, requested = %target, "already in or beyond stage, ignoring");
            return;
        }
        debug!(node = %self.id, current = %self.stage, requested = %target, "advancing stage");
        self.query_stage_timestamp = Some(Utc::now());

        loop {
            if self.progress.outstanding() > 0 {
                trace!(node = %self.id, stage = %self.stage, outstanding = self.progress.outstanding(), "waiting for replies");
                return;
            }

            match self.stage {
                NodeStage::EmptyNode => {
                    self.set_stage(NodeStage::ProtocolInfo);
                    env.outbox.send(request::identify_node(self.id));
                    return;
                }
                NodeStage::ProtocolInfo => {
                    if self.id == env.own_node_id {
                        self.set_stage(NodeStage::Done);
                        continue;
                    }
                    if !self.listening && !self.frequently_listening && self.supports(CommandClassKind::WakeUp) {
                        debug!(node = %self.id, "sleeping node, waiting for wake up");
                        self.set_stage(NodeStage::WakeUp);
                        return;
                    }
                    if !self.supports(CommandClassKind::NoOperation) {
                        warn!(node = %self.id, "no NO_OPERATION class, cannot ping");
                        return;
                    }
                    self.set_stage(NodeStage::Ping);
                    env.outbox.send(lifecycle::no_operation(self.id));
                    return;
                }
                NodeStage::Ping | NodeStage::WakeUp => {
                    if self.progress.restored {
                        debug!(node = %self.id, "restored node, skipping discovery");
                        self.set_stage(NodeStage::Dynamic);
                        continue;
                    }
                    self.set_stage(NodeStage::Details);
                    env.outbox.send(request::request_node_info(self.id));
                    return;
                }
                NodeStage::Details => {
                    self.set_stage(NodeStage::ManufacturerSpec);
                }
                NodeStage::ManufacturerSpec
                | NodeStage::Version
                | NodeStage::InstancesEndpoints
                | NodeStage::StaticValues
                | NodeStage::Dynamic => {
                    if self.progress.pending.is_none() {
                        let queries = self.stage_queries(self.stage);
                        let mut pending = BTreeMap::new();
                        for (key, message) in queries {
                            *pending.entry(key).or_insert(0u16) += 1;
                            env.outbox.send(message);
                        }
                        if !pending.is_empty() {
                            debug!(node = %self.id, stage = %self.stage, queries = pending.len(), "issued stage queries");
                        }
                        self.progress.pending = Some(pending);
                        continue;
                    }
                    let next = self.stage.next();
                    self.set_stage(next);
                }
                NodeStage::Done => {
                    self.complete_initialization(env);
                    return;
                }
                NodeStage::Dead => return,
            }
        }
    }

    fn stage_queries(&self, stage: NodeStage) -> Vec<(QueryKey, Message)> {
        let id = self.id;
        let mut queries = Vec::new();
        match stage {
            NodeStage::ManufacturerSpec => {
                if self.supports(CommandClassKind::ManufacturerSpecific) {
                    queries.push((
                        QueryKey::new(1, CommandClassKind::ManufacturerSpecific),
                        identity::manufacturer_specific_get(id),
                    ));
                }
            }
            NodeStage::Version => {
                if self.supports(CommandClassKind::Version) {
                    for kind in self.command_classes.keys().filter(|&&k| k != CommandClassKind::NoOperation) {
                        queries.push((QueryKey::new(1, *kind), identity::command_class_version_get(id, *kind)));
                    }
                }
            }
            NodeStage::InstancesEndpoints => match self.command_class(CommandClassKind::MultiInstance) {
                Some(class) if class.version >= 2 => {
                    queries.push((
                        QueryKey::new(1, CommandClassKind::MultiInstance),
                        multi_instance::endpoint_get(id),
                    ));
                }
                Some(_) => {
                    for kind in self.command_classes.keys().filter(|&&k| {
                        k != CommandClassKind::NoOperation && k != CommandClassKind::MultiInstance
                    }) {
                        queries.push((QueryKey::new(1, *kind), multi_instance::instance_get(id, *kind)));
                    }
                }
                None => trace!(node = %id, "no MULTI_INSTANCE class, skipping endpoints"),
            },
            NodeStage::StaticValues | NodeStage::Dynamic => {
                let build = |class: &CommandClass| {
                    if stage == NodeStage::StaticValues {
                        class.initialize_queries(id)
                    } else {
                        class.dynamic_queries(id)
                    }
                };
                for class in self.command_classes.values() {
                    for message in build(class) {
                        if class.instances > 1 {
                            for instance in 1..=class.instances {
                                if let Some(wrapped) = self.encapsulate(message.clone(), class, instance) {
                                    queries.push((QueryKey::new(instance, class.kind()), wrapped));
                                }
                            }
                        } else {
                            queries.push((QueryKey::new(1, class.kind()), message));
                        }
                    }
                }
                for endpoint in self.endpoints.values() {
                    for class in endpoint.command_classes() {
                        for message in build(class) {
                            if let Some(wrapped) = self.encapsulate(message, class, endpoint.id) {
                                queries.push((QueryKey::new(endpoint.id, class.kind()), wrapped));
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        queries
    }

    fn complete_initialization(&mut self, env: &mut StageEnv<'_>) {
        if let Err(e) = env.store.save(self) {
            warn!(node = %self.id, error = %e, "failed to save node");
        }
        if !self.progress.initialization_complete {
            info!(node = %self.id, "initialization complete");
            self.progress.initialization_complete = true;
            env.outbox.emit(Event::InitializationCompleted(self.id));
        }
    }

    /// Records the reply to an outstanding stage query.
    ///
    /// Replies that match no outstanding query do not move the stage.
    pub fn query_answered(&mut self, key: QueryKey, env: &mut StageEnv<'_>) {
        let Some(pending) = self.progress.pending.as_mut() else {
            return;
        };
        let Some(count) = pending.get_mut(&key) else {
            trace!(node = %self.id, stage = %self.stage, endpoint = key.endpoint, class = %key.class, "reply not awaited by stage");
            return;
        };
        *count -= 1;
        if *count == 0 {
            pending.remove(&key);
        }
        if pending.is_empty() {
            let next = self.stage.next();
            self.advance(next, env);
        }
    }

    /// Registers an extra query the current stage must wait for
    pub fn expect_query(&mut self, key: QueryKey) {
        *self
            .progress
            .pending
            .get_or_insert_with(BTreeMap::new)
            .entry(key)
            .or_insert(0) += 1;
    }

    /// Number of stage queries still awaiting a reply
    pub fn pending_queries(&self) -> usize {
        self.progress.outstanding()
    }

    pub(crate) fn set_stage(&mut self, stage: NodeStage) {
        trace!(node = %self.id, from = %self.stage, to = %stage, "stage");
        self.stage = stage;
        self.progress.pending = None;
        self.query_stage_timestamp = Some(Utc::now());
    }

    /// Demotes a finished node to `Dynamic` and re-reads its live values
    pub fn refresh(&mut self, env: &mut StageEnv<'_>) {
        if self.stage == NodeStage::Dead {
            return;
        }
        debug!(node = %self.id, "refreshing dynamic values");
        self.set_stage(NodeStage::Dynamic);
        self.advance(NodeStage::Done, env);
    }

    /// Records a sign of life from the node
    pub fn mark_responsive(&mut self, env: &mut StageEnv<'_>) {
        self.last_updated = Utc::now();
        if self.stage == NodeStage::Dead {
            self.set_alive(env);
        } else {
            self.counters.resend = 0;
        }
    }

    /// Brings a dead node back
    pub fn set_alive(&mut self, env: &mut StageEnv<'_>) {
        info!(node = %self.id, "node is alive");
        self.counters.resend = 0;
        if std::mem::take(&mut self.counters.dead_reported) {
            env.outbox.emit(Event::NodeStatusChanged {
                node: self.id,
                status: NodeStatus::Alive,
            });
        }
        if self.progress.initialization_complete {
            self.set_stage(NodeStage::Done);
        } else {
            self.set_stage(NodeStage::Dynamic);
            self.advance(NodeStage::Done, env);
        }
    }

    /// Takes identity and classes from the stored copy of this node.
    ///
    /// The stored copy is rejected when it disagrees with what the node
    /// just reported about itself.
    pub fn restore_from(&mut self, store: &dyn NodeStore) -> bool {
        let saved = match store.load(self.id) {
            Ok(Some(saved)) => saved,
            Ok(None) => return false,
            Err(e) => {
                warn!(node = %self.id, error = %e, "failed to load stored node");
                return false;
            }
        };
        if saved.version != self.version
            || saved.manufacturer == 0
            || saved.listening != self.listening
            || saved.frequently_listening != self.frequently_listening
            || saved.routing != self.routing
            || saved.device_class != self.device_class
        {
            warn!(node = %self.id, "stored node differs from controller information, ignoring it");
            return false;
        }

        self.manufacturer = saved.manufacturer;
        self.device_type = saved.device_type;
        self.device_id = saved.device_id;
        self.command_classes = saved.command_classes;
        self.endpoints = saved.endpoints;
        if self.name.is_empty() {
            self.name = saved.name;
        }
        if self.location.is_empty() {
            self.location = saved.location;
        }
        self.progress.restored = true;
        debug!(node = %self.id, "restored from store");
        true
    }

    /// Whether the node was restored from the store
    pub fn is_restored(&self) -> bool {
        self.progress.restored
    }

    /// Whether the node reached `Done` at least once
    pub fn is_initialization_complete(&self) -> bool {
        self.progress.initialization_complete
    }
}
