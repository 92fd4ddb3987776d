//! Node module
//!
//! A [`Node`] is one member device of the network as the controller sees
//! it: identity, capability flags, command classes, endpoints, neighbors and
//! the counters behind the dead-node policy. The controller owns every node;
//! nothing else keeps a copy.

mod device_class;
mod stage;

pub use self::device_class::{BasicClass, DeviceClass, GenericClass};
pub use self::stage::{NodeStage, QueryKey, StageEnv};

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::commandclass::{multi_instance, CommandClass, CommandClassKind};
use crate::controller::{Event, NodeStatus, Outbox};
use crate::core::{NodeId, DEAD_NODE_THRESHOLD};
use crate::protocol::{Liveness, Message};
use crate::store::ProductDescriptor;
use self::stage::StageProgress;

/// Send statistics of a node
#[derive(Debug, Clone, Default)]
struct Counters {
    send: u32,
    resend: u32,
    retry: u32,
    dead: u32,
    dead_time: Option<DateTime<Utc>>,
    /// A dead event went out and an alive event is owed
    dead_reported: bool,
}

/// A sub-addressable device under a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u8,
    pub generic: u8,
    pub specific: u8,
    command_classes: BTreeMap<CommandClassKind, CommandClass>,
}

impl Endpoint {
    pub fn new(id: u8, generic: u8, specific: u8) -> Self {
        Endpoint {
            id,
            generic,
            specific,
            command_classes: BTreeMap::new(),
        }
    }

    pub fn add_command_class(&mut self, class: CommandClass) {
        self.command_classes.entry(class.kind()).or_insert(class);
    }

    pub fn command_class(&self, kind: CommandClassKind) -> Option<&CommandClass> {
        self.command_classes.get(&kind)
    }

    pub fn command_class_mut(&mut self, kind: CommandClassKind) -> Option<&mut CommandClass> {
        self.command_classes.get_mut(&kind)
    }

    pub fn command_classes(&self) -> impl Iterator<Item = &CommandClass> {
        self.command_classes.values()
    }
}

/// A member device of the network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    /// Network the node belongs to
    pub home_id: u32,
    /// Protocol version
    pub version: u8,
    pub name: String,
    pub location: String,
    pub manufacturer: u16,
    pub device_type: u16,
    pub device_id: u16,
    /// Always listening (mains powered)
    pub listening: bool,
    /// Wakes up on a beam
    pub frequently_listening: bool,
    /// Can route for other nodes
    pub routing: bool,
    pub device_class: DeviceClass,
    /// Catalog entry, looked up again after every restart
    #[serde(skip)]
    pub product: Option<ProductDescriptor>,
    command_classes: BTreeMap<CommandClassKind, CommandClass>,
    endpoints: BTreeMap<u8, Endpoint>,
    neighbors: BTreeSet<NodeId>,
    last_updated: DateTime<Utc>,
    #[serde(skip)]
    awake: bool,
    #[serde(skip)]
    stage: NodeStage,
    #[serde(skip)]
    query_stage_timestamp: Option<DateTime<Utc>>,
    #[serde(skip)]
    counters: Counters,
    #[serde(skip)]
    progress: StageProgress,
}

impl Node {
    /// Creates an empty node supporting the default classes
    pub fn new(id: NodeId, home_id: u32) -> Self {
        let mut node = Node {
            id,
            home_id,
            version: 0,
            name: String::new(),
            location: String::new(),
            manufacturer: 0,
            device_type: 0,
            device_id: 0,
            listening: false,
            frequently_listening: false,
            routing: false,
            device_class: DeviceClass::default(),
            product: None,
            command_classes: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            neighbors: BTreeSet::new(),
            last_updated: Utc::now(),
            awake: false,
            stage: NodeStage::EmptyNode,
            query_stage_timestamp: None,
            counters: Counters::default(),
            progress: StageProgress::default(),
        };
        node.add_command_class(CommandClass::new(CommandClassKind::NoOperation));
        node.add_command_class(CommandClass::new(CommandClassKind::Basic));
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn stage(&self) -> NodeStage {
        self.stage
    }

    pub fn is_dead(&self) -> bool {
        self.stage == NodeStage::Dead
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// When the current stage was entered
    pub fn query_stage_timestamp(&self) -> Option<DateTime<Utc>> {
        self.query_stage_timestamp
    }

    pub fn supports(&self, kind: CommandClassKind) -> bool {
        self.command_classes.contains_key(&kind)
    }

    pub fn command_class(&self, kind: CommandClassKind) -> Option<&CommandClass> {
        self.command_classes.get(&kind)
    }

    pub fn command_class_mut(&mut self, kind: CommandClassKind) -> Option<&mut CommandClass> {
        self.command_classes.get_mut(&kind)
    }

    pub fn command_classes(&self) -> impl Iterator<Item = &CommandClass> {
        self.command_classes.values()
    }

    /// Adds a class, keeping the existing one if already present
    pub fn add_command_class(&mut self, class: CommandClass) {
        let kind = class.kind();
        if self.command_classes.contains_key(&kind) {
            return;
        }
        debug!(node = %self.id, class = %kind, "adding command class");
        self.command_classes.insert(kind, class);
    }

    /// Adds the classes the generic device class makes mandatory
    pub fn add_mandatory_command_classes(&mut self) {
        for &kind in self.device_class.generic.mandatory_command_classes() {
            self.add_command_class(CommandClass::new(kind));
        }
    }

    pub fn endpoint(&self, id: u8) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn add_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoints.insert(endpoint.id, endpoint);
    }

    /// Class answering for `endpoint`: the root class when it has enough
    /// instances, the endpoint's own class otherwise
    pub fn resolve_command_class(&self, kind: CommandClassKind, endpoint: u8) -> Option<&CommandClass> {
        match self.command_classes.get(&kind) {
            Some(class) if class.instances >= endpoint => Some(class),
            _ => self.endpoints.get(&endpoint)?.command_class(kind),
        }
    }

    pub fn resolve_command_class_mut(&mut self, kind: CommandClassKind, endpoint: u8) -> Option<&mut CommandClass> {
        let use_root = self
            .command_classes
            .get(&kind)
            .is_some_and(|class| class.instances >= endpoint);
        if use_root {
            self.command_classes.get_mut(&kind)
        } else {
            self.endpoints.get_mut(&endpoint)?.command_class_mut(kind)
        }
    }

    /// Wraps `message` so it reaches `endpoint` of this node.
    ///
    /// Returns `None` when the node offers no way to address the endpoint.
    pub fn encapsulate(&self, message: Message, class: &CommandClass, endpoint: u8) -> Option<Message> {
        if endpoint == 1 && class.instances == 1 && class.endpoint.is_none() {
            return Some(message);
        }
        match self.command_class(CommandClassKind::MultiInstance) {
            Some(multi) if multi.version >= 2 && class.endpoint.is_some() => {
                multi_instance::encapsulate_endpoint(message, endpoint)
            }
            Some(_) if class.instances >= endpoint => {
                multi_instance::encapsulate_instance(message, endpoint)
            }
            _ if endpoint != 1 => {
                warn!(node = %self.id, endpoint, class = %class.kind(), "cannot encapsulate for endpoint");
                None
            }
            _ => Some(message),
        }
    }

    /// Liveness class used to order messages for this node
    pub fn liveness(&self) -> Liveness {
        Liveness {
            awake: self.awake,
            listening: self.listening || self.frequently_listening,
        }
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    pub fn set_awake(&mut self, awake: bool, outbox: &mut Outbox) {
        if self.awake != awake {
            self.awake = awake;
            outbox.liveness_changed = true;
        }
    }

    pub fn neighbors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.neighbors.iter().copied()
    }

    pub fn set_neighbors(&mut self, neighbors: impl IntoIterator<Item = NodeId>) {
        self.neighbors = neighbors.into_iter().collect();
    }

    /// Neighbors usable as routes, `None` for nodes that do not route
    pub fn routing_list(&self) -> Option<Vec<NodeId>> {
        self.routing.then(|| self.neighbors.iter().copied().collect())
    }

    pub fn send_count(&self) -> u32 {
        self.counters.send
    }

    pub fn resend_count(&self) -> u32 {
        self.counters.resend
    }

    pub fn retry_count(&self) -> u32 {
        self.counters.retry
    }

    pub fn dead_count(&self) -> u32 {
        self.counters.dead
    }

    pub fn dead_time(&self) -> Option<DateTime<Utc>> {
        self.counters.dead_time
    }

    pub fn increment_send_count(&mut self) {
        self.counters.send += 1;
    }

    pub fn increment_retry_count(&mut self) {
        self.counters.retry += 1;
    }

    /// Counts a failed send. Returns whether the node just died.
    pub fn increment_resend_count(&mut self, outbox: &mut Outbox) -> bool {
        self.counters.resend += 1;
        if self.counters.resend < DEAD_NODE_THRESHOLD || self.is_dead() {
            return false;
        }
        self.mark_dead(outbox);
        true
    }

    /// Puts the node in `Dead`. The dead event only goes out once the node
    /// has finished initializing.
    pub fn mark_dead(&mut self, outbox: &mut Outbox) {
        if self.is_dead() {
            return;
        }
        info!(node = %self.id, resend = self.counters.resend, "node is dead");
        self.counters.dead += 1;
        self.counters.dead_time = Some(Utc::now());
        self.set_stage(NodeStage::Dead);
        if self.progress.initialization_complete {
            self.report_dead(outbox);
        }
    }

    /// Emits the dead event if it has not gone out yet
    pub(crate) fn report_dead(&mut self, outbox: &mut Outbox) {
        if self.is_dead() && !self.counters.dead_reported {
            self.counters.dead_reported = true;
            outbox.emit(Event::NodeStatusChanged {
                node: self.id,
                status: NodeStatus::Dead,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn force_stage(&mut self, stage: NodeStage) {
        self.set_stage(stage);
        if stage == NodeStage::Done {
            self.progress.initialization_complete = true;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::commandclass::switch;

    #[test]
    fn test_default_classes() {
        let node = Node::new(NodeId(2), 0);
        assert!(node.supports(CommandClassKind::NoOperation));
        assert!(node.supports(CommandClassKind::Basic));
        assert!(!node.supports(CommandClassKind::SwitchBinary));
        assert_eq!(node.stage(), NodeStage::EmptyNode);
    }

    #[test]
    fn test_mandatory_classes() {
        let mut node = Node::new(NodeId(2), 0);
        node.device_class = DeviceClass::new(0x04, 0x10, 0x01);
        node.add_mandatory_command_classes();
        assert!(node.supports(CommandClassKind::SwitchBinary));
    }

    #[test]
    fn test_duplicate_class_keeps_first() {
        let mut node = Node::new(NodeId(2), 0);
        let mut class = CommandClass::new(CommandClassKind::Basic);
        class.version = 3;
        node.add_command_class(class);
        assert_eq!(node.command_class(CommandClassKind::Basic).unwrap().version, 1);
    }

    #[test]
    fn test_encapsulation_pass_through() {
        let mut node = Node::new(NodeId(6), 0);
        node.add_command_class(CommandClass::new(CommandClassKind::SwitchBinary));
        let class = node.command_class(CommandClassKind::SwitchBinary).unwrap().clone();

        let message = switch::binary_get(NodeId(6));
        let sent = node.encapsulate(message.clone(), &class, 1).unwrap();
        assert_eq!(sent, message);
        assert_eq!(sent.payload, vec![6, 2, 0x25, 0x02]);
    }

    #[test]
    fn test_encapsulation_for_endpoint() {
        let mut node = Node::new(NodeId(6), 0);
        let mut multi = CommandClass::new(CommandClassKind::MultiInstance);
        multi.version = 2;
        node.add_command_class(multi);
        let class = CommandClass::for_endpoint(CommandClassKind::SwitchBinary, 3);

        let sent = node.encapsulate(switch::binary_get(NodeId(6)), &class, 3).unwrap();
        assert_eq!(sent.payload, vec![6, 6, 0x60, 0x0D, 0x01, 3, 0x25, 0x02]);

        // no multi-instance support at all
        let plain = Node::new(NodeId(6), 0);
        assert!(plain.encapsulate(switch::binary_get(NodeId(6)), &class, 3).is_none());
    }

    #[test]
    fn test_encapsulation_by_instance_without_endpoint() {
        let mut node = Node::new(NodeId(6), 0);
        let mut multi = CommandClass::new(CommandClassKind::MultiInstance);
        multi.version = 3;
        node.add_command_class(multi);
        let mut class = CommandClass::new(CommandClassKind::SwitchBinary);
        class.instances = 2;

        let sent = node.encapsulate(switch::binary_get(NodeId(6)), &class, 2).unwrap();
        assert_eq!(sent.payload, vec![6, 5, 0x60, 0x06, 2, 0x25, 0x02]);
        assert!(node.encapsulate(switch::binary_get(NodeId(6)), &class, 3).is_none());
    }

    #[test]
    fn test_resolve_prefers_root_instances() {
        let mut node = Node::new(NodeId(6), 0);
        let mut switch = CommandClass::new(CommandClassKind::SwitchBinary);
        switch.instances = 2;
        node.add_command_class(switch);
        let mut endpoint = Endpoint::new(3, 0x10, 0x01);
        endpoint.add_command_class(CommandClass::for_endpoint(CommandClassKind::SwitchBinary, 3));
        node.add_endpoint(endpoint);

        assert_eq!(node.resolve_command_class(CommandClassKind::SwitchBinary, 2).unwrap().endpoint, None);
        assert_eq!(node.resolve_command_class(CommandClassKind::SwitchBinary, 3).unwrap().endpoint, Some(3));
        assert!(node.resolve_command_class(CommandClassKind::SwitchBinary, 4).is_none());
    }

    #[test]
    fn test_liveness_and_awake() {
        let mut outbox = Outbox::default();
        let mut node = Node::new(NodeId(2), 0);
        assert_eq!(node.liveness(), Liveness::SLEEPING);

        node.set_awake(true, &mut outbox);
        assert!(outbox.liveness_changed);
        assert!(node.liveness().awake);

        node.frequently_listening = true;
        assert!(node.liveness().listening);
    }

    #[test]
    fn test_routing_list() {
        let mut node = Node::new(NodeId(2), 0);
        node.set_neighbors([NodeId(1), NodeId(3)]);
        assert!(node.routing_list().is_none());
        node.routing = true;
        assert_eq!(node.routing_list(), Some(vec![NodeId(1), NodeId(3)]));
    }

    #[test]
    fn test_dead_after_three_failures() {
        let mut outbox = Outbox::default();
        let mut node = Node::new(NodeId(7), 0);
        node.force_stage(NodeStage::Done);

        assert!(!node.increment_resend_count(&mut outbox));
        assert!(!node.increment_resend_count(&mut outbox));
        assert!(node.increment_resend_count(&mut outbox));
        assert!(!node.increment_resend_count(&mut outbox));

        assert!(node.is_dead());
        assert_eq!(node.dead_count(), 1);
        assert!(node.dead_time().is_some());
        assert_eq!(
            outbox.events,
            vec![Event::NodeStatusChanged { node: NodeId(7), status: NodeStatus::Dead }]
        );
    }
}
