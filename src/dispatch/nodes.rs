//! Handlers for messages about individual nodes

use tracing::{debug, info, trace, warn};

use crate::commandclass::{self, CommandClass, CommandClassKind, COMMAND_CLASS_MARK};
use crate::controller::{Event, InclusionPhase};
use crate::core::{Error, NodeId, Result};
use crate::node::{DeviceClass, NodeStage};
use crate::protocol::{request, Direction, Message, MessageClass};
use crate::util::{bitmap_ids, hex};
use super::admin::NODE_BITMAP_LENGTH;
use super::{DispatchContext, DispatchTable, MessageHandler};

const CAPABILITY_LISTENING: u8 = 0x80;
const CAPABILITY_ROUTING: u8 = 0x40;
const CAPABILITY_VERSION_MASK: u8 = 0x07;
const SECURITY_FREQUENTLY_LISTENING: u8 = 0x60;

const UPDATE_NODE_INFO_RECEIVED: u8 = 0x84;
const UPDATE_NODE_INFO_REQ_DONE: u8 = 0x82;
const UPDATE_NODE_INFO_REQ_FAILED: u8 = 0x81;
const UPDATE_ROUTING_PENDING: u8 = 0x80;
const UPDATE_NEW_ID_ASSIGNED: u8 = 0x40;
const UPDATE_DELETE_DONE: u8 = 0x20;
const UPDATE_SUC_ID: u8 = 0x10;

const TRANSMIT_COMPLETE_OK: u8 = 0x00;

const NEIGHBOR_UPDATE_STARTED: u8 = 0x21;
const NEIGHBOR_UPDATE_DONE: u8 = 0x22;
const NEIGHBOR_UPDATE_FAILED: u8 = 0x23;

const FAILED_NODE_REMOVED: u8 = 0x01;
const FAILED_NODE_NOT_REMOVED: u8 = 0x02;

const NETWORK_LEARN_READY: u8 = 0x01;
const NETWORK_NODE_FOUND: u8 = 0x02;
const NETWORK_ADDING_SLAVE: u8 = 0x03;
const NETWORK_ADDING_CONTROLLER: u8 = 0x04;
const NETWORK_PROTOCOL_DONE: u8 = 0x05;
const NETWORK_DONE: u8 = 0x06;
const NETWORK_FAILED: u8 = 0x07;

pub(super) fn register(table: &mut DispatchTable) {
    table.register(MessageClass::IdentifyNode, IdentifyNode);
    table.register(MessageClass::RequestNodeInfo, RequestNodeInfo);
    table.register(MessageClass::ApplicationUpdate, ApplicationUpdate);
    table.register(MessageClass::ApplicationCommandHandler, ApplicationCommandHandler);
    table.register(MessageClass::SendData, SendData);
    table.register(MessageClass::GetRoutingInfo, GetRoutingInfo);
    table.register(MessageClass::RequestNodeNeighborUpdate, NeighborUpdate);
    table.register(MessageClass::AssignReturnRoute, ReturnRoute("assign return route"));
    table.register(MessageClass::DeleteReturnRoute, ReturnRoute("delete return route"));
    table.register(MessageClass::AssignSucReturnRoute, ReturnRoute("assign SUC return route"));
    table.register(MessageClass::IsFailedNodeId, IsFailedNode);
    table.register(MessageClass::RemoveFailedNodeId, RemoveFailedNode);
    table.register(MessageClass::AddNodeToNetwork, Inclusion { adding: true });
    table.register(MessageClass::RemoveNodeFromNetwork, Inclusion { adding: false });
}

/// Node the in-flight request was about
fn requested_node(last_sent: Option<&Message>, class: MessageClass) -> Result<NodeId> {
    match last_sent {
        Some(last) if last.class == class && last.target_node.is_unicast() => Ok(last.target_node),
        _ => Err(Error::dispatch(format!("{} reply without a matching request", class))),
    }
}

/// Counts a failed delivery and retries while the node is still alive
fn delivery_failed(ctx: &mut DispatchContext<'_>, last: &Message) -> Result<()> {
    let node = last.target_node;
    let alive = ctx.with_node(node, |node, env| {
        node.increment_resend_count(env.outbox);
        !node.is_dead()
    })?;
    if alive && ctx.retry(last) {
        ctx.with_node(node, |node, _| node.increment_retry_count())?;
    }
    Ok(())
}

/// Protocol information the stick keeps about a node
struct IdentifyNode;

impl MessageHandler for IdentifyNode {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let id = requested_node(last_sent, MessageClass::IdentifyNode)?;
        let capability = incoming.payload_byte(0)?;
        let security = incoming.payload_byte(1)?;
        let device_class = DeviceClass::new(
            incoming.payload_byte(3)?,
            incoming.payload_byte(4)?,
            incoming.payload_byte(5)?,
        );
        incoming.target_node = id;

        ctx.with_node(id, |node, env| {
            node.listening = capability & CAPABILITY_LISTENING != 0;
            node.routing = capability & CAPABILITY_ROUTING != 0;
            node.version = (capability & CAPABILITY_VERSION_MASK) + 1;
            node.frequently_listening = security & SECURITY_FREQUENTLY_LISTENING != 0;
            node.device_class = device_class;
            info!(
                node = %id,
                listening = node.listening,
                routing = node.routing,
                version = node.version,
                device_class = %device_class,
                "protocol info"
            );

            if !device_class.is_known() {
                warn!(node = %id, device_class = %device_class, "unknown device class, node stays in protocol info");
                return;
            }
            if node.restore_from(env.store) {
                node.product = env.catalog.find_product(node.manufacturer, node.device_type, node.device_id);
            } else {
                node.add_mandatory_command_classes();
            }
            node.advance(NodeStage::Ping, env);
        })
    }
}

struct RequestNodeInfo;

impl MessageHandler for RequestNodeInfo {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        if incoming.payload_byte(0)? != 0 {
            trace!("node info request placed");
            return Ok(());
        }
        warn!("stick refused node info request");
        if let Some(last) = last_sent.filter(|last| last.class == MessageClass::RequestNodeInfo) {
            incoming.canceled = true;
            ctx.retry(last);
        }
        Ok(())
    }

    fn correlates(&self, last_sent: &Message, incoming: &Message) -> bool {
        last_sent.class == MessageClass::RequestNodeInfo && incoming.canceled
    }
}

/// Node information frames and other network updates
struct ApplicationUpdate;

impl ApplicationUpdate {
    fn node_info(&self, ctx: &mut DispatchContext<'_>, incoming: &mut Message) -> Result<()> {
        let id = NodeId(incoming.payload_byte(1)?);
        let length = usize::from(incoming.payload_byte(2)?);
        incoming.target_node = id;

        // [basic, generic, specific, classes...]
        let classes: Vec<u8> = incoming
            .payload
            .iter()
            .skip(6)
            .take(length.saturating_sub(3))
            .copied()
            .take_while(|&code| code != COMMAND_CLASS_MARK)
            .collect();

        ctx.with_node(id, |node, env| {
            for code in classes {
                match CommandClassKind::from_code(code) {
                    Some(kind) => node.add_command_class(CommandClass::new(kind)),
                    None => trace!(node = %id, class = format_args!("0x{:02X}", code), "skipping unknown class"),
                }
            }
            debug!(node = %id, classes = node.command_classes().count(), "node info received");
            if !node.listening && !node.frequently_listening {
                node.set_awake(true, env.outbox);
            }
            node.mark_responsive(env);
            if node.stage() == NodeStage::Details {
                node.advance(NodeStage::ManufacturerSpec, env);
            }
        })
    }
}

impl MessageHandler for ApplicationUpdate {
    fn handle_request(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        match incoming.payload_byte(0)? {
            UPDATE_NODE_INFO_RECEIVED => self.node_info(ctx, incoming),
            UPDATE_NODE_INFO_REQ_FAILED => {
                incoming.canceled = true;
                match last_sent.filter(|last| last.class == MessageClass::RequestNodeInfo) {
                    Some(last) => {
                        warn!(node = %last.target_node, "node info request failed");
                        delivery_failed(ctx, last)
                    }
                    None => {
                        warn!("node info request failed");
                        Ok(())
                    }
                }
            }
            UPDATE_NODE_INFO_REQ_DONE => {
                trace!("node info request done");
                Ok(())
            }
            UPDATE_SUC_ID => {
                let suc = NodeId(incoming.payload_byte(1)?);
                info!(suc = %suc, "SUC changed");
                ctx.state.info.suc_id = Some(suc).filter(|id| id.value() != 0);
                Ok(())
            }
            UPDATE_ROUTING_PENDING | UPDATE_NEW_ID_ASSIGNED | UPDATE_DELETE_DONE => {
                debug!(payload = %hex(&incoming.payload), "network update");
                Ok(())
            }
            other => {
                warn!(status = format_args!("0x{:02X}", other), "unknown application update");
                Ok(())
            }
        }
    }

    fn correlates(&self, last_sent: &Message, incoming: &Message) -> bool {
        last_sent.expected_reply == Some(MessageClass::ApplicationUpdate)
            && (incoming.canceled || incoming.target_node == last_sent.target_node)
    }
}

/// Commands arriving from nodes
struct ApplicationCommandHandler;

impl MessageHandler for ApplicationCommandHandler {
    fn handle_request(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let source = NodeId(incoming.payload_byte(1)?);
        let length = usize::from(incoming.payload_byte(2)?);
        let code = incoming.payload_byte(3)?;
        let end = (3 + length).min(incoming.payload.len());
        let data = incoming.payload[4..end.max(4)].to_vec();
        incoming.target_node = source;

        if let Some(last) = last_sent {
            if last.expected_reply == Some(MessageClass::ApplicationCommandHandler) && last.target_node != source {
                trace!(expected = %last.target_node, source = %source, "command from another node");
                incoming.canceled = true;
            }
        }

        let Some(kind) = CommandClassKind::from_code(code) else {
            debug!(node = %source, class = format_args!("0x{:02X}", code), "command for unknown class");
            return Ok(());
        };
        ctx.with_node(source, |node, env| {
            node.mark_responsive(env);
            commandclass::handle_incoming(node, kind, 1, &data, env)
        })?
    }

    fn correlates(&self, last_sent: &Message, incoming: &Message) -> bool {
        last_sent.expected_reply == Some(MessageClass::ApplicationCommandHandler) && !incoming.canceled
    }
}

/// Send-data acceptance and delivery callbacks
struct SendData;

impl MessageHandler for SendData {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        if incoming.payload_byte(0)? != 0 {
            return Ok(());
        }
        let Some(last) = last_sent.filter(|last| last.class == MessageClass::SendData) else {
            return Ok(());
        };
        warn!(node = %last.target_node, "stick refused send data");
        incoming.canceled = true;
        ctx.retry(last);
        Ok(())
    }

    fn handle_request(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let callback = incoming.payload_byte(0)?;
        let status = incoming.payload_byte(1)?;
        let Some(last) = last_sent.filter(|last| last.class == MessageClass::SendData && last.callback_id == callback) else {
            debug!(callback, "send data callback for no outstanding request");
            return Ok(());
        };
        incoming.target_node = last.target_node;

        if status == TRANSMIT_COMPLETE_OK {
            return ctx.with_node(last.target_node, |node, env| {
                node.mark_responsive(env);
                if node.stage() == NodeStage::Ping {
                    node.advance(NodeStage::Details, env);
                }
            });
        }
        warn!(node = %last.target_node, status, "send data not delivered");
        incoming.canceled = true;
        delivery_failed(ctx, last)
    }

    fn correlates(&self, last_sent: &Message, incoming: &Message) -> bool {
        if last_sent.class != MessageClass::SendData {
            return false;
        }
        match incoming.direction {
            Direction::Response => incoming.canceled,
            Direction::Request => {
                incoming.payload.first() == Some(&last_sent.callback_id)
                    && (incoming.canceled || last_sent.expected_reply == Some(MessageClass::SendData))
            }
        }
    }
}

/// Neighbor table of a node
struct GetRoutingInfo;

impl MessageHandler for GetRoutingInfo {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let id = requested_node(last_sent, MessageClass::GetRoutingInfo)?;
        let bitmap = incoming
            .payload
            .get(..NODE_BITMAP_LENGTH)
            .ok_or_else(|| Error::protocol("routing info truncated"))?;
        let neighbors: Vec<NodeId> = bitmap_ids(bitmap).map(NodeId).collect();
        debug!(node = %id, neighbors = neighbors.len(), "routing info");
        incoming.target_node = id;
        ctx.with_node(id, |node, _| node.set_neighbors(neighbors))
    }
}

fn last_status(message: &Message) -> Result<u8> {
    message
        .payload
        .last()
        .copied()
        .ok_or_else(|| Error::protocol(format!("{} without status", message.class)))
}

/// Neighbor rediscovery progress
struct NeighborUpdate;

impl MessageHandler for NeighborUpdate {
    fn handle_request(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let status = last_status(incoming)?;
        let node = last_sent
            .filter(|last| last.class == MessageClass::RequestNodeNeighborUpdate)
            .map(|last| last.target_node);
        match status {
            NEIGHBOR_UPDATE_STARTED => debug!("neighbor update started"),
            NEIGHBOR_UPDATE_DONE => {
                info!("neighbor update done");
                if let Some(node) = node {
                    ctx.outbox.send(request::get_routing_info(node));
                }
            }
            NEIGHBOR_UPDATE_FAILED => warn!("neighbor update failed"),
            other => warn!(status = other, "unknown neighbor update status"),
        }
        Ok(())
    }

    fn correlates(&self, last_sent: &Message, incoming: &Message) -> bool {
        last_sent.class == MessageClass::RequestNodeNeighborUpdate
            && matches!(incoming.payload.last(), Some(&NEIGHBOR_UPDATE_DONE) | Some(&NEIGHBOR_UPDATE_FAILED))
    }
}

/// Return route assignment and deletion
struct ReturnRoute(&'static str);

impl MessageHandler for ReturnRoute {
    fn handle_response(&self, _: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        if incoming.payload_byte(0)? == 0 {
            warn!(command = self.0, "stick refused route command");
        }
        Ok(())
    }

    fn handle_request(&self, _: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        match last_status(incoming)? {
            TRANSMIT_COMPLETE_OK => debug!(command = self.0, "route command done"),
            status => warn!(command = self.0, status, "route command failed"),
        }
        Ok(())
    }
}

struct IsFailedNode;

impl MessageHandler for IsFailedNode {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let id = requested_node(last_sent, MessageClass::IsFailedNodeId)?;
        incoming.target_node = id;
        if incoming.payload_byte(0)? != 0 {
            info!(node = %id, "stick reports node as failed");
            ctx.with_node(id, |node, env| node.mark_dead(env.outbox))
        } else {
            debug!(node = %id, "node not failed");
            Ok(())
        }
    }
}

struct RemoveFailedNode;

impl MessageHandler for RemoveFailedNode {
    fn handle_response(&self, _: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let status = incoming.payload_byte(0)?;
        if status != 0 {
            warn!(node = ?last_sent.map(|last| last.target_node), status, "failed node removal not started");
            incoming.canceled = true;
        }
        Ok(())
    }

    fn handle_request(&self, ctx: &mut DispatchContext<'_>, last_sent: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let id = requested_node(last_sent, MessageClass::RemoveFailedNodeId)?;
        incoming.target_node = id;
        match last_status(incoming)? {
            FAILED_NODE_REMOVED => {
                info!(node = %id, "failed node removed");
                remove_node(ctx, id);
            }
            FAILED_NODE_NOT_REMOVED => warn!(node = %id, "failed node could not be removed"),
            _ => info!(node = %id, "node is not failed, left in place"),
        }
        Ok(())
    }

    fn correlates(&self, last_sent: &Message, incoming: &Message) -> bool {
        last_sent.class == MessageClass::RemoveFailedNodeId
            && (incoming.direction == Direction::Request || incoming.canceled)
    }
}

fn remove_node(ctx: &mut DispatchContext<'_>, id: NodeId) {
    ctx.state.nodes.remove(&id);
    if let Err(e) = ctx.store.delete(id) {
        warn!(node = %id, error = %e, "failed to delete stored node");
    }
}

/// Add-node and remove-node progress callbacks
struct Inclusion {
    adding: bool,
}

impl Inclusion {
    fn phase(&self, including: InclusionPhase, excluding: InclusionPhase) -> InclusionPhase {
        if self.adding {
            including
        } else {
            excluding
        }
    }

    fn stop(&self) -> Message {
        if self.adding {
            request::add_node_stop()
        } else {
            request::remove_node_stop()
        }
    }
}

impl MessageHandler for Inclusion {
    fn handle_request(&self, ctx: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let status = incoming.payload_byte(1)?;
        let node = NodeId(incoming.payload.get(2).copied().unwrap_or(0));
        incoming.target_node = node;

        let phase = match status {
            NETWORK_LEARN_READY => self.phase(InclusionPhase::IncludeStart, InclusionPhase::ExcludeStart),
            NETWORK_NODE_FOUND => {
                debug!(adding = self.adding, "node found");
                return Ok(());
            }
            NETWORK_ADDING_SLAVE => self.phase(InclusionPhase::IncludeSlaveFound, InclusionPhase::ExcludeSlaveFound),
            NETWORK_ADDING_CONTROLLER => {
                self.phase(InclusionPhase::IncludeControllerFound, InclusionPhase::ExcludeControllerFound)
            }
            NETWORK_PROTOCOL_DONE => {
                debug!(node = %node, "protocol part done, stopping");
                ctx.outbox.send(self.stop());
                return Ok(());
            }
            NETWORK_DONE => {
                if node.is_unicast() {
                    if self.adding {
                        info!(node = %node, "node included");
                        ctx.state.node_entry(node);
                        ctx.with_node(node, |node, env| node.advance(NodeStage::ProtocolInfo, env))?;
                    } else {
                        info!(node = %node, "node excluded");
                        remove_node(ctx, node);
                    }
                }
                self.phase(InclusionPhase::IncludeDone, InclusionPhase::ExcludeDone)
            }
            NETWORK_FAILED => {
                warn!(adding = self.adding, "inclusion failed");
                ctx.outbox.send(self.stop());
                self.phase(InclusionPhase::IncludeFail, InclusionPhase::ExcludeFail)
            }
            other => {
                warn!(status = other, "unknown inclusion status");
                return Ok(());
            }
        };
        ctx.outbox.emit(Event::Inclusion { node, phase });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::super::Completion;
    use super::*;
    use crate::commandclass::{lifecycle, switch};
    use crate::controller::NodeStatus;
    use crate::core::DEAD_NODE_THRESHOLD;

    fn add_node(fixture: &mut Fixture, id: u8, stage: NodeStage) {
        let node = fixture.state.node_entry(NodeId(id));
        node.listening = true;
        node.force_stage(stage);
    }

    fn callback(id: u8, status: u8) -> Message {
        Message::incoming(MessageClass::SendData, Direction::Request, vec![id, status])
    }

    #[test]
    fn test_identify_node_moves_to_ping() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::ProtocolInfo);
        let sent = request::identify_node(NodeId(7));
        // listening, routing, version 4; binary switch
        let reply = Message::incoming(MessageClass::IdentifyNode, Direction::Response, vec![0xD3, 0x00, 0x00, 0x04, 0x10, 0x01]);

        assert_eq!(fixture.dispatch(Some(&sent), reply), Completion::Complete);
        let node = fixture.node(7);
        assert!(node.listening && node.routing);
        assert_eq!(node.version, 4);
        assert!(node.supports(CommandClassKind::SwitchBinary));
        assert_eq!(node.stage(), NodeStage::Ping);
        assert_eq!(fixture.outbox.messages.len(), 1);
        assert_eq!(fixture.outbox.messages[0].class, MessageClass::SendData);
    }

    #[test]
    fn test_identify_unknown_device_class_stays() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::ProtocolInfo);
        let sent = request::identify_node(NodeId(7));
        let reply = Message::incoming(MessageClass::IdentifyNode, Direction::Response, vec![0xD3, 0, 0, 0x04, 0x77, 0x01]);

        fixture.dispatch(Some(&sent), reply);
        assert_eq!(fixture.node(7).stage(), NodeStage::ProtocolInfo);
        assert!(fixture.outbox.messages.is_empty());
    }

    #[test]
    fn test_identify_unknown_node_is_skipped() {
        let mut fixture = Fixture::new();
        let sent = request::identify_node(NodeId(9));
        let reply = Message::incoming(MessageClass::IdentifyNode, Direction::Response, vec![0xD3, 0, 0, 0x04, 0x10, 0x01]);
        assert_eq!(fixture.dispatch(Some(&sent), reply), Completion::Pending);
        assert!(fixture.state.nodes.is_empty());
    }

    #[test]
    fn test_node_info_adds_classes() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Details);
        let sent = request::request_node_info(NodeId(7));
        let update = Message::incoming(
            MessageClass::ApplicationUpdate,
            Direction::Request,
            vec![0x84, 7, 7, 0x04, 0x10, 0x01, 0x25, 0x72, 0xEF, 0x20],
        );

        assert_eq!(fixture.dispatch(Some(&sent), update), Completion::Complete);
        let node = fixture.node(7);
        assert!(node.supports(CommandClassKind::SwitchBinary));
        assert!(node.supports(CommandClassKind::ManufacturerSpecific));
        assert_eq!(node.stage(), NodeStage::ManufacturerSpec);
        assert_eq!(node.pending_queries(), 1);
    }

    #[test]
    fn test_node_info_from_other_node_does_not_complete() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Details);
        add_node(&mut fixture, 8, NodeStage::Done);
        let sent = request::request_node_info(NodeId(7));
        let update = Message::incoming(MessageClass::ApplicationUpdate, Direction::Request, vec![0x84, 8, 3, 0x04, 0x10, 0x01]);
        assert_eq!(fixture.dispatch(Some(&sent), update), Completion::Pending);
    }

    #[test]
    fn test_node_info_failure_retries() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Details);
        let sent = request::request_node_info(NodeId(7));
        let update = Message::incoming(MessageClass::ApplicationUpdate, Direction::Request, vec![0x81, 0, 0]);

        assert_eq!(fixture.dispatch(Some(&sent), update), Completion::Resolved);
        assert_eq!(fixture.node(7).resend_count(), 1);
        assert_eq!(fixture.outbox.messages.len(), 1);
        assert_eq!(fixture.outbox.messages[0].class, MessageClass::RequestNodeInfo);
    }

    #[test]
    fn test_send_data_callback_advances_ping() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Ping);
        let mut sent = lifecycle::no_operation(NodeId(7));
        sent.callback_id = 5;

        assert_eq!(fixture.dispatch(Some(&sent), callback(6, 0)), Completion::Pending);
        assert_eq!(fixture.node(7).stage(), NodeStage::Ping);

        assert_eq!(fixture.dispatch(Some(&sent), callback(5, 0)), Completion::Complete);
        assert_eq!(fixture.node(7).stage(), NodeStage::Details);
        assert_eq!(fixture.outbox.messages[0].class, MessageClass::RequestNodeInfo);
    }

    #[test]
    fn test_send_data_callback_waits_for_report() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Done);
        let mut sent = switch::binary_get(NodeId(7));
        sent.callback_id = 9;
        assert_eq!(fixture.dispatch(Some(&sent), callback(9, 0)), Completion::Pending);
    }

    #[test]
    fn test_send_data_failure_kills_node() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Done);
        let mut sent = switch::binary_get(NodeId(7));
        sent.callback_id = 9;

        for attempt in 1..=DEAD_NODE_THRESHOLD {
            assert_eq!(fixture.dispatch(Some(&sent), callback(9, 1)), Completion::Resolved);
            assert_eq!(fixture.node(7).resend_count(), attempt);
        }
        assert!(fixture.node(7).is_dead());
        assert_eq!(fixture.node(7).retry_count(), DEAD_NODE_THRESHOLD - 1);
        assert_eq!(
            fixture.outbox.events,
            vec![Event::NodeStatusChanged { node: NodeId(7), status: NodeStatus::Dead }]
        );
    }

    #[test]
    fn test_command_from_expected_node() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Done);
        fixture
            .state
            .node_entry(NodeId(7))
            .add_command_class(CommandClass::new(CommandClassKind::SwitchBinary));
        let sent = switch::binary_get(NodeId(7));
        let report = Message::incoming(
            MessageClass::ApplicationCommandHandler,
            Direction::Request,
            vec![0x00, 7, 3, 0x25, 0x03, 0xFF],
        );

        assert_eq!(fixture.dispatch(Some(&sent), report), Completion::Complete);
        assert_eq!(
            fixture.outbox.events,
            vec![Event::CommandClassValue {
                node: NodeId(7),
                endpoint: 1,
                command_class: CommandClassKind::SwitchBinary,
                value: 255,
            }]
        );
    }

    #[test]
    fn test_command_from_other_node_is_handled_but_pending() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Done);
        add_node(&mut fixture, 8, NodeStage::Done);
        let sent = switch::binary_get(NodeId(7));
        let report = Message::incoming(
            MessageClass::ApplicationCommandHandler,
            Direction::Request,
            vec![0x00, 8, 3, 0x20, 0x03, 0x10],
        );

        assert_eq!(fixture.dispatch(Some(&sent), report), Completion::Pending);
        assert_eq!(fixture.outbox.events.len(), 1);
        assert_eq!(fixture.outbox.events[0].node(), Some(NodeId(8)));
    }

    #[test]
    fn test_routing_info_sets_neighbors() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Done);
        let sent = request::get_routing_info(NodeId(7));
        let mut bitmap = vec![0u8; NODE_BITMAP_LENGTH];
        bitmap[0] = 0b0000_0101;
        let reply = Message::incoming(MessageClass::GetRoutingInfo, Direction::Response, bitmap);

        assert_eq!(fixture.dispatch(Some(&sent), reply), Completion::Complete);
        let neighbors: Vec<NodeId> = fixture.node(7).neighbors().collect();
        assert_eq!(neighbors, vec![NodeId(1), NodeId(3)]);
    }

    #[test]
    fn test_neighbor_update_done_reads_routes() {
        let mut fixture = Fixture::new();
        let sent = request::request_node_neighbor_update(NodeId(7));
        let started = Message::incoming(MessageClass::RequestNodeNeighborUpdate, Direction::Request, vec![0, 0x21]);
        assert_eq!(fixture.dispatch(Some(&sent), started), Completion::Pending);

        let done = Message::incoming(MessageClass::RequestNodeNeighborUpdate, Direction::Request, vec![0, 0x22]);
        assert_eq!(fixture.dispatch(Some(&sent), done), Completion::Complete);
        assert_eq!(fixture.outbox.messages[0].class, MessageClass::GetRoutingInfo);
    }

    #[test]
    fn test_is_failed_node_marks_dead() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Done);
        let sent = request::is_failed_node(NodeId(7));
        let reply = Message::incoming(MessageClass::IsFailedNodeId, Direction::Response, vec![1]);
        fixture.dispatch(Some(&sent), reply);
        assert!(fixture.node(7).is_dead());
    }

    #[test]
    fn test_remove_failed_node() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 7, NodeStage::Dead);
        let sent = request::remove_failed_node(NodeId(7));
        let accepted = Message::incoming(MessageClass::RemoveFailedNodeId, Direction::Response, vec![0]);
        assert_eq!(fixture.dispatch(Some(&sent), accepted), Completion::Pending);

        let removed = Message::incoming(MessageClass::RemoveFailedNodeId, Direction::Request, vec![0, 0x01]);
        assert_eq!(fixture.dispatch(Some(&sent), removed), Completion::Complete);
        assert!(!fixture.state.nodes.contains_key(&NodeId(7)));
    }

    #[test]
    fn test_inclusion_sequence() {
        let mut fixture = Fixture::new();
        let sent = request::add_node_start();
        let status = |status: u8, node: u8| {
            Message::incoming(MessageClass::AddNodeToNetwork, Direction::Request, vec![0, status, node, 0])
        };

        assert_eq!(fixture.dispatch(Some(&sent), status(0x01, 0)), Completion::Complete);
        fixture.dispatch(None, status(0x03, 9));
        fixture.dispatch(None, status(0x05, 9));
        fixture.dispatch(None, status(0x06, 9));

        let phases: Vec<InclusionPhase> = fixture
            .outbox
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Inclusion { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![InclusionPhase::IncludeStart, InclusionPhase::IncludeSlaveFound, InclusionPhase::IncludeDone]
        );
        assert_eq!(fixture.node(9).stage(), NodeStage::ProtocolInfo);
        let classes: Vec<MessageClass> = fixture.outbox.messages.iter().map(|m| m.class).collect();
        assert_eq!(classes, vec![MessageClass::AddNodeToNetwork, MessageClass::IdentifyNode]);
    }

    #[test]
    fn test_exclusion_removes_node() {
        let mut fixture = Fixture::new();
        add_node(&mut fixture, 9, NodeStage::Done);
        let done = Message::incoming(MessageClass::RemoveNodeFromNetwork, Direction::Request, vec![0, 0x06, 9, 0]);
        fixture.dispatch(None, done);

        assert!(!fixture.state.nodes.contains_key(&NodeId(9)));
        assert_eq!(
            fixture.outbox.events,
            vec![Event::Inclusion { node: NodeId(9), phase: InclusionPhase::ExcludeDone }]
        );
    }
}
