//! Builders for controller administration requests

use crate::core::NodeId;
use super::message::{Direction, Message, MessageClass, Priority};

/// Add/remove mode: any node
pub const NODE_ANY: u8 = 0x01;
/// Add/remove mode: stop
pub const NODE_STOP: u8 = 0x05;
/// Add/remove option: transmit at full power
pub const OPTION_HIGH_POWER: u8 = 0x80;

/// Capability flag of `EnableSuc`: also act as SIS
const SUC_FUNC_NODEID_SERVER: u8 = 0x01;

fn admin(class: MessageClass) -> Message {
    Message::request(class, NodeId::BROADCAST, Priority::High)
}

fn for_node(class: MessageClass, node: NodeId, priority: Priority) -> Message {
    Message::request(class, node, priority).with_payload(vec![node.value()])
}

/// Asks the stick for the protocol information it holds about `node`
pub fn identify_node(node: NodeId) -> Message {
    for_node(MessageClass::IdentifyNode, node, Priority::High)
}

/// Asks `node` for its node information frame
pub fn request_node_info(node: NodeId) -> Message {
    for_node(MessageClass::RequestNodeInfo, node, Priority::Get)
        .expecting(Some(MessageClass::ApplicationUpdate))
}

pub fn get_version() -> Message {
    admin(MessageClass::GetVersion)
}

pub fn memory_get_id() -> Message {
    admin(MessageClass::MemoryGetId)
}

pub fn serial_api_get_capabilities() -> Message {
    admin(MessageClass::SerialApiGetCapabilities)
}

pub fn serial_api_get_init_data() -> Message {
    admin(MessageClass::SerialApiGetInitData)
}

pub fn get_suc_node_id() -> Message {
    admin(MessageClass::GetSucNodeId)
}

pub fn get_controller_capabilities() -> Message {
    admin(MessageClass::GetControllerCapabilities)
}

/// Turns the SUC function of the stick on or off
pub fn enable_suc(enable: bool) -> Message {
    admin(MessageClass::EnableSuc).with_payload(vec![u8::from(enable), SUC_FUNC_NODEID_SERVER])
}

/// Makes `node` the SUC of the network
pub fn set_suc_node_id(node: NodeId, enable: bool) -> Message {
    // [node, enable, low power, capabilities]
    admin(MessageClass::SetSucNodeId).with_payload(vec![node.value(), u8::from(enable), 0x00, SUC_FUNC_NODEID_SERVER])
}

/// Reads the neighbor table of `node`
pub fn get_routing_info(node: NodeId) -> Message {
    // [node, remove bad links, remove non-repeaters, function id]
    Message::request(MessageClass::GetRoutingInfo, node, Priority::Get).with_payload(vec![node.value(), 0x00, 0x00, 0x03])
}

pub fn request_node_neighbor_update(node: NodeId) -> Message {
    for_node(MessageClass::RequestNodeNeighborUpdate, node, Priority::Low)
}

pub fn add_node_start() -> Message {
    admin(MessageClass::AddNodeToNetwork).with_payload(vec![NODE_ANY | OPTION_HIGH_POWER])
}

pub fn add_node_stop() -> Message {
    admin(MessageClass::AddNodeToNetwork).with_payload(vec![NODE_STOP])
}

pub fn remove_node_start() -> Message {
    admin(MessageClass::RemoveNodeFromNetwork).with_payload(vec![NODE_ANY | OPTION_HIGH_POWER])
}

pub fn remove_node_stop() -> Message {
    admin(MessageClass::RemoveNodeFromNetwork).with_payload(vec![NODE_STOP])
}

/// Removes a node the stick considers failed
pub fn remove_failed_node(node: NodeId) -> Message {
    for_node(MessageClass::RemoveFailedNodeId, node, Priority::Set)
}

/// Asks whether the stick considers `node` failed
pub fn is_failed_node(node: NodeId) -> Message {
    for_node(MessageClass::IsFailedNodeId, node, Priority::Get)
}

pub fn delete_return_route(node: NodeId) -> Message {
    for_node(MessageClass::DeleteReturnRoute, node, Priority::Set)
}

/// Tells `node` how to reach `destination`
pub fn assign_return_route(node: NodeId, destination: NodeId) -> Message {
    Message::request(MessageClass::AssignReturnRoute, node, Priority::Set)
        .with_payload(vec![node.value(), destination.value()])
}

pub fn assign_suc_return_route(node: NodeId) -> Message {
    for_node(MessageClass::AssignSucReturnRoute, node, Priority::Set)
}

/// Restarts the stick's radio chip; no answer is expected
pub fn soft_reset() -> Message {
    Message::new(MessageClass::SerialApiSoftReset, Direction::Request, NodeId::BROADCAST, None, Priority::High)
}

/// Aborts the send-data in progress; no answer is expected
pub fn send_data_abort() -> Message {
    Message::new(MessageClass::SendDataAbort, Direction::Request, NodeId::BROADCAST, None, Priority::High)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_requests() {
        let msg = identify_node(NodeId(5));
        assert_eq!(msg.payload, vec![5]);
        assert_eq!(msg.expected_reply, Some(MessageClass::IdentifyNode));
        assert_eq!(msg.target_node, NodeId(5));

        let msg = request_node_info(NodeId(5));
        assert_eq!(msg.expected_reply, Some(MessageClass::ApplicationUpdate));
        assert!(msg.is_node_bound());

        assert_eq!(get_routing_info(NodeId(5)).payload, vec![5, 0, 0, 3]);
    }

    #[test]
    fn test_admin_requests() {
        assert!(get_version().payload.is_empty());
        assert_eq!(get_version().priority, Priority::High);
        assert_eq!(add_node_start().payload, vec![0x81]);
        assert_eq!(remove_node_stop().payload, vec![0x05]);
        assert_eq!(soft_reset().expected_reply, None);
        assert!(!soft_reset().is_node_bound());
    }
}
