use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::NodeId;
use crate::node::Node;

/// Role of the stick in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ControllerType {
    #[default]
    Unknown,
    Slave,
    Primary,
    Secondary,
    Suc,
}

/// What the stick reported about itself
#[derive(Debug, Clone, Serialize)]
pub struct ControllerInfo {
    /// Firmware version string
    pub version: String,
    pub library_type: u8,
    pub home_id: u32,
    pub own_node_id: NodeId,
    pub serial_api_version: String,
    pub manufacturer: u16,
    pub device_type: u16,
    pub device_id: u16,
    pub controller_type: ControllerType,
    /// Static update controller of the network
    pub suc_id: Option<NodeId>,
}

impl Default for ControllerInfo {
    fn default() -> Self {
        ControllerInfo {
            version: String::new(),
            library_type: 0,
            home_id: 0,
            own_node_id: NodeId(0),
            serial_api_version: String::new(),
            manufacturer: 0,
            device_type: 0,
            device_id: 0,
            controller_type: ControllerType::Unknown,
            suc_id: None,
        }
    }
}

/// Everything the controller owns behind its lock
#[derive(Debug, Default)]
pub struct ControllerState {
    pub nodes: BTreeMap<NodeId, Node>,
    pub info: ControllerInfo,
}

impl ControllerState {
    /// Returns the node, creating it when first seen
    pub fn node_entry(&mut self, id: NodeId) -> &mut Node {
        let home_id = self.info.home_id;
        self.nodes.entry(id).or_insert_with(|| Node::new(id, home_id))
    }
}
