//! Manufacturer-specific and version classes

use tracing::{debug, info, warn};

use crate::core::{Error, NodeId, Result};
use crate::node::{Node, QueryKey, StageEnv};
use crate::protocol::{Message, MessageClass, Priority};
use super::{class_command, CommandClassKind};

const MANUFACTURER_SPECIFIC: u8 = 0x72;
const MANUFACTURER_SPECIFIC_GET: u8 = 0x04;
const MANUFACTURER_SPECIFIC_REPORT: u8 = 0x05;

const VERSION: u8 = 0x86;
const VERSION_COMMAND_CLASS_GET: u8 = 0x13;
const VERSION_COMMAND_CLASS_REPORT: u8 = 0x14;

pub fn manufacturer_specific_get(node: NodeId) -> Message {
    class_command(
        node,
        [MANUFACTURER_SPECIFIC, MANUFACTURER_SPECIFIC_GET],
        Some(MessageClass::ApplicationCommandHandler),
        Priority::Get,
    )
}

pub fn command_class_version_get(node: NodeId, class: CommandClassKind) -> Message {
    class_command(
        node,
        [VERSION, VERSION_COMMAND_CLASS_GET, class.code()],
        Some(MessageClass::ApplicationCommandHandler),
        Priority::Get,
    )
}

pub(crate) fn handle_manufacturer_specific(node: &mut Node, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    if data.first() != Some(&MANUFACTURER_SPECIFIC_REPORT) {
        warn!(node = %node.id(), command = ?data.first(), "unexpected manufacturer specific command");
        return Ok(());
    }
    if data.len() < 7 {
        return Err(Error::protocol("manufacturer specific report too short"));
    }

    node.manufacturer = u16::from_be_bytes([data[1], data[2]]);
    node.device_type = u16::from_be_bytes([data[3], data[4]]);
    node.device_id = u16::from_be_bytes([data[5], data[6]]);
    debug!(
        node = %node.id(),
        manufacturer = format!("{:04X}", node.manufacturer),
        device_type = format!("{:04X}", node.device_type),
        device_id = format!("{:04X}", node.device_id),
        "manufacturer report"
    );

    match env.catalog.find_product(node.manufacturer, node.device_type, node.device_id) {
        Some(product) => {
            info!(node = %node.id(), product = %product.label, "identified product");
            if node.name.is_empty() {
                node.name = product.label.clone();
            }
            node.product = Some(product);
        }
        None => debug!(node = %node.id(), "product not in catalog"),
    }

    node.query_answered(QueryKey::new(1, CommandClassKind::ManufacturerSpecific), env);
    Ok(())
}

pub(crate) fn handle_version(node: &mut Node, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    if data.first() != Some(&VERSION_COMMAND_CLASS_REPORT) {
        warn!(node = %node.id(), command = ?data.first(), "unexpected version command");
        return Ok(());
    }
    if data.len() < 3 {
        return Err(Error::protocol("command class version report too short"));
    }

    let Some(kind) = CommandClassKind::from_code(data[1]) else {
        debug!(node = %node.id(), class = data[1], "version report for unknown class");
        return Ok(());
    };
    let id = node.id();
    let version = data[2];
    if let Some(class) = node.command_class_mut(kind) {
        if version == 0 {
            warn!(node = %id, class = %kind, "node reports class version 0");
        }
        class.version = version.max(1);
    }
    debug!(node = %id, class = %kind, version, "class version");
    node.query_answered(QueryKey::new(1, kind), env);
    Ok(())
}
