//! Handlers for the stick's own administration replies

use tracing::{debug, info, warn};

use crate::controller::ControllerType;
use crate::core::{Error, NodeId, Result};
use crate::node::NodeStage;
use crate::protocol::{request, Message, MessageClass};
use crate::util::bitmap_ids;
use super::{DispatchContext, DispatchTable, MessageHandler};

/// Length of the node bitmap in init data and routing info
pub(crate) const NODE_BITMAP_LENGTH: usize = 29;

const VERSION_LENGTH: usize = 12;

const INIT_CAPABILITY_SLAVE_API: u8 = 0x01;
const INIT_CAPABILITY_SECONDARY: u8 = 0x04;
const INIT_CAPABILITY_SUC: u8 = 0x08;

const CONTROLLER_IS_SECONDARY: u8 = 0x01;
const CONTROLLER_IS_SUC: u8 = 0x10;

pub(super) fn register(table: &mut DispatchTable) {
    table.register(MessageClass::GetVersion, GetVersion);
    table.register(MessageClass::MemoryGetId, MemoryGetId);
    table.register(MessageClass::SerialApiGetCapabilities, SerialApiGetCapabilities);
    table.register(MessageClass::SerialApiGetInitData, SerialApiGetInitData);
    table.register(MessageClass::GetSucNodeId, GetSucNodeId);
    table.register(MessageClass::GetControllerCapabilities, GetControllerCapabilities);
    table.register(MessageClass::EnableSuc, Acknowledged("enable SUC"));
    table.register(MessageClass::SetSucNodeId, Acknowledged("set SUC node id"));
    table.register(MessageClass::SerialApiSoftReset, SoftReset);
}

fn u16_at(message: &Message, index: usize) -> Result<u16> {
    Ok(u16::from_be_bytes([message.payload_byte(index)?, message.payload_byte(index + 1)?]))
}

struct GetVersion;

impl MessageHandler for GetVersion {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let library_type = incoming.payload_byte(VERSION_LENGTH)?;
        let version = String::from_utf8_lossy(&incoming.payload[..VERSION_LENGTH])
            .trim_end_matches('\0')
            .trim()
            .to_string();
        info!(version = %version, library_type, "stick version");
        ctx.state.info.version = version;
        ctx.state.info.library_type = library_type;
        Ok(())
    }
}

struct MemoryGetId;

impl MessageHandler for MemoryGetId {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let own = incoming.payload_byte(4)?;
        let home_id = u32::from_be_bytes([
            incoming.payload[0],
            incoming.payload[1],
            incoming.payload[2],
            incoming.payload[3],
        ]);
        info!(home_id = format_args!("{:08X}", home_id), own_node = own, "network identity");
        ctx.state.info.home_id = home_id;
        ctx.state.info.own_node_id = NodeId(own);
        Ok(())
    }
}

struct SerialApiGetCapabilities;

impl MessageHandler for SerialApiGetCapabilities {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let info = &mut ctx.state.info;
        info.serial_api_version = format!("{}.{}", incoming.payload_byte(0)?, incoming.payload_byte(1)?);
        info.manufacturer = u16_at(incoming, 2)?;
        info.device_type = u16_at(incoming, 4)?;
        info.device_id = u16_at(incoming, 6)?;
        debug!(
            api = %info.serial_api_version,
            manufacturer = format_args!("{:04X}", info.manufacturer),
            device_type = format_args!("{:04X}", info.device_type),
            device_id = format_args!("{:04X}", info.device_id),
            "serial API capabilities"
        );
        ctx.outbox.send(request::serial_api_get_init_data());
        Ok(())
    }
}

struct SerialApiGetInitData;

impl MessageHandler for SerialApiGetInitData {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let capabilities = incoming.payload_byte(1)?;
        let length = usize::from(incoming.payload_byte(2)?);
        if length != NODE_BITMAP_LENGTH {
            return Err(Error::protocol(format!("init data bitmap has {} bytes", length)));
        }
        let bitmap = incoming
            .payload
            .get(3..3 + NODE_BITMAP_LENGTH)
            .ok_or_else(|| Error::protocol("init data truncated"))?;

        debug!(
            slave_api = capabilities & INIT_CAPABILITY_SLAVE_API != 0,
            secondary = capabilities & INIT_CAPABILITY_SECONDARY != 0,
            suc = capabilities & INIT_CAPABILITY_SUC != 0,
            "init data"
        );

        let ids: Vec<NodeId> = bitmap_ids(bitmap).map(NodeId).collect();
        info!(nodes = ids.len(), "network members reported");
        for id in ids {
            ctx.state.node_entry(id);
            ctx.with_node(id, |node, env| node.advance(NodeStage::ProtocolInfo, env))?;
        }
        Ok(())
    }
}

/// Reconciles the SUC role of the stick with the configuration
struct GetSucNodeId;

impl MessageHandler for GetSucNodeId {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let suc = NodeId(incoming.payload_byte(0)?);
        let own = ctx.state.info.own_node_id;

        if suc.value() == 0 {
            ctx.state.info.suc_id = None;
            if ctx.config.is_suc {
                info!("no SUC in the network, taking the role");
                ctx.outbox.send(request::enable_suc(true));
                ctx.outbox.send(request::set_suc_node_id(own, true));
            }
        } else {
            debug!(suc = %suc, "SUC present");
            ctx.state.info.suc_id = Some(suc);
            if suc == own && !ctx.config.is_suc {
                info!("giving up the SUC role");
                ctx.outbox.send(request::enable_suc(false));
                ctx.outbox.send(request::set_suc_node_id(own, false));
                ctx.state.info.suc_id = None;
            }
        }
        ctx.outbox.send(request::get_controller_capabilities());
        Ok(())
    }
}

struct GetControllerCapabilities;

impl MessageHandler for GetControllerCapabilities {
    fn handle_response(&self, ctx: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        let flags = incoming.payload_byte(0)?;
        let controller_type = if flags & CONTROLLER_IS_SUC != 0 {
            ControllerType::Suc
        } else if flags & CONTROLLER_IS_SECONDARY != 0 {
            ControllerType::Secondary
        } else {
            ControllerType::Primary
        };
        info!(role = ?controller_type, "controller capabilities");
        ctx.state.info.controller_type = controller_type;
        Ok(())
    }
}

/// Replies that only say whether the stick accepted a command
struct Acknowledged(&'static str);

impl MessageHandler for Acknowledged {
    fn handle_response(&self, _: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        if incoming.payload_byte(0)? == 0 {
            warn!(command = self.0, "stick rejected command");
        } else {
            debug!(command = self.0, "stick accepted command");
        }
        Ok(())
    }

    fn handle_request(&self, _: &mut DispatchContext<'_>, _: Option<&Message>, incoming: &mut Message) -> Result<()> {
        debug!(command = self.0, payload = %crate::util::hex(&incoming.payload), "callback");
        Ok(())
    }
}

struct SoftReset;

impl MessageHandler for SoftReset {
    fn handle_response(&self, _: &mut DispatchContext<'_>, _: Option<&Message>, _: &mut Message) -> Result<()> {
        debug!("soft reset answered");
        Ok(())
    }
}
