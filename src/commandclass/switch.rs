//! Basic, binary switch and switch-all classes

use tracing::{debug, warn};

use crate::controller::Event;
use crate::core::{Error, NodeId, Result};
use crate::node::{Node, QueryKey, StageEnv};
use crate::protocol::{Message, MessageClass, Priority};
use super::{class_command, ClassState, CommandClassKind};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

const BASIC: u8 = 0x20;
const SWITCH_BINARY: u8 = 0x25;
const SWITCH_ALL: u8 = 0x27;

fn get(node: NodeId, class: u8) -> Message {
    class_command(node, [class, GET], Some(MessageClass::ApplicationCommandHandler), Priority::Get)
}

fn set(node: NodeId, class: u8, value: u8) -> Message {
    class_command(node, [class, SET, value], Some(MessageClass::SendData), Priority::Set)
}

pub fn basic_get(node: NodeId) -> Message {
    get(node, BASIC)
}

pub fn basic_set(node: NodeId, value: u8) -> Message {
    set(node, BASIC, value)
}

pub fn binary_get(node: NodeId) -> Message {
    get(node, SWITCH_BINARY)
}

pub fn binary_set(node: NodeId, on: bool) -> Message {
    set(node, SWITCH_BINARY, if on { 0xFF } else { 0x00 })
}

pub fn switch_all_get(node: NodeId) -> Message {
    get(node, SWITCH_ALL)
}

pub fn switch_all_set(node: NodeId, mode: u8) -> Message {
    set(node, SWITCH_ALL, mode)
}

fn value_byte(data: &[u8], kind: CommandClassKind) -> Result<u8> {
    data.get(1)
        .copied()
        .ok_or_else(|| Error::protocol(format!("{} report without value", kind)))
}

fn report(node: &mut Node, kind: CommandClassKind, endpoint: u8, value: u8, env: &mut StageEnv<'_>) {
    if let Some(class) = node.resolve_command_class_mut(kind, endpoint) {
        match &mut class.state {
            ClassState::Basic { value: v } => *v = Some(value),
            ClassState::SwitchBinary { on } => *on = Some(value > 0),
            ClassState::SwitchAll { mode } => *mode = Some(value),
            _ => {}
        }
    }
    debug!(node = %node.id(), endpoint, class = %kind, value, "value report");
    env.outbox.emit(Event::CommandClassValue {
        node: node.id(),
        endpoint,
        command_class: kind,
        value: i32::from(value),
    });
    node.query_answered(QueryKey::new(endpoint, kind), env);
}

pub(crate) fn handle_basic(node: &mut Node, endpoint: u8, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    match data.first() {
        // a node setting us is reporting its own level
        Some(&SET) | Some(&REPORT) => {
            let value = value_byte(data, CommandClassKind::Basic)?;
            report(node, CommandClassKind::Basic, endpoint, value, env);
        }
        Some(&GET) => warn!(node = %node.id(), "basic get from node not supported"),
        other => warn!(node = %node.id(), command = ?other, "unknown basic command"),
    }
    Ok(())
}

pub(crate) fn handle_binary(node: &mut Node, endpoint: u8, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    match data.first() {
        Some(&SET) | Some(&REPORT) => {
            let value = value_byte(data, CommandClassKind::SwitchBinary)?;
            report(node, CommandClassKind::SwitchBinary, endpoint, value, env);
        }
        Some(&GET) => warn!(node = %node.id(), "binary switch get from node not supported"),
        other => warn!(node = %node.id(), command = ?other, "unknown binary switch command"),
    }
    Ok(())
}

pub(crate) fn handle_switch_all(node: &mut Node, endpoint: u8, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    match data.first() {
        Some(&REPORT) => {
            let mode = value_byte(data, CommandClassKind::SwitchAll)?;
            report(node, CommandClassKind::SwitchAll, endpoint, mode, env);
        }
        other => warn!(node = %node.id(), command = ?other, "unexpected switch all command"),
    }
    Ok(())
}
