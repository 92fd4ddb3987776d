//! Command class module
//!
//! A command class groups the commands a node understands for one kind of
//! behavior. Each [`CommandClass`] carries per-class state as a tagged
//! variant; the capabilities (value query, set, initialize, dynamic refresh
//! and incoming report handling) are dispatched by matching on it.

use std::fmt;

use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::core::{Error, NodeId, Result};
use crate::node::{Node, StageEnv};
use crate::protocol::{Message, MessageClass, Priority};

pub mod identity;
pub mod lifecycle;
pub mod multi_instance;
pub mod switch;

/// Marker separating supported from controlled classes in a node info frame
pub const COMMAND_CLASS_MARK: u8 = 0xEF;

/// Command classes this coordinator understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommandClassKind {
    NoOperation,
    Basic,
    SwitchBinary,
    SwitchAll,
    MultiInstance,
    ManufacturerSpecific,
    Hail,
    WakeUp,
    Version,
}

impl CommandClassKind {
    /// Wire code
    pub fn code(&self) -> u8 {
        match self {
            CommandClassKind::NoOperation => 0x00,
            CommandClassKind::Basic => 0x20,
            CommandClassKind::SwitchBinary => 0x25,
            CommandClassKind::SwitchAll => 0x27,
            CommandClassKind::MultiInstance => 0x60,
            CommandClassKind::ManufacturerSpecific => 0x72,
            CommandClassKind::Hail => 0x82,
            CommandClassKind::WakeUp => 0x84,
            CommandClassKind::Version => 0x86,
        }
    }

    /// Looks up a class by wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(CommandClassKind::NoOperation),
            0x20 => Some(CommandClassKind::Basic),
            0x25 => Some(CommandClassKind::SwitchBinary),
            0x27 => Some(CommandClassKind::SwitchAll),
            0x60 => Some(CommandClassKind::MultiInstance),
            0x72 => Some(CommandClassKind::ManufacturerSpecific),
            0x82 => Some(CommandClassKind::Hail),
            0x84 => Some(CommandClassKind::WakeUp),
            0x86 => Some(CommandClassKind::Version),
            _ => None,
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            CommandClassKind::NoOperation => "NO_OPERATION",
            CommandClassKind::Basic => "BASIC",
            CommandClassKind::SwitchBinary => "SWITCH_BINARY",
            CommandClassKind::SwitchAll => "SWITCH_ALL",
            CommandClassKind::MultiInstance => "MULTI_INSTANCE",
            CommandClassKind::ManufacturerSpecific => "MANUFACTURER_SPECIFIC",
            CommandClassKind::Hail => "HAIL",
            CommandClassKind::WakeUp => "WAKE_UP",
            CommandClassKind::Version => "VERSION",
        }
    }
}

impl fmt::Display for CommandClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.label(), self.code())
    }
}

/// Per-class state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClassState {
    NoOperation,
    Basic {
        /// Last reported level
        value: Option<u8>,
    },
    SwitchBinary {
        /// Last reported switch state
        on: Option<bool>,
    },
    SwitchAll {
        /// Participation mode in all-on/all-off broadcasts
        mode: Option<u8>,
    },
    MultiInstance,
    ManufacturerSpecific,
    Hail,
    WakeUp {
        /// Wake-up interval in seconds
        interval: Option<u32>,
        /// Node that receives wake-up notifications
        target: Option<NodeId>,
    },
    Version,
}

impl ClassState {
    /// Initial state for a class
    pub fn for_kind(kind: CommandClassKind) -> Self {
        match kind {
            CommandClassKind::NoOperation => ClassState::NoOperation,
            CommandClassKind::Basic => ClassState::Basic { value: None },
            CommandClassKind::SwitchBinary => ClassState::SwitchBinary { on: None },
            CommandClassKind::SwitchAll => ClassState::SwitchAll { mode: None },
            CommandClassKind::MultiInstance => ClassState::MultiInstance,
            CommandClassKind::ManufacturerSpecific => ClassState::ManufacturerSpecific,
            CommandClassKind::Hail => ClassState::Hail,
            CommandClassKind::WakeUp => ClassState::WakeUp { interval: None, target: None },
            CommandClassKind::Version => ClassState::Version,
        }
    }

    /// Class this state belongs to
    pub fn kind(&self) -> CommandClassKind {
        match self {
            ClassState::NoOperation => CommandClassKind::NoOperation,
            ClassState::Basic { .. } => CommandClassKind::Basic,
            ClassState::SwitchBinary { .. } => CommandClassKind::SwitchBinary,
            ClassState::SwitchAll { .. } => CommandClassKind::SwitchAll,
            ClassState::MultiInstance => CommandClassKind::MultiInstance,
            ClassState::ManufacturerSpecific => CommandClassKind::ManufacturerSpecific,
            ClassState::Hail => CommandClassKind::Hail,
            ClassState::WakeUp { .. } => CommandClassKind::WakeUp,
            ClassState::Version => CommandClassKind::Version,
        }
    }
}

/// A command class supported by a node or one of its endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandClass {
    /// Class version implemented by the node
    pub version: u8,
    /// Number of instances (multi-instance v1)
    pub instances: u8,
    /// Endpoint this class belongs to (multi-channel v2)
    pub endpoint: Option<u8>,
    /// Per-class state
    pub state: ClassState,
}

impl CommandClass {
    /// Creates a class at version 1 with a single instance
    pub fn new(kind: CommandClassKind) -> Self {
        CommandClass {
            version: 1,
            instances: 1,
            endpoint: None,
            state: ClassState::for_kind(kind),
        }
    }

    /// Creates a class owned by an endpoint
    pub fn for_endpoint(kind: CommandClassKind, endpoint: u8) -> Self {
        CommandClass {
            endpoint: Some(endpoint),
            ..CommandClass::new(kind)
        }
    }

    /// Class identifier
    pub fn kind(&self) -> CommandClassKind {
        self.state.kind()
    }

    /// Message reading the current value, if the class has one
    pub fn value_query(&self, node: NodeId) -> Option<Message> {
        match self.state {
            ClassState::Basic { .. } => Some(switch::basic_get(node)),
            ClassState::SwitchBinary { .. } => Some(switch::binary_get(node)),
            ClassState::SwitchAll { .. } => Some(switch::switch_all_get(node)),
            ClassState::WakeUp { .. } => Some(lifecycle::wake_up_interval_get(node)),
            _ => None,
        }
    }

    /// Message setting a new value, if the class accepts one
    pub fn set_value(&self, node: NodeId, value: u8) -> Option<Message> {
        match self.state {
            ClassState::Basic { .. } => Some(switch::basic_set(node, value)),
            ClassState::SwitchBinary { .. } => Some(switch::binary_set(node, value > 0)),
            ClassState::SwitchAll { .. } => Some(switch::switch_all_set(node, value)),
            _ => None,
        }
    }

    /// Queries that collect static configuration during initialization
    pub fn initialize_queries(&self, node: NodeId) -> Vec<Message> {
        match self.state {
            ClassState::SwitchAll { .. } => vec![switch::switch_all_get(node)],
            ClassState::WakeUp { .. } if self.endpoint.is_none() => {
                vec![lifecycle::wake_up_interval_get(node)]
            }
            _ => Vec::new(),
        }
    }

    /// Queries that refresh live values
    pub fn dynamic_queries(&self, node: NodeId) -> Vec<Message> {
        match self.state {
            ClassState::SwitchBinary { .. } => vec![switch::binary_get(node)],
            _ => Vec::new(),
        }
    }
}

/// Builds a send-data request carrying `command` to `node`.
///
/// Fails when the command does not fit in the one-byte length field.
pub fn send_data(
    node: NodeId,
    command: &[u8],
    expected_reply: Option<MessageClass>,
    priority: Priority,
) -> Result<Message> {
    let length = u8::try_from(command.len())
        .map_err(|_| Error::protocol(format!("command of {} bytes does not fit in a frame", command.len())))?;
    Ok(command_message(node, length, command, expected_reply, priority))
}

/// Send-data request for a fixed-size class command
pub(crate) fn class_command<const N: usize>(
    node: NodeId,
    command: [u8; N],
    expected_reply: Option<MessageClass>,
    priority: Priority,
) -> Message {
    const { assert!(N <= u8::MAX as usize) };
    command_message(node, N as u8, &command, expected_reply, priority)
}

fn command_message(
    node: NodeId,
    length: u8,
    command: &[u8],
    expected_reply: Option<MessageClass>,
    priority: Priority,
) -> Message {
    let mut payload = Vec::with_capacity(command.len() + 2);
    payload.push(node.value());
    payload.push(length);
    payload.extend_from_slice(command);
    Message::request(MessageClass::SendData, node, priority)
        .expecting(expected_reply)
        .with_payload(payload)
}

/// Routes an incoming command to the class that understands it.
///
/// `data[0]` is the command id; the class byte has already been consumed.
pub fn handle_incoming(
    node: &mut Node,
    kind: CommandClassKind,
    endpoint: u8,
    data: &[u8],
    env: &mut StageEnv<'_>,
) -> Result<()> {
    if node.resolve_command_class(kind, endpoint).is_none() {
        warn!(node = %node.id(), endpoint, class = %kind, "command class not supported by node");
        return Ok(());
    }
    debug!(node = %node.id(), endpoint, class = %kind, "incoming command");

    match kind {
        CommandClassKind::NoOperation => lifecycle::handle_no_operation(node, env),
        CommandClassKind::Basic => switch::handle_basic(node, endpoint, data, env),
        CommandClassKind::SwitchBinary => switch::handle_binary(node, endpoint, data, env),
        CommandClassKind::SwitchAll => switch::handle_switch_all(node, endpoint, data, env),
        CommandClassKind::MultiInstance => multi_instance::handle(node, data, env),
        CommandClassKind::ManufacturerSpecific => identity::handle_manufacturer_specific(node, data, env),
        CommandClassKind::Version => identity::handle_version(node, data, env),
        CommandClassKind::Hail => lifecycle::handle_hail(node, data, env),
        CommandClassKind::WakeUp => lifecycle::handle_wake_up(node, data, env),
    }
}
