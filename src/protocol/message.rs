use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Deserialize};

use crate::core::{Error, NodeId, Result, MAX_ATTEMPTS};
use crate::util::hex;

/// Process-wide message sequence counter
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Transmit option: request a link-level acknowledgement from the node
pub const TRANSMIT_OPTION_ACK: u8 = 0x01;
/// Transmit option: let the stick pick a route
pub const TRANSMIT_OPTION_AUTO_ROUTE: u8 = 0x04;
/// Transmit option: allow explorer frames
pub const TRANSMIT_OPTION_EXPLORE: u8 = 0x20;
/// Options applied to every send-data request
pub const DEFAULT_TRANSMIT_OPTIONS: u8 =
    TRANSMIT_OPTION_ACK | TRANSMIT_OPTION_AUTO_ROUTE | TRANSMIT_OPTION_EXPLORE;

macro_rules! message_classes {
    ($($(#[$meta:meta])* $name:ident = $code:literal),+ $(,)?) => {
        /// Operation codes understood by the controller stick
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum MessageClass {
            $($(#[$meta])* $name,)+
        }

        impl MessageClass {
            /// Every known class, in code order
            pub const ALL: &'static [MessageClass] = &[$(MessageClass::$name,)+];

            /// Wire code of this class
            pub fn code(&self) -> u8 {
                match self {
                    $(MessageClass::$name => $code,)+
                }
            }

            /// Human readable label
            pub fn label(&self) -> &'static str {
                match self {
                    $(MessageClass::$name => stringify!($name),)+
                }
            }

            /// Looks up a class by wire code
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(MessageClass::$name),)+
                    _ => None,
                }
            }
        }
    };
}

message_classes! {
    /// List of devices known to the stick
    GetDeviceList = 0x01,
    /// Initial information about nodes in the network
    SerialApiGetInitData = 0x02,
    SerialApiApplicationNodeInfo = 0x03,
    /// Unsolicited command from a node
    ApplicationCommandHandler = 0x04,
    /// Primary role and SUC/SIS availability
    GetControllerCapabilities = 0x05,
    SerialApiSetTimeouts = 0x06,
    SerialApiGetCapabilities = 0x07,
    /// Restarts the radio chip
    SerialApiSoftReset = 0x08,
    SetSwitch = 0x09,
    RfReceiveMode = 0x10,
    SetSleepMode = 0x11,
    SendNodeInfo = 0x12,
    /// Carries a command to a node
    SendData = 0x13,
    SendDataMulti = 0x14,
    /// Stick firmware version
    GetVersion = 0x15,
    /// Aborts the send-data in progress
    SendDataAbort = 0x16,
    RfPowerLevelSet = 0x17,
    SendDataMeta = 0x18,
    GetRandom = 0x1C,
    /// Home id and own node id
    MemoryGetId = 0x20,
    MemoryGetByte = 0x21,
    MemoryPutByte = 0x22,
    ReadMemory = 0x23,
    WriteMemory = 0x24,
    PermitJoin = 0x30,
    SetLearnNodeState = 0x40,
    /// Protocol information of a node
    IdentifyNode = 0x41,
    SetDefault = 0x42,
    NewController = 0x43,
    ReplicationCommandComplete = 0x44,
    ReplicationSendData = 0x45,
    AssignReturnRoute = 0x46,
    DeleteReturnRoute = 0x47,
    RequestNodeNeighborUpdate = 0x48,
    /// Node information frames and update notices
    ApplicationUpdate = 0x49,
    AddNodeToNetwork = 0x4A,
    RemoveNodeFromNetwork = 0x4B,
    CreateNewPrimary = 0x4C,
    ControllerChange = 0x4D,
    SetLearnMode = 0x50,
    AssignSucReturnRoute = 0x51,
    EnableSuc = 0x52,
    RequestNetworkUpdate = 0x53,
    SetSucNodeId = 0x54,
    DeleteSucReturnRoute = 0x55,
    GetSucNodeId = 0x56,
    SendSucId = 0x57,
    RequestNodeNeighborUpdateOptions = 0x5A,
    /// Asks a node for its supported command classes
    RequestNodeInfo = 0x60,
    RemoveFailedNodeId = 0x61,
    IsFailedNodeId = 0x62,
    ReplaceFailedNode = 0x63,
    /// Neighbor table of a node
    GetRoutingInfo = 0x80,
    LockRoute = 0x90,
    SerialApiSlaveNodeInfo = 0xA0,
    ApplicationSlaveCommandHandler = 0xA1,
    SendSlaveNodeInfo = 0xA2,
    SendSlaveData = 0xA3,
    SetSlaveLearnMode = 0xA4,
    GetVirtualNodes = 0xA5,
    IsVirtualNode = 0xA6,
    WatchDogEnable = 0xB6,
    WatchDogDisable = 0xB7,
    WatchDogKick = 0xB8,
    RfPowerLevelGet = 0xBA,
    GetLibraryType = 0xBD,
    SendTestFrame = 0xBE,
    GetProtocolStatus = 0xBF,
    SetPromiscuousMode = 0xD0,
    PromiscuousApplicationCommandHandler = 0xD1,
}

impl MessageClass {
    /// Whether messages of this class are delivered to a node over the air
    pub fn is_node_bound(&self) -> bool {
        matches!(self, MessageClass::SendData | MessageClass::RequestNodeInfo)
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.label(), self.code())
    }
}

/// Direction of a frame, carried in byte 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to stick, or an unsolicited stick callback
    Request,
    /// Stick answer to a request
    Response,
}

impl Direction {
    /// Wire value of the direction byte
    pub fn code(&self) -> u8 {
        match self {
            Direction::Request => 0x00,
            Direction::Response => 0x01,
        }
    }

    /// Parses the direction byte
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Direction::Request),
            0x01 => Some(Direction::Response),
            _ => None,
        }
    }
}

/// Queue priority tier, highest precedence first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Set,
    Get,
    Low,
}

/// One protocol exchange with the controller stick
#[derive(Debug, Clone)]
pub struct Message {
    /// Operation code
    pub class: MessageClass,
    /// Request or response
    pub direction: Direction,
    /// Frame payload without the send-data trailer
    pub payload: Vec<u8>,
    /// Queue priority tier
    pub priority: Priority,
    /// Class of the message that completes this transaction
    pub expected_reply: Option<MessageClass>,
    /// Node this message is about, broadcast when none
    pub target_node: NodeId,
    /// Creation order, used as the final queue tie-break
    pub sequence: u64,
    /// Retries left before the message is discarded
    pub attempts_remaining: u8,
    /// Callback id of a send-data request
    pub callback_id: u8,
    /// Transmit options of a send-data request
    pub transmit_options: u8,
    /// Set by handlers when an incoming message must not complete a transaction
    pub canceled: bool,
}

impl Message {
    /// Creates a message with an empty payload
    pub fn new(
        class: MessageClass,
        direction: Direction,
        target_node: NodeId,
        expected_reply: Option<MessageClass>,
        priority: Priority,
    ) -> Self {
        Message {
            class,
            direction,
            payload: Vec::new(),
            priority,
            expected_reply,
            target_node,
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            attempts_remaining: MAX_ATTEMPTS,
            callback_id: 0,
            transmit_options: 0,
            canceled: false,
        }
    }

    /// Creates an outbound request that expects an answer of the same class
    pub fn request(class: MessageClass, target_node: NodeId, priority: Priority) -> Self {
        Message::new(class, Direction::Request, target_node, Some(class), priority)
    }

    /// Creates a message decoded from the wire
    pub fn incoming(class: MessageClass, direction: Direction, payload: Vec<u8>) -> Self {
        Message::new(class, direction, NodeId::BROADCAST, None, Priority::Low).with_payload(payload)
    }

    /// Replaces the payload
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Replaces the expected reply class
    pub fn expecting(mut self, reply: Option<MessageClass>) -> Self {
        self.expected_reply = reply;
        self
    }

    /// Appends bytes to the payload
    pub fn push_payload(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    /// Payload byte at `index`
    pub fn payload_byte(&self, index: usize) -> Result<u8> {
        self.payload.get(index).copied().ok_or_else(|| {
            Error::protocol(format!(
                "{} payload too short: wanted byte {}, have {}",
                self.class,
                index,
                self.payload.len()
            ))
        })
    }

    /// Whether the frame carries the send-data trailer
    pub fn has_send_data_trailer(&self) -> bool {
        self.class == MessageClass::SendData && self.direction == Direction::Request
    }

    /// Whether this message travels to a node over the air
    pub fn is_node_bound(&self) -> bool {
        self.class.is_node_bound() && self.target_node.is_unicast()
    }
}

/// Equality over the fields carried on the wire
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        let trailer_eq = !self.has_send_data_trailer()
            || (self.callback_id == other.callback_id
                && self.transmit_options == other.transmit_options);
        self.class == other.class
            && self.direction == other.direction
            && self.payload == other.payload
            && trailer_eq
    }
}

impl Eq for Message {}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} node={} payload=[{}]",
            self.direction,
            self.class,
            self.target_node,
            hex(&self.payload)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_codes() {
        assert_eq!(MessageClass::SendData.code(), 0x13);
        assert_eq!(MessageClass::from_code(0x41), Some(MessageClass::IdentifyNode));
        assert_eq!(MessageClass::from_code(0xFE), None);
        assert_eq!(MessageClass::GetVersion.to_string(), "GetVersion (0x15)");
    }

    #[test]
    fn test_class_codes_unique() {
        for (i, a) in MessageClass::ALL.iter().enumerate() {
            for b in &MessageClass::ALL[i + 1..] {
                assert_ne!(a.code(), b.code(), "{:?} and {:?} share a code", a, b);
            }
            assert_eq!(MessageClass::from_code(a.code()), Some(*a));
        }
    }

    #[test]
    fn test_sequence_increases() {
        let a = Message::request(MessageClass::GetVersion, NodeId::BROADCAST, Priority::High);
        let b = Message::request(MessageClass::GetVersion, NodeId::BROADCAST, Priority::High);
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Set);
        assert!(Priority::Set < Priority::Get);
        assert!(Priority::Get < Priority::Low);
    }

    #[test]
    fn test_payload_byte() {
        let msg = Message::incoming(MessageClass::MemoryGetId, Direction::Response, vec![1, 2]);
        assert_eq!(msg.payload_byte(1).unwrap(), 2);
        assert!(matches!(msg.payload_byte(2), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_equality_ignores_local_fields() {
        let mut a = Message::request(MessageClass::SendData, NodeId(4), Priority::Get)
            .with_payload(vec![4, 1, 0]);
        a.callback_id = 9;
        let mut b = a.clone();
        b.attempts_remaining = 0;
        b.priority = Priority::Low;
        assert_eq!(a, b);

        b.callback_id = 10;
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_bound() {
        let msg = Message::request(MessageClass::RequestNodeInfo, NodeId(3), Priority::Get);
        assert!(msg.is_node_bound());
        let msg = Message::request(MessageClass::RequestNodeInfo, NodeId::BROADCAST, Priority::Get);
        assert!(!msg.is_node_bound());
        let msg = Message::request(MessageClass::IdentifyNode, NodeId(3), Priority::High);
        assert!(!msg.is_node_bound());
    }
}
