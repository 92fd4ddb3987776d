//! Protocol implementation module
//!
//! This module defines the stick's wire frames, the message model and the
//! priority queue that feeds the send worker.

pub mod codec;
pub mod message;
pub mod queue;
pub mod request;

pub use self::codec::{checksum, decode_frame, encode_frame, LinkCodec, LinkFrame};
pub use self::message::{Direction, Message, MessageClass, Priority, DEFAULT_TRANSMIT_OPTIONS};
pub use self::queue::{Liveness, SendQueue};

// Link-level control bytes
/// Start of frame
pub const SOF: u8 = 0x01;
/// Acknowledge
pub const ACK: u8 = 0x06;
/// Negative acknowledge
pub const NAK: u8 = 0x15;
/// Cancel
pub const CAN: u8 = 0x18;

/// Largest value of the length byte
pub const MAX_FRAME_LENGTH: usize = 0xFF;
