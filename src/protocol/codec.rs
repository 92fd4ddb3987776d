use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::{Error, Result};
use crate::util::hex;
use super::message::{Direction, Message, MessageClass};
use super::{ACK, CAN, MAX_FRAME_LENGTH, NAK, SOF};

/// Checksum over `frame[1..frame.len() - 1]`, seeded with 0xFF
pub fn checksum(frame: &[u8]) -> u8 {
    if frame.len() < 2 {
        return 0xFF;
    }
    frame[1..frame.len() - 1].iter().fold(0xFF, |acc, b| acc ^ b)
}

/// Encodes a message into a complete data frame
pub fn encode_frame(message: &Message) -> Result<Bytes> {
    let trailer = if message.has_send_data_trailer() { 2 } else { 0 };
    let length = message.payload.len() + trailer + 3;
    if length > MAX_FRAME_LENGTH {
        return Err(Error::protocol(format!(
            "{} payload of {} bytes does not fit in a frame",
            message.class,
            message.payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(length + 2);
    buf.put_u8(SOF);
    buf.put_u8(length as u8);
    buf.put_u8(message.direction.code());
    buf.put_u8(message.class.code());
    buf.put_slice(&message.payload);
    if trailer > 0 {
        buf.put_u8(message.transmit_options);
        buf.put_u8(message.callback_id);
    }
    buf.put_u8(0);
    let sum = checksum(&buf);
    let last = buf.len() - 1;
    buf[last] = sum;

    Ok(buf.freeze())
}

/// Decodes a frame produced by [`encode_frame`].
///
/// Send-data requests have their trailer split back into
/// `transmit_options` and `callback_id`.
pub fn decode_frame(frame: &[u8]) -> Result<Message> {
    let mut message = decode_inbound(frame)?;
    if message.has_send_data_trailer() {
        if message.payload.len() < 2 {
            return Err(Error::protocol("send-data request without trailer"));
        }
        let split = message.payload.len() - 2;
        message.transmit_options = message.payload[split];
        message.callback_id = message.payload[split + 1];
        message.payload.truncate(split);
    }
    Ok(message)
}

/// Decodes a frame read from the stick.
///
/// Frames sent by the stick never carry the host trailer, so the payload
/// is taken whole.
pub fn decode_inbound(frame: &[u8]) -> Result<Message> {
    if frame.len() < 5 {
        return Err(Error::protocol(format!("frame too short: {} bytes", frame.len())));
    }
    if frame[0] != SOF {
        return Err(Error::protocol(format!("frame does not start with SOF: 0x{:02X}", frame[0])));
    }
    let length = frame[1] as usize;
    if length + 2 != frame.len() {
        return Err(Error::protocol(format!(
            "length byte {} does not match frame of {} bytes",
            length,
            frame.len()
        )));
    }

    let expected = checksum(frame);
    let actual = frame[frame.len() - 1];
    if expected != actual {
        return Err(Error::Checksum { expected, actual });
    }

    let direction = Direction::from_code(frame[2])
        .ok_or_else(|| Error::protocol(format!("unknown direction byte 0x{:02X}", frame[2])))?;
    let class = MessageClass::from_code(frame[3])
        .ok_or_else(|| Error::protocol(format!("unknown message class 0x{:02X}", frame[3])))?;

    Ok(Message::incoming(class, direction, frame[4..frame.len() - 1].to_vec()))
}

/// One unit read from or written to the link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFrame {
    /// Positive acknowledgement
    Ack,
    /// Negative acknowledgement
    Nak,
    /// Peer canceled the last frame
    Can,
    /// A valid data frame
    Data(Message),
    /// A data frame that failed validation and must be NAKed
    Corrupt {
        /// Raw frame bytes
        raw: Bytes,
        /// Why it was rejected
        reason: String,
    },
    /// A byte that does not start a frame
    OutOfFrame(u8),
}

/// Link-level codec for the stick's serial protocol
#[derive(Clone, Default)]
pub struct LinkCodec;

impl LinkCodec {
    /// Creates a new link codec
    pub fn new() -> Self {
        LinkCodec
    }
}

impl Decoder for LinkCodec {
    type Item = LinkFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match src[0] {
            ACK => {
                src.advance(1);
                Ok(Some(LinkFrame::Ack))
            }
            NAK => {
                src.advance(1);
                Ok(Some(LinkFrame::Nak))
            }
            CAN => {
                src.advance(1);
                Ok(Some(LinkFrame::Can))
            }
            SOF => {
                if src.len() < 2 {
                    // Need the length byte
                    return Ok(None);
                }
                let total = src[1] as usize + 2;
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }

                let raw = src.split_to(total).freeze();
                trace!(frame = %hex(&raw), "received frame");
                match decode_inbound(&raw) {
                    Ok(message) => Ok(Some(LinkFrame::Data(message))),
                    Err(e) => Ok(Some(LinkFrame::Corrupt { raw, reason: e.to_string() })),
                }
            }
            other => {
                src.advance(1);
                Ok(Some(LinkFrame::OutOfFrame(other)))
            }
        }
    }
}

impl Encoder<LinkFrame> for LinkCodec {
    type Error = Error;

    fn encode(&mut self, item: LinkFrame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        match item {
            LinkFrame::Ack => dst.put_u8(ACK),
            LinkFrame::Nak => dst.put_u8(NAK),
            LinkFrame::Can => dst.put_u8(CAN),
            LinkFrame::Data(message) => {
                let frame = encode_frame(&message)?;
                trace!(frame = %hex(&frame), "sending frame");
                dst.extend_from_slice(&frame);
            }
            LinkFrame::Corrupt { raw, .. } => dst.extend_from_slice(&raw),
            LinkFrame::OutOfFrame(byte) => dst.put_u8(byte),
        }
        Ok(())
    }
}
