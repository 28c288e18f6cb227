use bytes::BufMut;
use ethwire_rlp::encode::RLPEncode;
use ethwire_rlp::error::{RLPDecodeError, RLPEncodeError};
use std::fmt::Display;

use super::p2p::{DisconnectMessage, HelloMessage, PingMessage, PongMessage};

/// Number of message ids reserved for the base devp2p protocol.
/// Sub-protocol ids are assigned from here on.
pub const BASE_PROTOCOL_LENGTH: u16 = 16;

pub trait RLPxMessage: Sized {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError>;

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError>;
}

#[derive(Debug)]
pub enum Message {
    Hello(HelloMessage),
    Disconnect(DisconnectMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    /// A message belonging to a negotiated sub-protocol, routed through the
    /// dispatcher. `data` is the raw RLP body, already decompressed.
    Subprotocol { msg_id: u16, data: Vec<u8> },
}

impl Message {
    pub fn msg_id(&self) -> u16 {
        match self {
            Message::Hello(_) => 0x00,
            Message::Disconnect(_) => 0x01,
            Message::Ping(_) => 0x02,
            Message::Pong(_) => 0x03,
            Message::Subprotocol { msg_id, .. } => *msg_id,
        }
    }

    /// Decodes a message given its per-peer id and decompressed body.
    /// Ids in the reserved range that the base protocol does not define, and
    /// ids beyond the dispatcher table, are the caller's breach to report.
    pub fn decode(msg_id: u16, msg_data: &[u8]) -> Result<Message, RLPDecodeError> {
        match msg_id {
            0x00 => Ok(Message::Hello(HelloMessage::decode(msg_data)?)),
            0x01 => Ok(Message::Disconnect(DisconnectMessage::decode(msg_data)?)),
            0x02 => Ok(Message::Ping(PingMessage::decode(msg_data)?)),
            0x03 => Ok(Message::Pong(PongMessage::decode(msg_data)?)),
            id if id < BASE_PROTOCOL_LENGTH => Err(RLPDecodeError::Custom(format!(
                "unassigned base protocol message id {id:#x}"
            ))),
            id => Ok(Message::Subprotocol {
                msg_id: id,
                data: msg_data.to_vec(),
            }),
        }
    }

    /// Encodes the message body (without the id) into `buf`.
    pub fn encode_body(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        match self {
            Message::Hello(msg) => msg.encode(buf),
            Message::Disconnect(msg) => msg.encode(buf),
            Message::Ping(msg) => msg.encode(buf),
            Message::Pong(msg) => msg.encode(buf),
            Message::Subprotocol { data, .. } => {
                buf.put_slice(data);
                Ok(())
            }
        }
    }

    /// Encodes the id-prefixed, uncompressed wire form of the message.
    pub fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        (self.msg_id() as u64).encode(buf);
        self.encode_body(buf)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Hello(_) => "p2p:Hello".fmt(f),
            Message::Disconnect(_) => "p2p:Disconnect".fmt(f),
            Message::Ping(_) => "p2p:Ping".fmt(f),
            Message::Pong(_) => "p2p:Pong".fmt(f),
            Message::Subprotocol { msg_id, .. } => write!(f, "subprotocol:{msg_id:#x}"),
        }
    }
}
