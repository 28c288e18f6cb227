use std::fmt;

use bytes::BufMut;
use ethereum_types::H512;
use ethwire_rlp::{
    constants::RLP_NULL,
    decode::RLPDecode,
    encode::RLPEncode,
    error::{RLPDecodeError, RLPEncodeError},
    structs::{Decoder, Encoder},
};

use super::message::RLPxMessage;

/// The devp2p protocol version spoken by this implementation. Snappy
/// compression of message bodies is enabled when both sides are at 5 or
/// above.
pub const P2P_PROTOCOL_VERSION: u64 = 5;

/// A sub-protocol announcement carried in the hello message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub version: u64,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl RLPEncode for Capability {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.name)
            .encode_field(&self.version)
            .finish()
    }
}

impl RLPDecode for Capability {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (name, decoder) = decoder.decode_field("name")?;
        let (version, decoder) = decoder.decode_field("version")?;
        let rest = decoder.finish_unchecked();
        Ok((Self { name, version }, rest))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// The devp2p disconnect reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DisconnectRequested,
    TcpError,
    BreachOfProtocol,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleVersion,
    InvalidIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    SelfConnection,
    PingTimeout,
    SubprotocolReason,
    Other(u8),
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        match self {
            DisconnectReason::DisconnectRequested => 0x00,
            DisconnectReason::TcpError => 0x01,
            DisconnectReason::BreachOfProtocol => 0x02,
            DisconnectReason::UselessPeer => 0x03,
            DisconnectReason::TooManyPeers => 0x04,
            DisconnectReason::AlreadyConnected => 0x05,
            DisconnectReason::IncompatibleVersion => 0x06,
            DisconnectReason::InvalidIdentity => 0x07,
            DisconnectReason::ClientQuitting => 0x08,
            DisconnectReason::UnexpectedIdentity => 0x09,
            DisconnectReason::SelfConnection => 0x0a,
            DisconnectReason::PingTimeout => 0x0b,
            DisconnectReason::SubprotocolReason => 0x10,
            DisconnectReason::Other(code) => *code,
        }
    }
}

impl From<u8> for DisconnectReason {
    fn from(code: u8) -> Self {
        match code {
            0x00 => DisconnectReason::DisconnectRequested,
            0x01 => DisconnectReason::TcpError,
            0x02 => DisconnectReason::BreachOfProtocol,
            0x03 => DisconnectReason::UselessPeer,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::AlreadyConnected,
            0x06 => DisconnectReason::IncompatibleVersion,
            0x07 => DisconnectReason::InvalidIdentity,
            0x08 => DisconnectReason::ClientQuitting,
            0x09 => DisconnectReason::UnexpectedIdentity,
            0x0a => DisconnectReason::SelfConnection,
            0x0b => DisconnectReason::PingTimeout,
            0x10 => DisconnectReason::SubprotocolReason,
            other => DisconnectReason::Other(other),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::TcpError => "TCP subsystem error",
            DisconnectReason::BreachOfProtocol => "breach of protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleVersion => "incompatible p2p version",
            DisconnectReason::InvalidIdentity => "invalid node identity",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::SelfConnection => "connected to self",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::SubprotocolReason => "subprotocol reason",
            DisconnectReason::Other(code) => return write!(f, "unknown reason 0x{code:02x}"),
        };
        text.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub protocol_version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u64,
    pub node_id: H512,
}

impl HelloMessage {
    pub fn new(client_id: String, capabilities: Vec<Capability>, node_id: H512) -> Self {
        Self {
            protocol_version: P2P_PROTOCOL_VERSION,
            client_id,
            capabilities,
            listen_port: 0,
            node_id,
        }
    }
}

impl RLPxMessage for HelloMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        Encoder::new(buf)
            .encode_field(&self.protocol_version)
            .encode_field(&self.client_id)
            .encode_field(&self.capabilities)
            .encode_field(&self.listen_port)
            .encode_field(&self.node_id)
            .finish();
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // hello message: [protocolVersion: P, clientId: B, capabilities, listenPort: P, nodeId: B_64, ...]
        let decoder = Decoder::new(msg_data)?;
        let (protocol_version, decoder): (u64, _) = decoder.decode_field("protocolVersion")?;
        let (client_id, decoder): (String, _) = decoder.decode_field("clientId")?;
        // [[cap1, capVersion1], [cap2, capVersion2], ...]
        let (capabilities, decoder): (Vec<Capability>, _) = decoder.decode_field("capabilities")?;
        let (listen_port, decoder): (u64, _) = decoder.decode_field("listenPort")?;
        let (node_id, decoder): (H512, _) = decoder.decode_field("nodeId")?;

        // Implementations must ignore any additional list elements
        let _padding = decoder.finish_unchecked();

        Ok(Self {
            protocol_version,
            client_id,
            capabilities,
            listen_port,
            node_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectMessage {
    pub reason: Option<DisconnectReason>,
}

impl DisconnectMessage {
    pub fn new(reason: Option<DisconnectReason>) -> Self {
        Self { reason }
    }
}

impl RLPxMessage for DisconnectMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        // Disconnect msg_data is a single-element list with the reason, or none
        match self.reason {
            Some(reason) => Encoder::new(buf).encode_field(&reason.code()).finish(),
            None => Vec::<u8>::new().encode(buf),
        }
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // The reason is sent in divergent shapes by live implementations:
        // a one-element list, a bare byte, or a blob wrapping either.
        fn reason_code(data: &[u8]) -> Result<Option<u8>, RLPDecodeError> {
            match data.first() {
                None => Ok(None),
                // empty blob, no reason given
                Some(&RLP_NULL) if data.len() == 1 => Ok(None),
                // bare reason byte
                Some(&byte) if data.len() == 1 && byte < 0xc0 => Ok(Some(byte)),
                // [reason] or []
                Some(&prefix) if prefix >= 0xc0 => {
                    let decoder = Decoder::new(data)?;
                    let (reason, _): (Option<u8>, _) = decoder.decode_optional_field();
                    Ok(reason)
                }
                // blob wrapping one of the above
                Some(&prefix) if (RLP_NULL..0xc0).contains(&prefix) => {
                    let inner_len = (prefix - RLP_NULL) as usize;
                    if data.len() < inner_len + 1 {
                        return Err(RLPDecodeError::InvalidLength);
                    }
                    reason_code(&data[1..inner_len + 1])
                }
                Some(_) => Err(RLPDecodeError::MalformedData),
            }
        }

        Ok(Self::new(reason_code(msg_data)?.map(DisconnectReason::from)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {}

impl PingMessage {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PingMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl RLPxMessage for PingMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        // Ping msg_data is only []
        Vec::<u8>::new().encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // ping message: data is an empty list
        let decoder = Decoder::new(msg_data)?;
        decoder.finish()?;
        Ok(Self::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongMessage {}

impl PongMessage {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PongMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl RLPxMessage for PongMessage {
    fn encode(&self, buf: &mut dyn BufMut) -> Result<(), RLPEncodeError> {
        // Pong msg_data is only []
        Vec::<u8>::new().encode(buf);
        Ok(())
    }

    fn decode(msg_data: &[u8]) -> Result<Self, RLPDecodeError> {
        // pong message: data is an empty list
        let decoder = Decoder::new(msg_data)?;
        decoder.finish()?;
        Ok(Self::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trip() {
        let cap = Capability::new("eth", 68);
        let encoded = cap.encode_to_vec();
        let decoded = Capability::decode(&encoded).unwrap();
        assert_eq!(cap, decoded);
    }

    #[test]
    fn hello_round_trip() {
        let hello = HelloMessage::new(
            "ethwire/0.1.0".to_string(),
            vec![Capability::new("eth", 68), Capability::new("snap", 1)],
            H512::repeat_byte(0xab),
        );
        let mut encoded = Vec::new();
        RLPxMessage::encode(&hello, &mut encoded).unwrap();
        let decoded = HelloMessage::decode(&encoded).unwrap();
        assert_eq!(hello, decoded);
    }

    #[test]
    fn disconnect_reason_shapes() {
        // single-element list
        let msg = DisconnectMessage::new(Some(DisconnectReason::TooManyPeers));
        let mut encoded = Vec::new();
        RLPxMessage::encode(&msg, &mut encoded).unwrap();
        assert_eq!(encoded, vec![0xc1, 0x04]);
        assert_eq!(DisconnectMessage::decode(&encoded).unwrap(), msg);

        // bare byte
        let decoded = DisconnectMessage::decode(&[0x04]).unwrap();
        assert_eq!(decoded.reason, Some(DisconnectReason::TooManyPeers));

        // blob-wrapped byte
        let decoded = DisconnectMessage::decode(&[0x81, 0x04]).unwrap();
        assert_eq!(decoded.reason, Some(DisconnectReason::TooManyPeers));

        // blob-wrapped list
        let decoded = DisconnectMessage::decode(&[0x82, 0xc1, 0x10]).unwrap();
        assert_eq!(decoded.reason, Some(DisconnectReason::SubprotocolReason));

        // empty
        let decoded = DisconnectMessage::decode(&[]).unwrap();
        assert_eq!(decoded.reason, None);

        // empty list
        let decoded = DisconnectMessage::decode(&[0xc0]).unwrap();
        assert_eq!(decoded.reason, None);
    }

    #[test]
    fn ping_pong_bodies_are_empty_lists() {
        let mut encoded = Vec::new();
        RLPxMessage::encode(&PingMessage::new(), &mut encoded).unwrap();
        assert_eq!(encoded, vec![0xc0]);
        PingMessage::decode(&encoded).unwrap();

        let mut encoded = Vec::new();
        RLPxMessage::encode(&PongMessage::new(), &mut encoded).unwrap();
        assert_eq!(encoded, vec![0xc0]);
        PongMessage::decode(&encoded).unwrap();
    }
}
