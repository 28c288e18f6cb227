//! Raw UDP packet framing for discovery v5: the masked static header, the
//! three packet flavors and their authdata layouts. Body encryption and the
//! session state live in [`crate::discv5::codec`].

use aes::cipher::{KeyIvInit, StreamCipher};
use ethereum_types::H256;

use super::error::PacketError;

type Aes128Ctr128BE = ctr::Ctr128BE<aes::Aes128>;

/// A discv5 node id, the keccak-256 hash of the node's public key.
pub type NodeId = H256;

/// Protocol ID sent with each packet.
pub const PROTOCOL_ID: &[u8; 6] = b"discv5";
/// The wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;
/// The packet IV length (u128).
pub const IV_LENGTH: usize = 16;
/// Length of the static header: protocol id (6), version (2), flag (1),
/// nonce (12), authdata-size (2).
pub const STATIC_HEADER_LENGTH: usize = 23;
/// The message nonce length (in bytes).
pub const MESSAGE_NONCE_LENGTH: usize = 12;
/// The id-nonce length (in bytes).
pub const ID_NONCE_LENGTH: usize = 16;
/// Authdata length of a WHOAREYOU packet: id-nonce (16) plus record-seq (8).
pub const WHOAREYOU_AUTHDATA_LENGTH: usize = ID_NONCE_LENGTH + 8;
/// Length of an id-nonce signature.
pub const SIGNATURE_LENGTH: usize = 64;
/// Length of a compressed secp256k1 ephemeral key.
pub const EPHEMERAL_KEY_LENGTH: usize = 33;
/// No valid packet is smaller than a WHOAREYOU.
pub const MIN_PACKET_SIZE: usize = IV_LENGTH + STATIC_HEADER_LENGTH + WHOAREYOU_AUTHDATA_LENGTH;

/// Nonce of the AES-GCM encrypted message body.
pub type MessageNonce = [u8; MESSAGE_NONCE_LENGTH];
/// The nonce a WHOAREYOU challenge asks the remote to sign over.
pub type IdNonce = [u8; ID_NONCE_LENGTH];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Random data unique to the packet, also the header masking IV.
    pub iv: u128,
    /// Protocol header.
    pub header: PacketHeader,
    /// The (encrypted) message body. Empty for WHOAREYOU packets.
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// The GCM nonce of the body; on a WHOAREYOU packet, the nonce of the
    /// request that provoked the challenge.
    pub nonce: MessageNonce,
    /// The type of packet this is.
    pub flag: PacketFlag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketFlag {
    /// An ordinary message; authdata is the sender's node id.
    Message { src_id: NodeId },
    /// A WHOAREYOU challenge; carries no body.
    Whoareyou { id_nonce: IdNonce, record_seq: u64 },
    /// A handshake message, answering a WHOAREYOU.
    Handshake {
        src_id: NodeId,
        /// 64-byte signature over the challenge data.
        id_nonce_sig: Vec<u8>,
        /// 33-byte compressed ephemeral public key.
        ephem_pubkey: Vec<u8>,
        /// The sender's node record, present when the challenger's copy was
        /// stale.
        enr: Option<Vec<u8>>,
    },
}

impl PacketFlag {
    fn tag(&self) -> u8 {
        match self {
            PacketFlag::Message { .. } => 0,
            PacketFlag::Whoareyou { .. } => 1,
            PacketFlag::Handshake { .. } => 2,
        }
    }

    fn encode_auth_data(&self) -> Vec<u8> {
        match self {
            PacketFlag::Message { src_id } => src_id.as_bytes().to_vec(),
            PacketFlag::Whoareyou {
                id_nonce,
                record_seq,
            } => {
                let mut auth_data = Vec::with_capacity(WHOAREYOU_AUTHDATA_LENGTH);
                auth_data.extend_from_slice(id_nonce);
                auth_data.extend_from_slice(&record_seq.to_be_bytes());
                auth_data
            }
            PacketFlag::Handshake {
                src_id,
                id_nonce_sig,
                ephem_pubkey,
                enr,
            } => {
                let enr_len = enr.as_ref().map(Vec::len).unwrap_or_default();
                let mut auth_data =
                    Vec::with_capacity(34 + id_nonce_sig.len() + ephem_pubkey.len() + enr_len);
                auth_data.extend_from_slice(src_id.as_bytes());
                auth_data.push(id_nonce_sig.len() as u8);
                auth_data.push(ephem_pubkey.len() as u8);
                auth_data.extend_from_slice(id_nonce_sig);
                auth_data.extend_from_slice(ephem_pubkey);
                if let Some(enr) = enr {
                    auth_data.extend_from_slice(enr);
                }
                auth_data
            }
        }
    }

    fn decode_auth_data(flag: u8, auth_data: &[u8]) -> Result<Self, PacketError> {
        match flag {
            0 => {
                if auth_data.len() != 32 {
                    return Err(PacketError::InvalidAuthDataSize);
                }
                Ok(PacketFlag::Message {
                    src_id: NodeId::from_slice(auth_data),
                })
            }
            1 => {
                if auth_data.len() != WHOAREYOU_AUTHDATA_LENGTH {
                    return Err(PacketError::InvalidAuthDataSize);
                }
                let id_nonce: IdNonce = auth_data[..ID_NONCE_LENGTH]
                    .try_into()
                    .expect("the length was just checked");
                let record_seq = u64::from_be_bytes(
                    auth_data[ID_NONCE_LENGTH..]
                        .try_into()
                        .expect("the length was just checked"),
                );
                Ok(PacketFlag::Whoareyou {
                    id_nonce,
                    record_seq,
                })
            }
            2 => {
                if auth_data.len() < 34 {
                    return Err(PacketError::InvalidAuthDataSize);
                }
                let src_id = NodeId::from_slice(&auth_data[..32]);
                let sig_size = auth_data[32];
                let ephkey_size = auth_data[33];
                if sig_size as usize != SIGNATURE_LENGTH {
                    return Err(PacketError::InvalidSignatureSize(sig_size));
                }
                if ephkey_size as usize != EPHEMERAL_KEY_LENGTH {
                    return Err(PacketError::InvalidEphemeralKeySize(ephkey_size));
                }
                let keys_end = 34 + SIGNATURE_LENGTH + EPHEMERAL_KEY_LENGTH;
                if auth_data.len() < keys_end {
                    return Err(PacketError::InvalidAuthDataSize);
                }
                let id_nonce_sig = auth_data[34..34 + SIGNATURE_LENGTH].to_vec();
                let ephem_pubkey = auth_data[34 + SIGNATURE_LENGTH..keys_end].to_vec();
                let enr = (auth_data.len() > keys_end).then(|| auth_data[keys_end..].to_vec());
                Ok(PacketFlag::Handshake {
                    src_id,
                    id_nonce_sig,
                    ephem_pubkey,
                    enr,
                })
            }
            other => Err(PacketError::UnknownFlag(other)),
        }
    }
}

impl PacketHeader {
    /// The plaintext header: static part followed by the authdata.
    pub fn encode(&self) -> Vec<u8> {
        let auth_data = self.flag.encode_auth_data();
        let mut buf = Vec::with_capacity(STATIC_HEADER_LENGTH + auth_data.len());
        buf.extend_from_slice(PROTOCOL_ID);
        buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf.push(self.flag.tag());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&(auth_data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&auth_data);
        buf
    }
}

impl Packet {
    /// The challenge data of this packet: IV followed by the plaintext
    /// header. Signed during handshakes and authenticated on every AES-GCM
    /// body.
    pub fn challenge_data(&self) -> Vec<u8> {
        let mut data = self.iv.to_be_bytes().to_vec();
        data.extend_from_slice(&self.header.encode());
        data
    }

    /// Encodes the packet, masking the header with AES-128-CTR keyed on the
    /// first 16 bytes of the recipient's node id.
    pub fn encode(&self, dst_id: &NodeId) -> Vec<u8> {
        let mut header_bytes = self.header.encode();

        let mut cipher = masking_cipher(dst_id, self.iv);
        cipher.apply_keystream(&mut header_bytes);

        let mut buf =
            Vec::with_capacity(IV_LENGTH + header_bytes.len() + self.message.len());
        buf.extend_from_slice(&self.iv.to_be_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.message);
        buf
    }

    /// Decodes a packet addressed to `local_id`, unmasking the header.
    /// Returns the packet along with its challenge data.
    pub fn decode(local_id: &NodeId, data: &[u8]) -> Result<(Self, Vec<u8>), PacketError> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(PacketError::TooSmall);
        }

        let iv = u128::from_be_bytes(
            data[..IV_LENGTH]
                .try_into()
                .expect("IV_LENGTH is 16 bytes"),
        );
        let mut cipher = masking_cipher(local_id, iv);

        let mut static_header = data[IV_LENGTH..IV_LENGTH + STATIC_HEADER_LENGTH].to_vec();
        cipher.apply_keystream(&mut static_header);

        if &static_header[..6] != PROTOCOL_ID {
            return Err(PacketError::HeaderDecryptionFailed);
        }
        let version = u16::from_be_bytes([static_header[6], static_header[7]]);
        if version != PROTOCOL_VERSION {
            return Err(PacketError::InvalidVersion(version));
        }

        let flag = static_header[8];
        let nonce: MessageNonce = static_header[9..9 + MESSAGE_NONCE_LENGTH]
            .try_into()
            .expect("the static header is 23 bytes");
        let auth_data_size = u16::from_be_bytes([static_header[21], static_header[22]]) as usize;

        let after_static = &data[IV_LENGTH + STATIC_HEADER_LENGTH..];
        if auth_data_size > after_static.len() {
            return Err(PacketError::InvalidAuthDataSize);
        }
        let mut auth_data = after_static[..auth_data_size].to_vec();
        cipher.apply_keystream(&mut auth_data);

        let flag = PacketFlag::decode_auth_data(flag, &auth_data)?;
        let message = after_static[auth_data_size..].to_vec();

        if !message.is_empty() && matches!(flag, PacketFlag::Whoareyou { .. }) {
            return Err(PacketError::UnexpectedBody);
        }

        let packet = Packet {
            iv,
            header: PacketHeader { nonce, flag },
            message,
        };
        let challenge_data = packet.challenge_data();
        Ok((packet, challenge_data))
    }
}

/// The header masking cipher: AES-128-CTR keyed on the low 16 bytes of the
/// recipient's node id, with the packet IV as the initial counter.
fn masking_cipher(node_id: &NodeId, iv: u128) -> Aes128Ctr128BE {
    let mut key = [0u8; 16];
    key.copy_from_slice(&node_id.as_bytes()[..16]);
    Aes128Ctr128BE::new(&key.into(), &iv.to_be_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn node_id(byte: u8) -> NodeId {
        NodeId::repeat_byte(byte)
    }

    #[test]
    fn ref_whoareyou_challenge_data() {
        // reference bytes from the discv5 wire specification
        let expected = hex!("000000000000000000000000000000006469736376350001010102030405060708090a0b0c00180102030405060708090a0b0c0d0e0f100000000000000000");

        let packet = Packet {
            iv: 0,
            header: PacketHeader {
                nonce: hex!("0102030405060708090a0b0c"),
                flag: PacketFlag::Whoareyou {
                    id_nonce: hex!("0102030405060708090a0b0c0d0e0f10"),
                    record_seq: 0,
                },
            },
            message: Vec::new(),
        };

        assert_eq!(packet.challenge_data(), expected);
    }

    #[test]
    fn whoareyou_round_trip_preserves_every_field() {
        let dst = node_id(0x4e);
        let request_nonce: MessageNonce =
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c];
        let id_nonce: IdNonce = [
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d,
            0x1e, 0x1f,
        ];
        let packet = Packet {
            iv: 0x42,
            header: PacketHeader {
                nonce: request_nonce,
                flag: PacketFlag::Whoareyou {
                    id_nonce,
                    record_seq: 0,
                },
            },
            message: Vec::new(),
        };

        let encoded = packet.encode(&dst);
        assert_eq!(encoded.len(), MIN_PACKET_SIZE);

        let (decoded, challenge_data) = Packet::decode(&dst, &encoded).unwrap();
        assert_eq!(decoded, packet);

        match decoded.header.flag {
            PacketFlag::Whoareyou {
                id_nonce: got_nonce,
                record_seq,
            } => {
                assert_eq!(got_nonce, id_nonce);
                assert_eq!(record_seq, 0);
            }
            other => panic!("unexpected flag {other:?}"),
        }
        assert_eq!(decoded.header.nonce, request_nonce);

        // challenge data is the IV plus the 23 + 24 byte plaintext header
        assert_eq!(challenge_data.len(), 16 + STATIC_HEADER_LENGTH + 24);
        assert_eq!(&challenge_data[..16], &0x42u128.to_be_bytes());
        assert_eq!(&challenge_data[16..], &packet.header.encode()[..]);
    }

    #[test]
    fn message_packet_round_trip() {
        let dst = node_id(0x99);
        let packet = Packet {
            iv: rand::random(),
            header: PacketHeader {
                nonce: [0xab; MESSAGE_NONCE_LENGTH],
                flag: PacketFlag::Message {
                    src_id: node_id(0x77),
                },
            },
            message: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let encoded = packet.encode(&dst);
        let (decoded, _) = Packet::decode(&dst, &encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn handshake_packet_round_trip() {
        let dst = node_id(0x31);
        for enr in [None, Some(vec![0xc5, 0x01, 0x02, 0x03, 0x04, 0x05])] {
            let packet = Packet {
                iv: rand::random(),
                header: PacketHeader {
                    nonce: [0x0d; MESSAGE_NONCE_LENGTH],
                    flag: PacketFlag::Handshake {
                        src_id: node_id(0x66),
                        id_nonce_sig: vec![0x05; SIGNATURE_LENGTH],
                        ephem_pubkey: vec![0x06; EPHEMERAL_KEY_LENGTH],
                        enr,
                    },
                },
                message: vec![0x11; 20],
            };
            let encoded = packet.encode(&dst);
            let (decoded, _) = Packet::decode(&dst, &encoded).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn decoding_with_the_wrong_node_id_fails() {
        let packet = Packet {
            iv: 7,
            header: PacketHeader {
                nonce: [0; MESSAGE_NONCE_LENGTH],
                flag: PacketFlag::Message {
                    src_id: node_id(0x01),
                },
            },
            message: vec![0; 16],
        };
        let encoded = packet.encode(&node_id(0x02));
        let result = Packet::decode(&node_id(0x03), &encoded);
        assert_eq!(result.unwrap_err(), PacketError::HeaderDecryptionFailed);
    }

    #[test]
    fn undersized_packets_are_rejected() {
        let dst = node_id(0x0f);
        assert_eq!(
            Packet::decode(&dst, &[0u8; MIN_PACKET_SIZE - 1]),
            Err(PacketError::TooSmall)
        );
    }

    #[test]
    fn whoareyou_with_a_body_is_rejected() {
        let dst = node_id(0x21);
        let packet = Packet {
            iv: 3,
            header: PacketHeader {
                nonce: [0; MESSAGE_NONCE_LENGTH],
                flag: PacketFlag::Whoareyou {
                    id_nonce: [0; ID_NONCE_LENGTH],
                    record_seq: 1,
                },
            },
            message: vec![0xff],
        };
        let encoded = packet.encode(&dst);
        assert_eq!(
            Packet::decode(&dst, &encoded),
            Err(PacketError::UnexpectedBody)
        );
    }

    #[test]
    fn bad_flags_and_sizes_are_rejected() {
        let dst = node_id(0x44);
        // flag 3 does not exist: craft a message packet and corrupt the flag
        let packet = Packet {
            iv: 1,
            header: PacketHeader {
                nonce: [0; MESSAGE_NONCE_LENGTH],
                flag: PacketFlag::Message {
                    src_id: node_id(0x55),
                },
            },
            message: Vec::new(),
        };
        let mut plain = packet.header.encode();
        plain[8] = 3;
        let mut cipher = masking_cipher(&dst, 1);
        cipher.apply_keystream(&mut plain);
        let mut encoded = 1u128.to_be_bytes().to_vec();
        encoded.extend_from_slice(&plain);
        assert_eq!(
            Packet::decode(&dst, &encoded),
            Err(PacketError::UnknownFlag(3))
        );
    }
}
