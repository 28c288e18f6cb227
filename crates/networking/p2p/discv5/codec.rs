//! The discovery v5 session codec: turns outbound messages into masked UDP
//! datagrams and inbound datagrams back into plaintext, maintaining the
//! per-peer session keys and the table of outstanding WHOAREYOU challenges.
//!
//! Both tables are cache-like. A missing session is never an error, only a
//! reason for the caller to start (or answer) a handshake.

use std::{collections::HashMap, net::SocketAddr};

use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::Rng;
use tracing::{debug, trace};

use super::{
    crypto::{
        decrypt_message, derive_session_keys, ecdh, encrypt_message, enr_public_key, node_id,
        sign_id_nonce, verify_id_nonce_signature, SessionKeys,
    },
    error::Discv5Error,
    packet::{IdNonce, MessageNonce, NodeId, Packet, PacketFlag, PacketHeader},
};

/// Size of the filler body sent when no session keys exist yet. The garbage
/// provokes a WHOAREYOU from the recipient.
const RANDOM_PACKET_BODY_SIZE: usize = 16;

/// An outstanding WHOAREYOU challenge, waiting for the handshake packet that
/// answers it.
pub struct Challenge {
    /// IV and plaintext header of the WHOAREYOU packet.
    pub data: Vec<u8>,
    /// The remote's long-term key, when we knew it at challenge time.
    /// Otherwise the handshake must carry an ENR proving it.
    pub remote_pubkey: Option<PublicKey>,
}

/// A decoded inbound WHOAREYOU packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whoareyou {
    /// Nonce of the packet that provoked the challenge.
    pub request_nonce: MessageNonce,
    pub id_nonce: IdNonce,
    /// The challenger's view of our record sequence number.
    pub record_seq: u64,
    /// IV and plaintext header, signed in the handshake answer.
    pub challenge_data: Vec<u8>,
}

/// A decoded inbound datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundPacket {
    /// An ordinary message. `message` is `None` when there was no session
    /// able to open the body; the caller answers with a WHOAREYOU.
    Message {
        src_id: NodeId,
        message: Option<Vec<u8>>,
    },
    Whoareyou(Whoareyou),
    /// A handshake message that established fresh session keys.
    Handshake {
        src_id: NodeId,
        message: Vec<u8>,
        enr: Option<Vec<u8>>,
    },
}

/// Sessions and challenges are tracked per node id and socket address, so a
/// peer that moves re-handshakes.
type SessionIndex = (NodeId, SocketAddr);

pub struct Discv5Codec {
    local_key: SecretKey,
    local_id: NodeId,
    /// Sequence number of our own node record.
    local_record_seq: u64,
    /// Our RLP-encoded node record, sent in handshakes when the remote's
    /// copy is stale.
    local_enr: Option<Vec<u8>>,
    sessions: HashMap<SessionIndex, SessionKeys>,
    challenges: HashMap<SessionIndex, Challenge>,
}

impl Discv5Codec {
    pub fn new(local_key: SecretKey) -> Self {
        let local_id = node_id(&local_key.public_key());
        Self {
            local_key,
            local_id,
            local_record_seq: 0,
            local_enr: None,
            sessions: HashMap::new(),
            challenges: HashMap::new(),
        }
    }

    pub fn with_local_record(mut self, seq: u64, enr_rlp: Vec<u8>) -> Self {
        self.local_record_seq = seq;
        self.local_enr = Some(enr_rlp);
        self
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// True when a session with the peer exists.
    pub fn has_session(&self, node: &NodeId, addr: SocketAddr) -> bool {
        self.sessions.contains_key(&(*node, addr))
    }

    /// Evicts a session; the next exchange re-handshakes.
    pub fn drop_session(&mut self, node: &NodeId, addr: SocketAddr) {
        self.sessions.remove(&(*node, addr));
    }

    /// Encodes an ordinary message packet. Without session keys the body is
    /// random filler that will provoke a WHOAREYOU challenge.
    pub fn encode_message_packet(
        &mut self,
        dst_id: &NodeId,
        dst_addr: SocketAddr,
        message: &[u8],
    ) -> Result<Vec<u8>, Discv5Error> {
        let mut rng = rand::thread_rng();
        let nonce: MessageNonce = rng.gen();
        let iv: u128 = rng.gen();
        let header = PacketHeader {
            nonce,
            flag: PacketFlag::Message {
                src_id: self.local_id,
            },
        };

        let mut aad = iv.to_be_bytes().to_vec();
        aad.extend_from_slice(&header.encode());

        let body = match self.sessions.get(&(*dst_id, dst_addr)) {
            Some(keys) => encrypt_message(&keys.write_key, nonce, message, &aad)?,
            None => {
                trace!(%dst_id, "no session keys, sending a random packet");
                let mut filler = [0u8; RANDOM_PACKET_BODY_SIZE];
                rng.fill(&mut filler[..]);
                filler.to_vec()
            }
        };

        let packet = Packet {
            iv,
            header,
            message: body,
        };
        Ok(packet.encode(dst_id))
    }

    /// Encodes a WHOAREYOU challenge for a sender we could not decrypt, and
    /// remembers it so the answering handshake can be verified.
    /// `remote_record_seq` is the newest record sequence we know for the
    /// peer, zero if we know nothing.
    pub fn encode_whoareyou(
        &mut self,
        dst_id: &NodeId,
        dst_addr: SocketAddr,
        request_nonce: MessageNonce,
        remote_record_seq: u64,
        remote_pubkey: Option<PublicKey>,
    ) -> Result<Vec<u8>, Discv5Error> {
        let mut rng = rand::thread_rng();
        let id_nonce: IdNonce = rng.gen();
        let iv: u128 = rng.gen();
        let header = PacketHeader {
            nonce: request_nonce,
            flag: PacketFlag::Whoareyou {
                id_nonce,
                record_seq: remote_record_seq,
            },
        };

        let mut challenge_data = iv.to_be_bytes().to_vec();
        challenge_data.extend_from_slice(&header.encode());
        self.challenges.insert(
            (*dst_id, dst_addr),
            Challenge {
                data: challenge_data,
                remote_pubkey,
            },
        );

        let packet = Packet {
            iv,
            header,
            message: Vec::new(),
        };
        Ok(packet.encode(dst_id))
    }

    /// Encodes the handshake packet answering a received WHOAREYOU: a fresh
    /// ephemeral keypair, an identity-proof signature, newly derived session
    /// keys, and our node record iff the challenger's copy is stale.
    pub fn encode_handshake_message(
        &mut self,
        dst_id: &NodeId,
        dst_addr: SocketAddr,
        whoareyou: &Whoareyou,
        remote_pubkey: &PublicKey,
        message: &[u8],
    ) -> Result<Vec<u8>, Discv5Error> {
        let mut rng = rand::thread_rng();

        let ephemeral_key = SecretKey::random(&mut rng);
        let ephem_pubkey = ephemeral_key
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();

        let id_nonce_sig = sign_id_nonce(
            &self.local_key,
            &whoareyou.challenge_data,
            &ephem_pubkey,
            dst_id,
        )?;

        let secret = ecdh(remote_pubkey, &ephemeral_key);
        let (write_key, read_key) = derive_session_keys(
            &secret,
            &self.local_id,
            dst_id,
            &whoareyou.challenge_data,
        )?;

        // note the strict comparison: an up-to-date challenger gets no record
        let enr = (whoareyou.record_seq < self.local_record_seq)
            .then(|| self.local_enr.clone())
            .flatten();

        let nonce: MessageNonce = rng.gen();
        let iv: u128 = rng.gen();
        let header = PacketHeader {
            nonce,
            flag: PacketFlag::Handshake {
                src_id: self.local_id,
                id_nonce_sig: id_nonce_sig.to_vec(),
                ephem_pubkey,
                enr,
            },
        };

        let mut aad = iv.to_be_bytes().to_vec();
        aad.extend_from_slice(&header.encode());
        let body = encrypt_message(&write_key, nonce, message, &aad)?;

        self.sessions
            .insert((*dst_id, dst_addr), SessionKeys { write_key, read_key });

        let packet = Packet {
            iv,
            header,
            message: body,
        };
        Ok(packet.encode(dst_id))
    }

    /// Decodes an inbound datagram.
    ///
    /// An ordinary message that fails authentication is not an error: the
    /// session may have rotated, so the keys are dropped and the packet is
    /// reported keyless. A handshake that fails authentication *is* an
    /// error, and the challenge it answered is consumed either way.
    pub fn decode_packet(
        &mut self,
        src_addr: SocketAddr,
        datagram: &[u8],
    ) -> Result<InboundPacket, Discv5Error> {
        let (packet, challenge_data) = Packet::decode(&self.local_id, datagram)?;
        let nonce = packet.header.nonce;
        trace!(len = datagram.len(), "decoding inbound discv5 datagram");

        match packet.header.flag {
            PacketFlag::Message { src_id } => {
                let index = (src_id, src_addr);
                let message = match self.sessions.get(&index) {
                    Some(keys) => {
                        match decrypt_message(&keys.read_key, nonce, &packet.message, &challenge_data)
                        {
                            Ok(plain) => Some(plain),
                            Err(_) => {
                                debug!(%src_id, "message failed authentication, dropping session keys");
                                self.sessions.remove(&index);
                                None
                            }
                        }
                    }
                    None => None,
                };
                Ok(InboundPacket::Message { src_id, message })
            }
            PacketFlag::Whoareyou {
                id_nonce,
                record_seq,
            } => Ok(InboundPacket::Whoareyou(Whoareyou {
                request_nonce: nonce,
                id_nonce,
                record_seq,
                challenge_data,
            })),
            PacketFlag::Handshake {
                src_id,
                id_nonce_sig,
                ephem_pubkey,
                enr,
            } => {
                let index = (src_id, src_addr);
                let challenge = self
                    .challenges
                    .remove(&index)
                    .ok_or(Discv5Error::MissingChallenge)?;

                let remote_pubkey = match challenge.remote_pubkey {
                    Some(pubkey) => pubkey,
                    None => enr
                        .as_deref()
                        .map(enr_public_key)
                        .transpose()?
                        .flatten()
                        .ok_or(Discv5Error::InvalidRemotePublicKey)?,
                };

                if !verify_id_nonce_signature(
                    &remote_pubkey,
                    &challenge.data,
                    &ephem_pubkey,
                    &self.local_id,
                    &id_nonce_sig,
                ) {
                    return Err(Discv5Error::InvalidSignature);
                }

                let ephemeral = PublicKey::from_sec1_bytes(&ephem_pubkey)
                    .map_err(|_| Discv5Error::InvalidRemotePublicKey)?;
                let secret = ecdh(&ephemeral, &self.local_key);
                // the handshake sender is the initiator; its write key is our
                // read key
                let (their_write_key, our_write_key) =
                    derive_session_keys(&secret, &src_id, &self.local_id, &challenge.data)?;

                let message =
                    decrypt_message(&their_write_key, nonce, &packet.message, &challenge_data)?;

                self.sessions.insert(
                    index,
                    SessionKeys {
                        write_key: our_write_key,
                        read_key: their_write_key,
                    },
                );
                debug!(%src_id, "handshake complete, session keys established");

                Ok(InboundPacket::Handshake {
                    src_id,
                    message,
                    enr,
                })
            }
        }
    }
}
