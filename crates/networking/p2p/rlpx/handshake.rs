use crate::rlpx::error::RLPxError;
use crate::rlpx::frame::{EgressState, IngressState};
use crate::rlpx::utils::{ecdh_xchng, id2pubkey, kdf, pubkey2id, sha256, sha256_hmac};
use aes::cipher::{KeyIvInit, StreamCipher};
use ethereum_types::{H128, H256, H512, H520};
use ethwire_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use k256::{
    ecdsa::{self, RecoveryId, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};
use rand::Rng;
use sha3::{Digest, Keccak256};

type Aes128Ctr64BE = ctr::Ctr64BE<aes::Aes128>;
pub(crate) type Aes256Ctr64BE = ctr::Ctr64BE<aes::Aes256>;

/// Total size of a pre-EIP-8 auth packet. Legacy packets carry no length
/// prefix; they are recognized by the first decode attempt failing.
pub(crate) const LEGACY_AUTH_SIZE: usize = 307;
/// Total size of a pre-EIP-8 ack packet.
pub(crate) const LEGACY_ACK_SIZE: usize = 210;

const SIGNATURE_SIZE: usize = 65;
const IV_SIZE: usize = 16;
const MAC_FOOTER_SIZE: usize = 32;
const PUBKEY_SIZE: usize = 65;

/// Encodes an Auth message, to start a handshake.
pub fn encode_auth_message(
    static_key: &SecretKey,
    local_nonce: H256,
    remote_static_pubkey: &PublicKey,
    local_ephemeral_key: &SecretKey,
) -> Result<Vec<u8>, RLPxError> {
    let node_id = pubkey2id(&static_key.public_key());

    // Derive a shared secret from the static keys.
    let static_shared_secret = ecdh_xchng(static_key, remote_static_pubkey);

    // Create the signature included in the message.
    let signature = sign_shared_secret(
        static_shared_secret.into(),
        local_nonce,
        local_ephemeral_key,
    )?;

    // Compose and RLP-encode the auth message.
    let auth = AuthMessage::new(signature, node_id, local_nonce);
    let encoded_auth_msg = auth.encode_to_vec();

    encrypt_message(remote_static_pubkey, encoded_auth_msg)
}

/// Decodes an incoming EIP-8 Auth message, starting a handshake.
/// Returns the message along with the initiator's ephemeral public key,
/// recovered from the signature.
pub(crate) fn decode_auth_message(
    static_key: &SecretKey,
    msg: &[u8],
    size_prefix: &[u8],
) -> Result<(AuthMessage, PublicKey), RLPxError> {
    let payload = decrypt_message(static_key, msg, size_prefix)?;

    // RLP-decode the message.
    let (auth, _padding) = AuthMessage::decode_unfinished(&payload)?;

    let remote_ephemeral_key = derive_auth_ephemeral_key(static_key, &auth)?;
    Ok((auth, remote_ephemeral_key))
}

/// Decodes a legacy (pre-EIP-8) Auth packet. The plaintext is a fixed
/// layout rather than RLP:
/// `signature (65) || keccak(ephemeral-pubkey) (32) || pubkey (64) || nonce (32) || 0x00`
pub(crate) fn decode_auth_message_legacy(
    static_key: &SecretKey,
    msg: &[u8],
) -> Result<(AuthMessage, PublicKey), RLPxError> {
    let payload = decrypt_message(static_key, msg, &[])?;
    if payload.len() != SIGNATURE_SIZE + 32 + 64 + 32 + 1 {
        return Err(RLPxError::HandshakeError(
            "legacy auth payload has the wrong size".to_string(),
        ));
    }

    let signature = H520::from_slice(&payload[..65]);
    let node_id = H512::from_slice(&payload[97..161]);
    let nonce = H256::from_slice(&payload[161..193]);

    let auth = AuthMessage {
        signature,
        node_id,
        nonce,
        version: 4,
    };
    let remote_ephemeral_key = derive_auth_ephemeral_key(static_key, &auth)?;
    Ok((auth, remote_ephemeral_key))
}

fn derive_auth_ephemeral_key(
    static_key: &SecretKey,
    auth: &AuthMessage,
) -> Result<PublicKey, RLPxError> {
    let peer_pk = id2pubkey(auth.node_id).ok_or_else(|| {
        RLPxError::HandshakeError("invalid static public key in auth message".to_string())
    })?;
    let static_shared_secret = ecdh_xchng(static_key, &peer_pk);
    retrieve_remote_ephemeral_key(static_shared_secret.into(), auth.nonce, auth.signature)
}

/// Encodes an Ack message, to complete a handshake.
pub fn encode_ack_message(
    local_ephemeral_key: &SecretKey,
    local_nonce: H256,
    remote_static_pubkey: &PublicKey,
) -> Result<Vec<u8>, RLPxError> {
    // Compose and RLP-encode the ack message.
    let ack_msg = AckMessage::new(pubkey2id(&local_ephemeral_key.public_key()), local_nonce);
    let encoded_ack_msg = ack_msg.encode_to_vec();

    encrypt_message(remote_static_pubkey, encoded_ack_msg)
}

/// Decodes an EIP-8 Ack message, completing a handshake.
pub(crate) fn decode_ack_message(
    static_key: &SecretKey,
    msg: &[u8],
    size_prefix: &[u8],
) -> Result<AckMessage, RLPxError> {
    let payload = decrypt_message(static_key, msg, size_prefix)?;
    let (ack, _padding) = AckMessage::decode_unfinished(&payload)?;
    Ok(ack)
}

/// Decodes a legacy (pre-EIP-8) Ack packet:
/// `ephemeral-pubkey (64) || nonce (32) || 0x00`
pub(crate) fn decode_ack_message_legacy(
    static_key: &SecretKey,
    msg: &[u8],
) -> Result<AckMessage, RLPxError> {
    let payload = decrypt_message(static_key, msg, &[])?;
    if payload.len() != 64 + 32 + 1 {
        return Err(RLPxError::HandshakeError(
            "legacy ack payload has the wrong size".to_string(),
        ));
    }

    Ok(AckMessage {
        ephemeral_pubkey: H512::from_slice(&payload[..64]),
        nonce: H256::from_slice(&payload[64..96]),
        version: 4,
    })
}

fn decrypt_message(
    static_key: &SecretKey,
    msg: &[u8],
    auth_data: &[u8],
) -> Result<Vec<u8>, RLPxError> {
    // Split the message into its components. General layout is:
    // public-key (65) || iv (16) || ciphertext || mac (32)
    if msg.len() < PUBKEY_SIZE + IV_SIZE + MAC_FOOTER_SIZE {
        return Err(RLPxError::HandshakeError(
            "handshake packet too small".to_string(),
        ));
    }
    let (pk, rest) = msg.split_at(PUBKEY_SIZE);
    let (iv, rest) = rest.split_at(IV_SIZE);
    let (c, d) = rest.split_at(rest.len() - MAC_FOOTER_SIZE);

    // Derive the message shared secret.
    let ephemeral_pubkey = PublicKey::from_sec1_bytes(pk).map_err(|_| {
        RLPxError::HandshakeError("invalid ephemeral public key in handshake packet".to_string())
    })?;
    let shared_secret = ecdh_xchng(static_key, &ephemeral_pubkey);

    // Derive the AES and MAC keys from the message shared secret.
    let mut buf = [0; 32];
    kdf(&shared_secret, &mut buf);
    let aes_key = &buf[..16];
    let mac_key = sha256(&buf[16..]);

    // Verify the MAC.
    let expected_d = sha256_hmac(&mac_key, &[iv, c], auth_data);
    if d != expected_d {
        return Err(RLPxError::HandshakeError(
            "handshake packet MAC mismatch".to_string(),
        ));
    }

    // Decrypt the message with the AES key.
    let mut stream_cipher = Aes128Ctr64BE::new_from_slices(aes_key, iv)
        .expect("key and iv sizes are fixed");
    let mut decoded = c.to_vec();
    stream_cipher.apply_keystream(&mut decoded);
    Ok(decoded)
}

pub(crate) fn encrypt_message(
    remote_static_pubkey: &PublicKey,
    mut encoded_msg: Vec<u8>,
) -> Result<Vec<u8>, RLPxError> {
    let mut rng = rand::thread_rng();

    // Pad with a random amount of data. The amount needs to be at least 100
    // bytes to make the message distinguishable from pre-EIP-8 handshakes.
    let padding_length = rng.gen_range(100..=300);
    encoded_msg.resize(encoded_msg.len() + padding_length, 0);

    // Precompute the size of the message. This is needed for computing the MAC.
    let ecies_overhead = SIGNATURE_SIZE + IV_SIZE + MAC_FOOTER_SIZE;
    let auth_size: u16 = (encoded_msg.len() + ecies_overhead)
        .try_into()
        .map_err(|_| RLPxError::HandshakeError("handshake message too large".to_string()))?;
    let auth_size_bytes = auth_size.to_be_bytes();

    // Generate a keypair just for this message.
    let message_secret_key = SecretKey::random(&mut rng);

    // Derive a shared secret for this message.
    let message_secret = ecdh_xchng(&message_secret_key, remote_static_pubkey);

    // Derive the AES and MAC keys from the message secret.
    let mut secret_keys = [0; 32];
    kdf(&message_secret, &mut secret_keys);
    let aes_key = &secret_keys[..16];
    let mac_key = sha256(&secret_keys[16..]);

    // Use the AES secret to encrypt the auth message.
    let iv = H128(rng.gen());
    let mut aes_cipher = Aes128Ctr64BE::new_from_slices(aes_key, &iv.0)
        .expect("key and iv sizes are fixed");
    aes_cipher.apply_keystream(&mut encoded_msg);
    let encrypted_auth_msg = encoded_msg;

    // Use the MAC secret to compute the MAC.
    let r_public_key = message_secret_key.public_key().to_encoded_point(false);
    let mac_footer = sha256_hmac(&mac_key, &[&iv.0, &encrypted_auth_msg], &auth_size_bytes);

    Ok([
        &auth_size_bytes,
        r_public_key.as_bytes(),
        &iv.0,
        &encrypted_auth_msg,
        &mac_footer,
    ]
    .concat())
}

fn retrieve_remote_ephemeral_key(
    shared_secret: H256,
    remote_nonce: H256,
    signature: H520,
) -> Result<PublicKey, RLPxError> {
    let bad_signature =
        |_| RLPxError::HandshakeError("invalid signature in handshake".to_string());

    let signature_prehash = shared_secret ^ remote_nonce;
    let sign = ecdsa::Signature::from_slice(&signature.as_bytes()[..64]).map_err(bad_signature)?;
    let rid = RecoveryId::from_byte(signature[64]).ok_or_else(|| {
        RLPxError::HandshakeError("invalid recovery id in handshake".to_string())
    })?;
    let ephemeral_key = VerifyingKey::recover_from_prehash(signature_prehash.as_bytes(), &sign, rid)
        .map_err(bad_signature)?;
    Ok(ephemeral_key.into())
}

fn sign_shared_secret(
    shared_secret: H256,
    local_nonce: H256,
    local_ephemeral_key: &SecretKey,
) -> Result<H520, RLPxError> {
    let signature_prehash = shared_secret ^ local_nonce;
    let (signature, rid) = SigningKey::from(local_ephemeral_key)
        .sign_prehash_recoverable(&signature_prehash.0)
        .map_err(|_| RLPxError::HandshakeError("failed to sign handshake secret".to_string()))?;
    let mut signature_bytes = [0; 65];
    signature_bytes[..64].copy_from_slice(signature.to_bytes().as_slice());
    signature_bytes[64] = rid.to_byte();
    Ok(signature_bytes.into())
}

#[derive(Debug)]
pub(crate) struct AuthMessage {
    /// The signature of the message.
    /// The signed data is `static-shared-secret ^ initiator-nonce`.
    pub signature: H520,
    /// The node ID of the initiator.
    pub node_id: H512,
    /// The nonce generated by the initiator.
    pub nonce: H256,
    /// The version of RLPx used by the sender.
    /// The current version is 5.
    pub version: u8,
}

impl AuthMessage {
    pub fn new(signature: H520, node_id: H512, nonce: H256) -> Self {
        Self {
            signature,
            node_id,
            nonce,
            version: 5,
        }
    }
}

impl RLPEncode for AuthMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.signature)
            .encode_field(&self.node_id)
            .encode_field(&self.nonce)
            .encode_field(&self.version)
            .finish()
    }
}

impl RLPDecode for AuthMessage {
    // NOTE: discards any extra data in the list after the known fields.
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (signature, decoder) = decoder.decode_field("signature")?;
        let (node_id, decoder) = decoder.decode_field("node_id")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (version, decoder) = decoder.decode_field("version")?;

        let rest = decoder.finish_unchecked();
        let this = Self {
            signature,
            node_id,
            nonce,
            version,
        };
        Ok((this, rest))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AckMessage {
    /// The recipient's ephemeral public key.
    pub ephemeral_pubkey: H512,
    /// The nonce generated by the recipient.
    pub nonce: H256,
    /// The version of RLPx used by the recipient.
    /// The current version is 5.
    pub version: u8,
}

impl AckMessage {
    pub fn new(ephemeral_pubkey: H512, nonce: H256) -> Self {
        Self {
            ephemeral_pubkey,
            nonce,
            version: 5,
        }
    }

    pub fn get_ephemeral_pubkey(&self) -> Option<PublicKey> {
        id2pubkey(self.ephemeral_pubkey)
    }
}

impl RLPEncode for AckMessage {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ephemeral_pubkey)
            .encode_field(&self.nonce)
            .encode_field(&self.version)
            .finish()
    }
}

impl RLPDecode for AckMessage {
    // NOTE: discards any extra data in the list after the known fields.
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let decoder = Decoder::new(rlp)?;
        let (ephemeral_pubkey, decoder) = decoder.decode_field("ephemeral_pubkey")?;
        let (nonce, decoder) = decoder.decode_field("nonce")?;
        let (version, decoder) = decoder.decode_field("version")?;

        let rest = decoder.finish_unchecked();
        let this = Self {
            ephemeral_pubkey,
            nonce,
            version,
        };
        Ok((this, rest))
    }
}

/// The four-way symmetric state shared by both frame directions, derived
/// from the handshake. Wiped when the peer disconnects.
pub struct Secrets {
    pub(crate) mac_key: H256,
    pub(crate) ingress_mac: Keccak256,
    pub(crate) egress_mac: Keccak256,
    pub(crate) ingress_aes: Aes256Ctr64BE,
    pub(crate) egress_aes: Aes256Ctr64BE,
}

impl Secrets {
    /// Secrets for the side that sent the auth message.
    pub(crate) fn for_initiator(
        local_init_message: &[u8],
        local_nonce: H256,
        local_ephemeral_key: &SecretKey,
        remote_init_message: &[u8],
        remote_nonce: H256,
        remote_ephemeral_key: &PublicKey,
    ) -> Self {
        // keccak256(recipient-nonce || initiator-nonce), local node is initiator
        let hashed_nonces = Keccak256::digest([remote_nonce.0, local_nonce.0].concat()).into();
        Self::new(
            local_init_message,
            local_nonce,
            local_ephemeral_key,
            hashed_nonces,
            remote_init_message,
            remote_nonce,
            remote_ephemeral_key,
        )
    }

    /// Secrets for the side that sent the ack message.
    pub(crate) fn for_receiver(
        local_init_message: &[u8],
        local_nonce: H256,
        local_ephemeral_key: &SecretKey,
        remote_init_message: &[u8],
        remote_nonce: H256,
        remote_ephemeral_key: &PublicKey,
    ) -> Self {
        // keccak256(recipient-nonce || initiator-nonce), remote node is initiator
        let hashed_nonces = Keccak256::digest([local_nonce.0, remote_nonce.0].concat()).into();
        Self::new(
            local_init_message,
            local_nonce,
            local_ephemeral_key,
            hashed_nonces,
            remote_init_message,
            remote_nonce,
            remote_ephemeral_key,
        )
    }

    fn new(
        local_init_message: &[u8],
        local_nonce: H256,
        local_ephemeral_key: &SecretKey,
        hashed_nonces: [u8; 32],
        remote_init_message: &[u8],
        remote_nonce: H256,
        remote_ephemeral_key: &PublicKey,
    ) -> Self {
        let ephemeral_key_secret = ecdh_xchng(local_ephemeral_key, remote_ephemeral_key);

        // shared-secret = keccak256(ephemeral-key || keccak256(nonce || initiator-nonce))
        let shared_secret =
            Keccak256::digest([ephemeral_key_secret, hashed_nonces].concat()).into();
        // aes-secret = keccak256(ephemeral-key || shared-secret)
        let aes_key =
            H256(Keccak256::digest([ephemeral_key_secret, shared_secret].concat()).into());
        // mac-secret = keccak256(ephemeral-key || aes-secret)
        let mac_key = H256(Keccak256::digest([ephemeral_key_secret, aes_key.0].concat()).into());

        // egress-mac = keccak256.init((mac-secret ^ remote-nonce) || local-init-msg)
        let egress_mac = Keccak256::default()
            .chain_update(mac_key ^ remote_nonce)
            .chain_update(local_init_message);

        // ingress-mac = keccak256.init((mac-secret ^ local-nonce) || remote-init-msg)
        let ingress_mac = Keccak256::default()
            .chain_update(mac_key ^ local_nonce)
            .chain_update(remote_init_message);

        let ingress_aes = <Aes256Ctr64BE as KeyIvInit>::new(&aes_key.0.into(), &[0; 16].into());
        let egress_aes = ingress_aes.clone();
        Self {
            mac_key,
            ingress_mac,
            egress_mac,
            ingress_aes,
            egress_aes,
        }
    }

    /// Splits the state into its two directions. The reader half and the
    /// writer half of the connection each own one.
    pub(crate) fn split(self) -> (IngressState, EgressState) {
        let ingress = IngressState {
            mac_key: self.mac_key,
            mac: self.ingress_mac,
            aes: self.ingress_aes,
        };
        let egress = EgressState {
            mac_key: self.mac_key,
            mac: self.egress_mac,
            aes: self.egress_aes,
        };
        (ingress, egress)
    }
}
