//! Session-key generation and authenticated encryption for discovery v5.
//! Diffie-Hellman agreement over secp256k1, HKDF (SHA2-256) key derivation,
//! and AES-128-GCM for message bodies. The algorithms are fixed by the wire
//! protocol, there is nothing to negotiate.

use aes_gcm::{
    aead::{Aead, Payload},
    Aes128Gcm, KeyInit, Nonce,
};
use bytes::Bytes;
use ethwire_rlp::structs::Decoder;
use hkdf::Hkdf;
use k256::{
    ecdsa::{
        signature::{DigestSigner, DigestVerifier},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
    sha2::{Digest, Sha256},
    PublicKey, SecretKey,
};
use sha3::{Digest as _, Keccak256};
use zeroize::Zeroize;

use super::{
    error::Discv5Error,
    packet::{MessageNonce, NodeId},
};
use crate::rlpx::utils::pubkey2id;

pub const KEY_LENGTH: usize = 16;
const KEY_AGREEMENT_STRING: &str = "discovery v5 key agreement";
const ID_SIGNATURE_TEXT: &str = "discovery v5 identity proof";

pub type Key = [u8; KEY_LENGTH];

/// Computes a node's discv5 id: the keccak-256 hash of its uncompressed
/// public key.
pub fn node_id(pubkey: &PublicKey) -> NodeId {
    NodeId::from_slice(&Keccak256::digest(pubkey2id(pubkey)))
}

/// The discv5 flavor of ECDH. Unlike the RLPx handshake, the shared secret
/// is the full compressed point, not just its x coordinate.
pub(crate) fn ecdh(remote_pubkey: &PublicKey, local_secret: &SecretKey) -> [u8; 33] {
    let shared = remote_pubkey.to_projective() * *local_secret.to_nonzero_scalar();
    let shared = PublicKey::from_affine(shared.to_affine())
        .expect("a nonzero multiple of a valid point is a valid point");
    let mut out = [0u8; 33];
    out.copy_from_slice(shared.to_encoded_point(true).as_bytes());
    out
}

/// The two directional AES-GCM keys of a session. Scrubbed on drop; session
/// tables can evict entries freely.
pub struct SessionKeys {
    pub write_key: Key,
    pub read_key: Key,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.write_key.zeroize();
        self.read_key.zeroize();
    }
}

/// Derives the session keys from an ECDH secret. Returns
/// `(initiator_key, recipient_key)`; the initiator writes with the first,
/// the recipient with the second.
pub(crate) fn derive_session_keys(
    secret: &[u8],
    initiator_id: &NodeId,
    recipient_id: &NodeId,
    challenge_data: &[u8],
) -> Result<(Key, Key), Discv5Error> {
    let mut info = Vec::with_capacity(KEY_AGREEMENT_STRING.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_STRING.as_bytes());
    info.extend_from_slice(initiator_id.as_bytes());
    info.extend_from_slice(recipient_id.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(challenge_data), secret);
    let mut okm = [0u8; 2 * KEY_LENGTH];
    hk.expand(&info, &mut okm)
        .map_err(|_| Discv5Error::KeyDerivationFailed)?;

    let mut initiator_key: Key = Default::default();
    let mut recipient_key: Key = Default::default();
    initiator_key.copy_from_slice(&okm[..KEY_LENGTH]);
    recipient_key.copy_from_slice(&okm[KEY_LENGTH..]);
    okm.zeroize();

    Ok((initiator_key, recipient_key))
}

fn id_proof_digest(challenge_data: &[u8], ephem_pubkey: &[u8], dst_id: &NodeId) -> Sha256 {
    Sha256::new()
        .chain_update(ID_SIGNATURE_TEXT.as_bytes())
        .chain_update(challenge_data)
        .chain_update(ephem_pubkey)
        .chain_update(dst_id.as_bytes())
}

/// Signs the identity proof of a handshake with the long-term key.
pub(crate) fn sign_id_nonce(
    signing_key: &SecretKey,
    challenge_data: &[u8],
    ephem_pubkey: &[u8],
    dst_id: &NodeId,
) -> Result<[u8; 64], Discv5Error> {
    let signature: Signature = SigningKey::from(signing_key)
        .try_sign_digest(id_proof_digest(challenge_data, ephem_pubkey, dst_id))
        .map_err(|_| Discv5Error::SigningFailed)?;
    Ok(signature.to_bytes().into())
}

/// Verifies the identity proof carried in a handshake packet.
pub(crate) fn verify_id_nonce_signature(
    remote_pubkey: &PublicKey,
    challenge_data: &[u8],
    ephem_pubkey: &[u8],
    dst_id: &NodeId,
    sig: &[u8],
) -> bool {
    let Ok(signature) = Signature::from_slice(sig) else {
        return false;
    };
    VerifyingKey::from(remote_pubkey)
        .verify_digest(
            id_proof_digest(challenge_data, ephem_pubkey, dst_id),
            &signature,
        )
        .is_ok()
}

/// Seals a message body. The additional data is the packet's challenge data.
pub(crate) fn encrypt_message(
    key: &Key,
    nonce: MessageNonce,
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Discv5Error> {
    let aead = Aes128Gcm::new(key.into());
    let payload = Payload { msg, aad };
    aead.encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| Discv5Error::EncryptionFailed)
}

/// Opens a message body sealed by [`encrypt_message`].
pub(crate) fn decrypt_message(
    key: &Key,
    nonce: MessageNonce,
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Discv5Error> {
    if msg.len() < 16 {
        // too short to even hold the GCM tag
        return Err(Discv5Error::DecryptionFailed);
    }
    let aead = Aes128Gcm::new(key.into());
    let payload = Payload { msg, aad };
    aead.decrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| Discv5Error::DecryptionFailed)
}

/// Pulls the compressed secp256k1 public key out of a node record:
/// `[signature, seq, k, v, ...]` with keys in sorted order.
pub(crate) fn enr_public_key(enr_rlp: &[u8]) -> Result<Option<PublicKey>, Discv5Error> {
    let decoder = Decoder::new(enr_rlp)?;
    let (_signature, decoder): (Bytes, _) = decoder.decode_field("signature")?;
    let (_seq, mut decoder): (u64, _) = decoder.decode_field("seq")?;

    while decoder.has_remaining() {
        let (key, rest): (Bytes, _) = decoder.decode_field("key")?;
        if key.as_ref() == b"secp256k1" {
            let (value, _): (Bytes, _) = rest.decode_field("value")?;
            let pubkey = PublicKey::from_sec1_bytes(value.as_ref())
                .map_err(|_| Discv5Error::InvalidRemotePublicKey)?;
            return Ok(Some(pubkey));
        }
        // skip the value of any other key without interpreting it
        let (_value, rest) = rest.get_encoded_item()?;
        decoder = rest;
    }
    Ok(None)
}
