use ethwire_rlp::error::RLPDecodeError;
use thiserror::Error;

/// Errors from the raw packet framing layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet is below the minimum size")]
    TooSmall,
    #[error("header unmasking produced an unknown protocol id")]
    HeaderDecryptionFailed,
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u16),
    #[error("unknown packet flag {0}")]
    UnknownFlag(u8),
    #[error("authdata size does not fit its flag")]
    InvalidAuthDataSize,
    #[error("unexpected body on a WHOAREYOU packet")]
    UnexpectedBody,
    #[error("unexpected id-nonce signature size {0}")]
    InvalidSignatureSize(u8),
    #[error("unexpected ephemeral key size {0}")]
    InvalidEphemeralKeySize(u8),
}

/// Errors from the session codec.
#[derive(Debug, Error)]
pub enum Discv5Error {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("no pending challenge for this node")]
    MissingChallenge,
    #[error("session key derivation failed")]
    KeyDerivationFailed,
    #[error("invalid remote public key")]
    InvalidRemotePublicKey,
    #[error("signing the id-nonce failed")]
    SigningFailed,
    #[error("invalid id-nonce signature")]
    InvalidSignature,
    #[error("message decryption failed")]
    DecryptionFailed,
    #[error("message encryption failed")]
    EncryptionFailed,
    #[error("undecodable ENR record: {0}")]
    InvalidEnr(#[from] RLPDecodeError),
}
