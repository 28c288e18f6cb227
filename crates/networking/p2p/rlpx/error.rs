use crate::rlpx::p2p::DisconnectReason;
use ethwire_rlp::error::{RLPDecodeError, RLPEncodeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RLPxError {
    #[error("tcp error: {0}")]
    TcpError(#[from] std::io::Error),
    #[error("breach of protocol: {0}")]
    BreachOfProtocol(String),
    #[error("handshake error: {0}")]
    HandshakeError(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("hello node id does not match the handshake key")]
    InvalidIdentity,
    #[error("no common capabilities")]
    UselessPeer,
    #[error("peer disconnected: {0}")]
    PeerDisconnected(DisconnectReason),
    #[error("request timed out")]
    RequestTimeout,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("message exceeds the {0} byte limit")]
    MessageTooBig(usize),
    #[error(transparent)]
    RLPDecode(#[from] RLPDecodeError),
    #[error(transparent)]
    RLPEncode(#[from] RLPEncodeError),
}

impl RLPxError {
    /// The disconnect reason reported to the remote when this error tears
    /// the connection down.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            RLPxError::TcpError(_) => DisconnectReason::TcpError,
            RLPxError::HandshakeError(_) | RLPxError::HandshakeTimeout => {
                DisconnectReason::PingTimeout
            }
            RLPxError::InvalidIdentity => DisconnectReason::InvalidIdentity,
            RLPxError::UselessPeer => DisconnectReason::UselessPeer,
            RLPxError::PeerDisconnected(reason) => *reason,
            _ => DisconnectReason::BreachOfProtocol,
        }
    }
}
