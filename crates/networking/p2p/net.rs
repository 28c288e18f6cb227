pub mod discv5;
pub mod rlpx;

pub use rlpx::connection::RLPxConnection;
pub use rlpx::dispatcher::{MessageInfo, MessageKind, Protocol, ProtocolRegistry};
pub use rlpx::p2p::{Capability, DisconnectReason};

/// Maximum size of a single RLPx message, before compression.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum size of a discovery UDP datagram.
pub const MAX_DISC_PACKET_SIZE: usize = 1280;
