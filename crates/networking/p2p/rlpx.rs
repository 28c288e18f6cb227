pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod p2p;
pub mod requests;
pub mod utils;
