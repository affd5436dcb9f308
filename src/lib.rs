//! PeerNet - Peer connection engine for the Bitcoin P2P wire protocol
//!
//! Reassembles messages from chunked transports, hands each one to every
//! caller waiting for it and keeps the link alive with automatic pongs.

pub mod config;
pub mod network;
pub mod protocol;
