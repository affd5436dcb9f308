//! Protocol module - Defines the Bitcoin P2P wire format
//!
//! Every message is framed by a fixed header:
//! - 4 bytes network magic (big-endian)
//! - 12 bytes NUL padded command name
//! - 4 bytes payload length (little-endian)
//! - 4 bytes checksum (double SHA-256 of the payload)
//! - Variable length payload

mod codec;
mod inventory;
mod message;
mod payload;
mod profile;

pub use codec::*;
pub use inventory::*;
pub use message::*;
pub use payload::*;
pub use profile::*;
