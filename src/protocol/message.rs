//! Protocol message definitions
//!
//! A message is a 24-byte header followed by its payload:
//!
//! ```text
//! +------------+--------------+---------------+-------------+
//! | magic (4)  | command (12) | length (4 LE) | checksum (4)|
//! +------------+--------------+---------------+-------------+
//! | payload (variable)                                  ... |
//! +---------------------------------------------------------+
//! ```
//!
//! The checksum is the first 4 bytes of `SHA256(SHA256(payload))`.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use super::payload::VersionPayload;
use super::profile::NetworkProfile;

/// Size of the NUL padded command field
pub const COMMAND_SIZE: usize = 12;

/// Header size: magic(4) + command(12) + length(4) + checksum(4) = 24 bytes
pub const HEADER_SIZE: usize = 24;

/// Payloads above this size are checksummed on the blocking pool
const INLINE_VALIDATION_LIMIT: usize = 64 * 1024;

/// Well-known command names
pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ADDR: &str = "addr";
    pub const GETADDR: &str = "getaddr";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const NOTFOUND: &str = "notfound";
    pub const REJECT: &str = "reject";
}

/// Compute the 4-byte message checksum of a payload
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A NUL padded ASCII command name
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command([u8; COMMAND_SIZE]);

impl Command {
    /// Build a command from its name. Names longer than 12 bytes are truncated.
    pub fn new(name: &str) -> Self {
        let mut bytes = [0u8; COMMAND_SIZE];
        let len = name.len().min(COMMAND_SIZE);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; COMMAND_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_SIZE] {
        &self.0
    }

    /// The command name up to the first NUL, or "" if it is not UTF-8
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    /// Non-empty printable ASCII followed only by NUL padding
    pub fn is_well_formed(&self) -> bool {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        end > 0
            && self.0[..end].iter().all(|b| b.is_ascii_graphic())
            && self.0[end..].iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Command({:?})", self.as_str())
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parsed protocol message
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    magic: u32,
    command: Command,
    payload: Bytes,
    checksum: [u8; 4],
}

impl Message {
    /// Build an outbound message for the given network
    pub fn new(profile: &NetworkProfile, command: &str, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            magic: profile.magic,
            command: Command::new(command),
            checksum: checksum(&payload),
            payload,
        }
    }

    /// Assemble a message from header fields as received. The checksum is
    /// not verified here; see [`Message::is_valid`].
    pub(crate) fn from_parts(magic: u32, command: Command, payload: Bytes, checksum: [u8; 4]) -> Self {
        Self {
            magic,
            command,
            payload,
            checksum,
        }
    }

    /// Keepalive probe carrying a nonce
    pub fn ping(profile: &NetworkProfile, nonce: u64) -> Self {
        Self::new(profile, commands::PING, nonce.to_le_bytes().to_vec())
    }

    /// Keepalive acknowledgment echoing the probe's nonce
    pub fn pong_from_ping(ping: &Message) -> Self {
        Self {
            magic: ping.magic,
            command: Command::new(commands::PONG),
            payload: ping.payload.clone(),
            checksum: checksum(&ping.payload),
        }
    }

    pub fn version(profile: &NetworkProfile, version: &VersionPayload) -> Self {
        Self::new(profile, commands::VERSION, version.encode())
    }

    pub fn verack(profile: &NetworkProfile) -> Self {
        Self::new(profile, commands::VERACK, Bytes::new())
    }

    pub fn command(&self) -> &str {
        self.command.as_str()
    }

    pub fn command_bytes(&self) -> &Command {
        &self.command
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn checksum(&self) -> [u8; 4] {
        self.checksum
    }

    pub fn is_command(&self, name: &str) -> bool {
        self.command() == name
    }

    /// Nonce carried by a ping or pong, if the payload has one
    pub fn nonce(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// Total size on the wire
    pub fn serialized_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize header and payload into a single buffer
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        buf.put_u32(self.magic);
        buf.put_slice(self.command.as_bytes());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.checksum);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Check that the command is well formed and the checksum matches the
    /// payload. Large payloads are hashed on the blocking pool.
    pub async fn is_valid(&self) -> bool {
        if !self.command.is_well_formed() {
            return false;
        }

        let expected = self.checksum;
        if self.payload.len() <= INLINE_VALIDATION_LIMIT {
            return checksum(&self.payload) == expected;
        }

        let payload = self.payload.clone();
        tokio::task::spawn_blocking(move || checksum(&payload) == expected)
            .await
            .unwrap_or(false)
    }
}
