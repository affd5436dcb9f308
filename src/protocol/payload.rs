//! `version` handshake payload
//!
//! ```text
//! int32    version
//! uint64   services
//! int64    timestamp
//! net_addr addr_recv   (26 bytes)
//! net_addr addr_from   (26 bytes)
//! uint64   nonce
//! var_str  user_agent
//! int32    start_height
//! bool     relay
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use super::codec::{CodecError, CodecResult};

/// Size of a `net_addr` without timestamp: services + 16-byte IP + port
const NET_ADDR_SIZE: usize = 26;

/// Default user agent advertised by this crate
pub const USER_AGENT: &str = concat!("/peernet:", env!("CARGO_PKG_VERSION"), "/");

/// Payload of a `version` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionPayload {
    /// Payload stamped with the current time and a random nonce. Both
    /// network addresses are left zeroed.
    pub fn new(version: u32, services: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        Self {
            version: version as i32,
            services,
            timestamp,
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            start_height: 0,
            relay: false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(86 + self.user_agent.len());
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services);
        buf.put_i64_le(self.timestamp);
        buf.put_bytes(0, NET_ADDR_SIZE); // addr_recv
        buf.put_bytes(0, NET_ADDR_SIZE); // addr_from
        buf.put_u64_le(self.nonce);
        put_var_int(&mut buf, self.user_agent.len() as u64);
        buf.put_slice(self.user_agent.as_bytes());
        buf.put_i32_le(self.start_height);
        buf.put_u8(self.relay as u8);
        buf.freeze()
    }

    /// Decode a peer's payload. `relay` is optional and defaults to true,
    /// as older peers omit it.
    pub fn decode(mut buf: &[u8]) -> CodecResult<Self> {
        need(buf, 4 + 8 + 8 + 2 * NET_ADDR_SIZE + 8)?;
        let version = buf.get_i32_le();
        let services = buf.get_u64_le();
        let timestamp = buf.get_i64_le();
        buf.advance(2 * NET_ADDR_SIZE);
        let nonce = buf.get_u64_le();

        let agent_len = get_var_int(&mut buf)? as usize;
        need(buf, agent_len)?;
        let user_agent = String::from_utf8_lossy(&buf[..agent_len]).into_owned();
        buf.advance(agent_len);

        need(buf, 4)?;
        let start_height = buf.get_i32_le();
        let relay = if buf.has_remaining() { buf.get_u8() != 0 } else { true };

        Ok(Self {
            version,
            services,
            timestamp,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

fn need(buf: &[u8], needed: usize) -> CodecResult<()> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Write a CompactSize integer
pub(crate) fn put_var_int(buf: &mut BytesMut, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

/// Read a CompactSize integer
pub(crate) fn get_var_int(buf: &mut &[u8]) -> CodecResult<u64> {
    need(*buf, 1)?;
    let n = match buf.get_u8() {
        0xfd => {
            need(*buf, 2)?;
            buf.get_u16_le() as u64
        }
        0xfe => {
            need(*buf, 4)?;
            buf.get_u32_le() as u64
        }
        0xff => {
            need(*buf, 8)?;
            buf.get_u64_le()
        }
        n => n as u64,
    };
    Ok(n)
}
