//! Inventory vectors used by `inv`, `getdata` and `notfound`

use bytes::{Buf, BufMut, BytesMut};

use super::codec::{CodecError, CodecResult};
use super::payload::{get_var_int, put_var_int};

/// Encoded size: type(4) + hash(32)
pub const INVENTORY_SIZE: usize = 36;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;

/// A typed object hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub type_num: u32,
    pub hash: [u8; 32],
}

impl Inventory {
    pub fn new(type_num: u32, hash: [u8; 32]) -> Self {
        Self { type_num, hash }
    }

    pub fn is_tx(&self) -> bool {
        self.type_num == MSG_TX
    }

    pub fn is_block(&self) -> bool {
        self.type_num == MSG_BLOCK
    }

    pub fn is_filtered_block(&self) -> bool {
        self.type_num == MSG_FILTERED_BLOCK
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.type_num);
        buf.put_slice(&self.hash);
    }

    /// Decode one record, advancing `buf` past it
    pub fn decode(buf: &mut &[u8]) -> CodecResult<Self> {
        if buf.len() < INVENTORY_SIZE {
            return Err(CodecError::Truncated {
                needed: INVENTORY_SIZE,
                available: buf.len(),
            });
        }

        let type_num = buf.get_u32_le();
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        Ok(Self { type_num, hash })
    }

    /// Encode an `inv`/`getdata`/`notfound` payload
    pub fn encode_list(items: &[Inventory]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(9 + items.len() * INVENTORY_SIZE);
        put_var_int(&mut buf, items.len() as u64);
        for item in items {
            item.encode(&mut buf);
        }
        buf
    }

    /// Decode a count-prefixed list of records
    pub fn decode_list(mut buf: &[u8]) -> CodecResult<Vec<Inventory>> {
        let count = get_var_int(&mut buf)? as usize;
        if buf.len() < count.saturating_mul(INVENTORY_SIZE) {
            return Err(CodecError::Truncated {
                needed: count.saturating_mul(INVENTORY_SIZE),
                available: buf.len(),
            });
        }
        (0..count).map(|_| Inventory::decode(&mut buf)).collect()
    }
}
