use ldoged_consensus::{Hash256, ZERO_HASH};

use crate::encoding::{DecodeError, Decoder, Encoder};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub const SIZE: usize = 36;

    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn null() -> Self {
        Self {
            hash: ZERO_HASH,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == u32::MAX
    }

    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.index);
    }

    pub fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }

    /// Store key: hash followed by the little-endian index.
    pub fn to_key(&self) -> [u8; Self::SIZE] {
        let mut key = [0u8; Self::SIZE];
        key[..32].copy_from_slice(&self.hash);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }
}
