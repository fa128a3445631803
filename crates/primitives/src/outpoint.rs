use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::Hash256;

/// Reference to a transaction output.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }

    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.hash);
        encoder.write_u32_le(self.index);
    }

    pub fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let hash = decoder.read_fixed::<32>()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }
}
