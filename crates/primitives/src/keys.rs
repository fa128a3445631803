//! 160-bit key identifiers derived from public keys.

use std::fmt;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::hash160;

/// Hash160 of a serialized public key. Identifies validators and delegators.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeyId(pub [u8; 20]);

pub type ValidatorId = KeyId;
pub type DelegatorId = KeyId;

impl KeyId {
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        KeyId(hash160(pubkey))
    }

    pub fn null() -> Self {
        KeyId([0u8; 20])
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(40);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.len() != 40 || !input.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&input[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(KeyId(bytes))
    }

    pub fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.0);
    }

    pub fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(KeyId(decoder.read_fixed::<20>()?))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
