//! Core staking types and consensus serialization.

pub mod encoding;
pub mod hash;
pub mod keys;
pub mod outpoint;
pub mod sig;

pub use hash::{hash160, sha256, sha256d, Hash256};
pub use keys::{DelegatorId, KeyId, ValidatorId};
pub use outpoint::OutPoint;
