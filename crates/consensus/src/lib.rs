//! Chain-wide parameters and money helpers.

pub mod money;
pub mod params;

pub use money::{money_range, Amount, COIN, MAX_MONEY};
pub use params::{chain_params, ChainParams, Network, StakingParams};

pub type Hash256 = voltd_primitives::Hash256;
