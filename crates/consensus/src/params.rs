//! Per-network staking parameters.

use crate::money::{Amount, COIN};

/// Pool fee bounds, in basis points.
pub const MIN_POOL_FEE_BPS: i64 = 0;
pub const MAX_POOL_FEE_BPS: i64 = 10_000;
pub const DEFAULT_POOL_FEE_BPS: i64 = 1_000;

/// Maximum validator name length, in bytes.
pub const MAX_VALIDATOR_NAME: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct StakingParams {
    pub min_validator_stake: Amount,
    pub min_delegation: Amount,
    /// Blocks after registration before a validator can turn Active.
    pub validator_maturity: i32,
    /// Blocks after creation before a delegation earns rewards.
    pub delegation_maturity: i32,
    /// Cool-down blocks for deactivation and undelegation.
    pub unbonding_period: i32,
    pub jail_default_blocks: i32,
    /// Expected blocks between heartbeats from each validator.
    pub heartbeat_interval: i32,
    /// Rolling span of blocks over which uptime is measured.
    pub uptime_window: i32,
    /// Tier thresholds on uptime, in per-mille.
    pub bronze_uptime: i32,
    pub silver_uptime: i32,
    pub gold_uptime: i32,
    pub platinum_uptime: i32,
    /// Tier reward multipliers, in percent (100 = 1.0x).
    pub bronze_multiplier: i32,
    pub silver_multiplier: i32,
    pub gold_multiplier: i32,
    pub platinum_multiplier: i32,
    /// Default P2P port, used when heartbeat addresses omit one.
    pub default_port: u16,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub staking: StakingParams,
}

pub fn chain_params(network: Network) -> ChainParams {
    let staking = match network {
        Network::Mainnet => StakingParams {
            min_validator_stake: 100_000 * COIN,
            min_delegation: 1_000 * COIN,
            validator_maturity: 2_000,
            delegation_maturity: 500,
            unbonding_period: 259_200,
            jail_default_blocks: 86_400,
            heartbeat_interval: 60,
            uptime_window: 86_400,
            bronze_uptime: 950,
            silver_uptime: 970,
            gold_uptime: 990,
            platinum_uptime: 999,
            bronze_multiplier: 100,
            silver_multiplier: 125,
            gold_multiplier: 150,
            platinum_multiplier: 200,
            default_port: 17_771,
        },
        Network::Testnet => StakingParams {
            min_validator_stake: 1_000 * COIN,
            min_delegation: 10 * COIN,
            validator_maturity: 200,
            delegation_maturity: 50,
            unbonding_period: 7_200,
            jail_default_blocks: 1_440,
            heartbeat_interval: 60,
            uptime_window: 14_400,
            bronze_uptime: 950,
            silver_uptime: 970,
            gold_uptime: 990,
            platinum_uptime: 999,
            bronze_multiplier: 100,
            silver_multiplier: 125,
            gold_multiplier: 150,
            platinum_multiplier: 200,
            default_port: 27_771,
        },
        Network::Regtest => StakingParams {
            min_validator_stake: 100 * COIN,
            min_delegation: 10 * COIN,
            validator_maturity: 20,
            delegation_maturity: 5,
            unbonding_period: 50,
            jail_default_blocks: 25,
            heartbeat_interval: 10,
            uptime_window: 100,
            bronze_uptime: 950,
            silver_uptime: 970,
            gold_uptime: 990,
            platinum_uptime: 999,
            bronze_multiplier: 100,
            silver_multiplier: 125,
            gold_multiplier: 150,
            platinum_multiplier: 200,
            default_port: 37_771,
        },
    };
    ChainParams { network, staking }
}

#[cfg(test)]
mod tests {
    use super::{chain_params, Network};
    use crate::money::COIN;

    #[test]
    fn mainnet_defaults() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.staking.min_validator_stake, 100_000 * COIN);
        assert_eq!(params.staking.min_delegation, 1_000 * COIN);
        assert_eq!(params.staking.unbonding_period, 259_200);
        assert_eq!(params.staking.platinum_uptime, 999);
    }

    #[test]
    fn regtest_is_small_enough_for_tests() {
        let params = chain_params(Network::Regtest);
        assert!(params.staking.validator_maturity <= 20);
        assert!(params.staking.heartbeat_interval <= 10);
    }
}
