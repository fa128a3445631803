//! Node configuration: JSON file overriding staking parameters and
//! supplying identity and data locations.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use voltd_consensus::params::{chain_params, ChainParams, Network};
use voltd_consensus::Amount;
use voltd_validators::{StakingError, StakingErrorKind};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct NodeConfig {
    pub network: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Address advertised in locally produced heartbeats.
    pub listen_address: Option<SocketAddr>,
    pub min_validator_stake: Option<Amount>,
    pub min_delegation: Option<Amount>,
    pub validator_maturity: Option<i32>,
    pub delegation_maturity: Option<i32>,
    pub unbonding_period: Option<i32>,
    pub jail_default_blocks: Option<i32>,
    pub heartbeat_interval: Option<i32>,
    pub uptime_window: Option<i32>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, StakingError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            StakingError::new(
                StakingErrorKind::Internal,
                format!("failed to read config {}: {err}", path.display()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            StakingError::new(
                StakingErrorKind::BadParameter,
                format!("malformed config {}: {err}", path.display()),
            )
        })
    }

    pub fn network(&self) -> Result<Network, StakingError> {
        match self.network.as_deref() {
            None | Some("mainnet") => Ok(Network::Mainnet),
            Some("testnet") => Ok(Network::Testnet),
            Some("regtest") => Ok(Network::Regtest),
            Some(other) => Err(StakingError::new(
                StakingErrorKind::BadParameter,
                format!("unknown network {other}"),
            )),
        }
    }

    /// Chain parameters for the configured network with any overrides
    /// applied.
    pub fn chain_params(&self) -> Result<ChainParams, StakingError> {
        let mut params = chain_params(self.network()?);
        let staking = &mut params.staking;
        if let Some(value) = self.min_validator_stake {
            staking.min_validator_stake = value;
        }
        if let Some(value) = self.min_delegation {
            staking.min_delegation = value;
        }
        if let Some(value) = self.validator_maturity {
            staking.validator_maturity = value;
        }
        if let Some(value) = self.delegation_maturity {
            staking.delegation_maturity = value;
        }
        if let Some(value) = self.unbonding_period {
            staking.unbonding_period = value;
        }
        if let Some(value) = self.jail_default_blocks {
            staking.jail_default_blocks = value;
        }
        if let Some(value) = self.heartbeat_interval {
            if value <= 0 {
                return Err(StakingError::new(
                    StakingErrorKind::BadParameter,
                    "heartbeat_interval must be positive",
                ));
            }
            staking.heartbeat_interval = value;
        }
        if let Some(value) = self.uptime_window {
            if value <= 0 {
                return Err(StakingError::new(
                    StakingErrorKind::BadParameter,
                    "uptime_window must be positive",
                ));
            }
            staking.uptime_window = value;
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use voltd_consensus::params::Network;

    use super::NodeConfig;

    #[test]
    fn defaults_to_mainnet() {
        let config = NodeConfig::default();
        let params = config.chain_params().expect("params");
        assert_eq!(params.network, Network::Mainnet);
    }

    #[test]
    fn overrides_apply() {
        let config: NodeConfig = serde_json::from_str(
            r#"{
                "network": "regtest",
                "min_validator_stake": 5000,
                "heartbeat_interval": 5
            }"#,
        )
        .expect("parse");
        let params = config.chain_params().expect("params");
        assert_eq!(params.network, Network::Regtest);
        assert_eq!(params.staking.min_validator_stake, 5_000);
        assert_eq!(params.staking.heartbeat_interval, 5);
    }

    #[test]
    fn rejects_bad_values() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "network": "simnet" }"#).expect("parse");
        assert!(config.chain_params().is_err());

        let config: NodeConfig =
            serde_json::from_str(r#"{ "heartbeat_interval": 0 }"#).expect("parse");
        assert!(config.chain_params().is_err());
    }
}
