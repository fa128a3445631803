//! Staking node glue: wires the registry, ledger, scorer, heartbeat
//! manager, and peer discovery together and exposes the RPC-level
//! operation surface.

pub mod config;
pub mod rpc;
pub mod service;

pub use config::NodeConfig;
pub use rpc::{dispatch, RpcError};
pub use service::{ChannelSink, CoinstakeSplit, StakingNode};
