//! Transport-free RPC dispatch for the staking surface. An HTTP or CLI
//! front end maps straight onto `dispatch`.

use serde_json::{json, Value};
use voltd_primitives::hash::hash256_to_hex;
use voltd_primitives::KeyId;
use voltd_trust::{TrustTier, UptimeRecord};
use voltd_validators::{
    StakingError, StakingErrorKind, ValidatorRecord, ValidatorUpdateKind,
};

use crate::service::StakingNode;

const RPC_INVALID_PARAMETER: i64 = -8;
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
const RPC_TRANSACTION_ERROR: i64 = -25;
const RPC_TRANSACTION_REJECTED: i64 = -26;
const RPC_METHOD_NOT_FOUND: i64 = -32601;
const RPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Clone, Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<StakingError> for RpcError {
    fn from(err: StakingError) -> Self {
        let code = match err.kind {
            StakingErrorKind::NotFound => RPC_INVALID_ADDRESS_OR_KEY,
            StakingErrorKind::BadSignature
            | StakingErrorKind::Replay
            | StakingErrorKind::TooEarly => RPC_TRANSACTION_REJECTED,
            StakingErrorKind::WrongStatus => RPC_TRANSACTION_ERROR,
            StakingErrorKind::Internal => RPC_INTERNAL_ERROR,
            StakingErrorKind::AlreadyExists
            | StakingErrorKind::BadParameter
            | StakingErrorKind::BelowMinimum
            | StakingErrorKind::InsufficientBalance
            | StakingErrorKind::Unresolvable => RPC_INVALID_PARAMETER,
        };
        RpcError::new(code, err.message)
    }
}

pub fn dispatch(node: &StakingNode, method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        "registervalidator" => register_validator(node, params),
        "setvalidatorfee" => set_validator_fee(node, params),
        "delegatestake" => delegate_stake(node, params),
        "undelegatestake" => undelegate_stake(node, params),
        "claimrewards" => claim_rewards(node, params),
        "getmydelegations" => get_my_delegations(node),
        "getmyvalidator" => get_my_validator(node),
        "listvalidators" => list_validators(node, params),
        "getvalidator" => get_validator(node, params),
        "getvalidatorstats" => get_validator_stats(node),
        "gettrusttierinfo" => get_trust_tier_info(node),
        "getheartbeatinfo" => get_heartbeat_info(node),
        "getvalidatoraddresses" => get_validator_addresses(node, params),
        _ => Err(RpcError::new(
            RPC_METHOD_NOT_FOUND,
            format!("method {method} not found"),
        )),
    }
}

fn param(params: &Value, index: usize) -> Option<&Value> {
    params.as_array().and_then(|values| values.get(index))
}

fn amount_param(params: &Value, index: usize, name: &str) -> Result<i64, RpcError> {
    param(params, index)
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::new(RPC_INVALID_PARAMETER, format!("missing {name}")))
}

fn key_param(params: &Value, index: usize) -> Result<KeyId, RpcError> {
    let hex = param(params, index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::new(RPC_INVALID_PARAMETER, "missing validator id"))?;
    KeyId::from_hex(hex)
        .ok_or_else(|| RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "malformed validator id"))
}

fn validator_to_json(record: &ValidatorRecord, trust: Option<&UptimeRecord>, node: &StakingNode) -> Value {
    let mut value = json!({
        "validatorId": record.id.to_hex(),
        "stake": record.self_stake,
        "delegated": record.total_delegated,
        "totalStake": record.total_stake(),
        "feeRate": record.fee_bps,
        "name": record.name,
        "status": record.status.as_str(),
        "registrationHeight": record.registration_height,
        "delegatorCount": record.delegator_count,
    });
    if let Some(trust) = trust {
        let params = &node.params().staking;
        value["trustTier"] = json!(trust.trust_tier(params).as_str());
        value["uptimePerMille"] = json!(trust.uptime_per_mille());
        value["rewardMultiplier"] = json!(trust.reward_multiplier(params));
    }
    value
}

fn register_validator(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let stake = amount_param(params, 0, "stake amount")?;
    let fee_bps = amount_param(params, 1, "fee rate")?;
    let name = param(params, 2)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let record = node.register_validator(stake, fee_bps, name)?;
    Ok(json!({
        "validatorId": record.id.to_hex(),
        "status": record.status.as_str(),
        "stake": record.self_stake,
        "feeRate": record.fee_bps,
    }))
}

fn set_validator_fee(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let fee_bps = amount_param(params, 0, "fee rate")?;
    let old_fee = node
        .wallet_id()
        .and_then(|id| node.registry().get(&id))
        .map(|record| record.fee_bps);
    let record = node.submit_update(ValidatorUpdateKind::FeeBps, fee_bps, String::new())?;
    Ok(json!({
        "oldFee": old_fee,
        "newFee": record.fee_bps,
    }))
}

fn delegate_stake(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let validator = key_param(params, 0)?;
    let amount = amount_param(params, 1, "amount")?;
    let delegation_id = node.delegate(validator, amount)?;
    let record = node
        .registry()
        .get(&validator)
        .ok_or_else(|| RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "validator not found"))?;
    Ok(json!({
        "delegationId": hash256_to_hex(&delegation_id),
        "validatorId": validator.to_hex(),
        "validatorName": record.name,
        "validatorFee": record.fee_bps,
        "amount": amount,
    }))
}

fn undelegate_stake(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let validator = key_param(params, 0)?;
    let amount = param(params, 1).and_then(Value::as_i64).unwrap_or(0);
    let outcome = node.undelegate(validator, amount)?;
    Ok(json!({
        "amount": outcome.amount,
        "records": outcome.records,
        "unbondingBlocks": node.params().staking.unbonding_period,
    }))
}

fn claim_rewards(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let validator = match param(params, 0) {
        Some(Value::String(_)) => Some(key_param(params, 0)?),
        _ => None,
    };
    let (total, records) = node.claim_rewards(validator)?;
    Ok(json!({
        "totalClaimed": total,
        "count": records,
    }))
}

fn get_my_delegations(node: &StakingNode) -> Result<Value, RpcError> {
    let id = node
        .wallet_id()
        .ok_or_else(|| RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "no wallet key loaded"))?;
    let entries: Vec<Value> = node
        .ledger()
        .for_delegator(&id)
        .into_iter()
        .map(|(delegation_id, record)| {
            json!({
                "delegationId": hash256_to_hex(&delegation_id),
                "validatorId": record.validator.to_hex(),
                "amount": record.amount,
                "status": record.status.as_str(),
                "delegationHeight": record.delegation_height,
                "pendingRewards": record.pending_rewards,
            })
        })
        .collect();
    Ok(Value::Array(entries))
}

fn get_my_validator(node: &StakingNode) -> Result<Value, RpcError> {
    let id = node
        .wallet_id()
        .ok_or_else(|| RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "no wallet key loaded"))?;
    let record = node
        .registry()
        .get(&id)
        .ok_or_else(|| RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "wallet is not a validator"))?;
    let trust = node.scorer().get(&id);
    Ok(validator_to_json(&record, trust.as_ref(), node))
}

fn list_validators(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let max_fee = param(params, 0).and_then(Value::as_i64);
    let active_only = param(params, 1).and_then(Value::as_bool).unwrap_or(true);
    let records = match (max_fee, active_only) {
        (Some(max_fee), _) => node.registry().by_max_fee(max_fee),
        (None, true) => node.registry().by_stake_desc(),
        (None, false) => node.registry().all_validators(),
    };
    let entries: Vec<Value> = records
        .iter()
        .map(|record| {
            let trust = node.scorer().get(&record.id);
            validator_to_json(record, trust.as_ref(), node)
        })
        .collect();
    Ok(Value::Array(entries))
}

fn get_validator(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let id = key_param(params, 0)?;
    let record = node
        .registry()
        .get(&id)
        .ok_or_else(|| RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "validator not found"))?;
    let trust = node.scorer().get(&id);
    Ok(validator_to_json(&record, trust.as_ref(), node))
}

fn get_validator_stats(node: &StakingNode) -> Result<Value, RpcError> {
    let records = node.registry().all_validators();
    let total_staked: i64 = records.iter().map(|record| record.self_stake).sum();
    let total_delegated: i64 = records.iter().map(|record| record.total_delegated).sum();
    let tier_counts = node.scorer().tier_counts();
    Ok(json!({
        "totalValidators": records.len(),
        "activeValidators": node.registry().active_count(),
        "totalStaked": total_staked,
        "totalDelegated": total_delegated,
        "totalDelegations": node.ledger().active_count(),
        "tierCounts": {
            "none": tier_counts[0],
            "bronze": tier_counts[1],
            "silver": tier_counts[2],
            "gold": tier_counts[3],
            "platinum": tier_counts[4],
        },
    }))
}

fn get_trust_tier_info(node: &StakingNode) -> Result<Value, RpcError> {
    let params = &node.params().staking;
    let tiers: Vec<Value> = [
        TrustTier::Bronze,
        TrustTier::Silver,
        TrustTier::Gold,
        TrustTier::Platinum,
    ]
    .iter()
    .map(|tier| {
        json!({
            "tier": tier.as_str(),
            "uptimeThresholdPerMille": tier.threshold(params),
            "rewardMultiplier": tier.reward_multiplier(params),
        })
    })
    .collect();
    Ok(json!({
        "heartbeatInterval": params.heartbeat_interval,
        "uptimeWindow": params.uptime_window,
        "tiers": tiers,
    }))
}

fn get_heartbeat_info(node: &StakingNode) -> Result<Value, RpcError> {
    let stats = node.heartbeats().stats();
    Ok(json!({
        "isValidator": stats.is_validator,
        "lastBroadcastHeight": stats.last_broadcast_height,
        "seenHeartbeats": stats.seen_heartbeats,
        "activeValidators": stats.active_validators,
    }))
}

fn get_validator_addresses(node: &StakingNode, params: &Value) -> Result<Value, RpcError> {
    let min_tier = match param(params, 0).and_then(Value::as_str) {
        None => None,
        Some("bronze") => Some(TrustTier::Bronze),
        Some("silver") => Some(TrustTier::Silver),
        Some("gold") => Some(TrustTier::Gold),
        Some("platinum") => Some(TrustTier::Platinum),
        Some(other) => {
            return Err(RpcError::new(
                RPC_INVALID_PARAMETER,
                format!("unknown tier {other}"),
            ));
        }
    };
    let addresses = match min_tier {
        Some(tier) => node.scorer().trusted_addresses(tier),
        None => node.scorer().validator_addresses(),
    };
    let entries: Vec<Value> = addresses
        .iter()
        .map(|address| Value::String(address.to_string()))
        .collect();
    Ok(Value::Array(entries))
}
