//! Validator registry: registration records, signed updates, and stake
//! aggregates maintained on behalf of the delegation ledger.

use std::collections::BTreeMap;
use std::sync::Mutex;

use secp256k1::SecretKey;
use tracing::{debug, info, warn};
use voltd_consensus::params::{MAX_POOL_FEE_BPS, MAX_VALIDATOR_NAME, MIN_POOL_FEE_BPS};
use voltd_consensus::{Amount, StakingParams};
use voltd_primitives::encoding::{DecodeError, Decoder, Encoder};
use voltd_primitives::hash::sha256d;
use voltd_primitives::sig::{sign_digest, verify_digest};
use voltd_primitives::{Hash256, OutPoint, ValidatorId};

use crate::error::{StakingError, StakingErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidatorStatus {
    Pending,
    Active,
    Inactive,
    Jailed,
    Unbonding,
}

impl ValidatorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidatorStatus::Pending => "pending",
            ValidatorStatus::Active => "active",
            ValidatorStatus::Inactive => "inactive",
            ValidatorStatus::Jailed => "jailed",
            ValidatorStatus::Unbonding => "unbonding",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ValidatorStatus::Pending => 0,
            ValidatorStatus::Active => 1,
            ValidatorStatus::Inactive => 2,
            ValidatorStatus::Jailed => 3,
            ValidatorStatus::Unbonding => 4,
        }
    }

    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(ValidatorStatus::Pending),
            1 => Ok(ValidatorStatus::Active),
            2 => Ok(ValidatorStatus::Inactive),
            3 => Ok(ValidatorStatus::Jailed),
            4 => Ok(ValidatorStatus::Unbonding),
            _ => Err(DecodeError::InvalidValue("unknown validator status")),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatorRecord {
    pub id: ValidatorId,
    pub pubkey: Vec<u8>,
    pub self_stake: Amount,
    pub fee_bps: i64,
    pub name: String,
    pub registration_height: i32,
    pub last_active_height: i32,
    pub jail_release_height: i32,
    pub status: ValidatorStatus,
    pub stake_outpoint: Option<OutPoint>,
    pub total_delegated: Amount,
    pub delegator_count: u32,
}

impl ValidatorRecord {
    pub fn new(
        id: ValidatorId,
        pubkey: Vec<u8>,
        self_stake: Amount,
        fee_bps: i64,
        name: String,
        registration_height: i32,
    ) -> Self {
        Self {
            id,
            pubkey,
            self_stake,
            fee_bps,
            name,
            registration_height,
            last_active_height: registration_height,
            jail_release_height: 0,
            status: ValidatorStatus::Pending,
            stake_outpoint: None,
            total_delegated: 0,
            delegator_count: 0,
        }
    }

    pub fn total_stake(&self) -> Amount {
        self.self_stake + self.total_delegated
    }

    pub fn meets_minimum_stake(&self, params: &StakingParams) -> bool {
        self.self_stake >= params.min_validator_stake
    }

    pub fn is_eligible_for_staking(&self, params: &StakingParams, height: i32) -> bool {
        self.status == ValidatorStatus::Active
            && self.meets_minimum_stake(params)
            && height - self.registration_height >= params.validator_maturity
    }

    /// Delegators' post-fee share of a block reward. The pool fee on the
    /// delegators' proportional slice stays with the validator, as does any
    /// floor-rounding residue.
    pub fn delegators_reward(&self, block_reward: Amount) -> Amount {
        let total = self.total_stake();
        if total == 0 || self.total_delegated == 0 {
            return 0;
        }
        let share =
            (i128::from(block_reward) * i128::from(self.total_delegated) / i128::from(total)) as Amount;
        let fee = (i128::from(share) * i128::from(self.fee_bps) / 10_000) as Amount;
        share - fee
    }

    pub fn validator_reward(&self, block_reward: Amount) -> Amount {
        block_reward - self.delegators_reward(block_reward)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.id.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_i64_le(self.self_stake);
        encoder.write_i64_le(self.fee_bps);
        encoder.write_var_str(&self.name);
        encoder.write_i32_le(self.registration_height);
        encoder.write_i32_le(self.last_active_height);
        encoder.write_i32_le(self.jail_release_height);
        encoder.write_u8(self.status.to_u8());
        write_optional_outpoint(&mut encoder, &self.stake_outpoint);
        encoder.write_i64_le(self.total_delegated);
        encoder.write_u32_le(self.delegator_count);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let id = ValidatorId::consensus_decode(decoder)?;
        let pubkey = decoder.read_var_bytes()?;
        let self_stake = decoder.read_i64_le()?;
        let fee_bps = decoder.read_i64_le()?;
        let name = decoder.read_var_str()?;
        let registration_height = decoder.read_i32_le()?;
        let last_active_height = decoder.read_i32_le()?;
        let jail_release_height = decoder.read_i32_le()?;
        let status = ValidatorStatus::from_u8(decoder.read_u8()?)?;
        let stake_outpoint = read_optional_outpoint(decoder)?;
        let total_delegated = decoder.read_i64_le()?;
        let delegator_count = decoder.read_u32_le()?;
        Ok(Self {
            id,
            pubkey,
            self_stake,
            fee_bps,
            name,
            registration_height,
            last_active_height,
            jail_release_height,
            status,
            stake_outpoint,
            total_delegated,
            delegator_count,
        })
    }
}

pub(crate) fn write_optional_outpoint(encoder: &mut Encoder, outpoint: &Option<OutPoint>) {
    match outpoint {
        Some(outpoint) => {
            encoder.write_u8(1);
            outpoint.consensus_encode(encoder);
        }
        None => encoder.write_u8(0),
    }
}

pub(crate) fn read_optional_outpoint(decoder: &mut Decoder) -> Result<Option<OutPoint>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(OutPoint::consensus_decode(decoder)?)),
        _ => Err(DecodeError::InvalidValue("bad outpoint flag")),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidatorUpdateKind {
    FeeBps,
    Name,
    Deactivate,
    Reactivate,
    IncreaseStake,
    DecreaseStake,
}

impl ValidatorUpdateKind {
    fn to_u8(self) -> u8 {
        match self {
            ValidatorUpdateKind::FeeBps => 1,
            ValidatorUpdateKind::Name => 2,
            ValidatorUpdateKind::Deactivate => 3,
            ValidatorUpdateKind::Reactivate => 4,
            ValidatorUpdateKind::IncreaseStake => 5,
            ValidatorUpdateKind::DecreaseStake => 6,
        }
    }

    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(ValidatorUpdateKind::FeeBps),
            2 => Ok(ValidatorUpdateKind::Name),
            3 => Ok(ValidatorUpdateKind::Deactivate),
            4 => Ok(ValidatorUpdateKind::Reactivate),
            5 => Ok(ValidatorUpdateKind::IncreaseStake),
            6 => Ok(ValidatorUpdateKind::DecreaseStake),
            _ => Err(DecodeError::InvalidValue("unknown update kind")),
        }
    }
}

/// Signed modification of an existing validator record.
#[derive(Clone, Debug)]
pub struct ValidatorUpdate {
    pub validator_id: ValidatorId,
    pub kind: ValidatorUpdateKind,
    pub new_value: i64,
    pub new_name: String,
    pub height: i32,
    pub signature: Vec<u8>,
}

impl ValidatorUpdate {
    pub fn sighash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.validator_id.consensus_encode(&mut encoder);
        encoder.write_u8(self.kind.to_u8());
        encoder.write_i64_le(self.new_value);
        encoder.write_var_str(&self.new_name);
        encoder.write_i32_le(self.height);
        sha256d(&encoder.into_inner())
    }

    pub fn sign(&mut self, secret: &SecretKey) {
        self.signature = sign_digest(secret, &self.sighash());
    }

    pub fn verify(&self, pubkey: &[u8]) -> bool {
        verify_digest(pubkey, &self.sighash(), &self.signature)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.validator_id.consensus_encode(&mut encoder);
        encoder.write_u8(self.kind.to_u8());
        encoder.write_i64_le(self.new_value);
        encoder.write_var_str(&self.new_name);
        encoder.write_i32_le(self.height);
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let validator_id = ValidatorId::consensus_decode(&mut decoder)?;
        let kind = ValidatorUpdateKind::from_u8(decoder.read_u8()?)?;
        let new_value = decoder.read_i64_le()?;
        let new_name = decoder.read_var_str()?;
        let height = decoder.read_i32_le()?;
        let signature = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            validator_id,
            kind,
            new_value,
            new_name,
            height,
            signature,
        })
    }
}

/// Status transition observed during a block tick, reported so callers can
/// mirror it into the trust scorer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusChange {
    pub id: ValidatorId,
    pub from: ValidatorStatus,
    pub to: ValidatorStatus,
}

#[derive(Default)]
struct RegistryInner {
    validators: BTreeMap<ValidatorId, ValidatorRecord>,
    by_outpoint: BTreeMap<OutPoint, ValidatorId>,
    height: i32,
}

/// Authoritative map from validator id to registration record.
///
/// A single mutex guards the record map and the outpoint index; every
/// operation holds it for its full duration and never takes another
/// component's lock while doing so.
pub struct ValidatorRegistry {
    params: StakingParams,
    inner: Mutex<RegistryInner>,
}

impl ValidatorRegistry {
    pub fn new(params: StakingParams) -> Self {
        Self {
            params,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn params(&self) -> &StakingParams {
        &self.params
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RegistryInner>, StakingError> {
        self.inner.lock().map_err(|_| {
            StakingError::new(StakingErrorKind::Internal, "validator registry lock poisoned")
        })
    }

    /// Installs a new record in Pending status.
    pub fn register(&self, mut record: ValidatorRecord) -> Result<(), StakingError> {
        if !(MIN_POOL_FEE_BPS..=MAX_POOL_FEE_BPS).contains(&record.fee_bps) {
            return Err(StakingError::new(
                StakingErrorKind::BadParameter,
                format!("pool fee {} out of range", record.fee_bps),
            ));
        }
        if record.self_stake < self.params.min_validator_stake {
            return Err(StakingError::new(
                StakingErrorKind::BelowMinimum,
                format!(
                    "stake {} below minimum {}",
                    record.self_stake, self.params.min_validator_stake
                ),
            ));
        }
        if record.name.len() > MAX_VALIDATOR_NAME {
            return Err(StakingError::new(
                StakingErrorKind::BadParameter,
                format!("validator name longer than {MAX_VALIDATOR_NAME} bytes"),
            ));
        }

        let mut inner = self.lock()?;
        if inner.validators.contains_key(&record.id) {
            return Err(StakingError::new(
                StakingErrorKind::AlreadyExists,
                format!("validator {} already registered", record.id),
            ));
        }
        if let Some(outpoint) = record.stake_outpoint {
            if inner.by_outpoint.contains_key(&outpoint) {
                return Err(StakingError::new(
                    StakingErrorKind::AlreadyExists,
                    "stake outpoint already indexed",
                ));
            }
            inner.by_outpoint.insert(outpoint, record.id);
        }
        record.status = ValidatorStatus::Pending;
        info!(
            validator = %record.id,
            stake = record.self_stake,
            fee_bps = record.fee_bps,
            "registered validator"
        );
        inner.validators.insert(record.id, record);
        Ok(())
    }

    /// Verifies and applies a signed update, returning the updated record.
    pub fn process_update(&self, update: &ValidatorUpdate) -> Result<ValidatorRecord, StakingError> {
        let mut inner = self.lock()?;
        let height = inner.height;
        let entry = inner.validators.get_mut(&update.validator_id).ok_or_else(|| {
            StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {}", update.validator_id),
            )
        })?;

        if !update.verify(&entry.pubkey) {
            return Err(StakingError::new(
                StakingErrorKind::BadSignature,
                "invalid signature on validator update",
            ));
        }

        match update.kind {
            ValidatorUpdateKind::FeeBps => {
                if !(MIN_POOL_FEE_BPS..=MAX_POOL_FEE_BPS).contains(&update.new_value) {
                    return Err(StakingError::new(
                        StakingErrorKind::BadParameter,
                        format!("pool fee {} out of range", update.new_value),
                    ));
                }
                entry.fee_bps = update.new_value;
                info!(validator = %entry.id, fee_bps = entry.fee_bps, "updated pool fee");
            }
            ValidatorUpdateKind::Name => {
                if update.new_name.len() > MAX_VALIDATOR_NAME {
                    return Err(StakingError::new(
                        StakingErrorKind::BadParameter,
                        format!("validator name longer than {MAX_VALIDATOR_NAME} bytes"),
                    ));
                }
                entry.name = update.new_name.clone();
                info!(validator = %entry.id, name = %entry.name, "updated validator name");
            }
            ValidatorUpdateKind::Deactivate => {
                entry.status = ValidatorStatus::Unbonding;
                entry.last_active_height = height;
                info!(validator = %entry.id, "validator deactivating, unbonding started");
            }
            ValidatorUpdateKind::Reactivate => match entry.status {
                ValidatorStatus::Inactive => {
                    entry.status = ValidatorStatus::Active;
                    entry.last_active_height = height;
                    info!(validator = %entry.id, "validator reactivated");
                }
                ValidatorStatus::Jailed => {
                    if height < entry.jail_release_height {
                        return Err(StakingError::new(
                            StakingErrorKind::WrongStatus,
                            format!(
                                "jailed until height {}, current {height}",
                                entry.jail_release_height
                            ),
                        ));
                    }
                    entry.status = ValidatorStatus::Active;
                    entry.jail_release_height = 0;
                    entry.last_active_height = height;
                    info!(validator = %entry.id, "validator reactivated after jail");
                }
                other => {
                    return Err(StakingError::new(
                        StakingErrorKind::WrongStatus,
                        format!("cannot reactivate validator in {} status", other.as_str()),
                    ));
                }
            },
            ValidatorUpdateKind::IncreaseStake => {
                if update.new_value <= 0 {
                    return Err(StakingError::new(
                        StakingErrorKind::BadParameter,
                        "stake increase must be positive",
                    ));
                }
                entry.self_stake += update.new_value;
                info!(
                    validator = %entry.id,
                    delta = update.new_value,
                    stake = entry.self_stake,
                    "increased self-stake"
                );
            }
            ValidatorUpdateKind::DecreaseStake => {
                if update.new_value <= 0 {
                    return Err(StakingError::new(
                        StakingErrorKind::BadParameter,
                        "stake decrease must be positive",
                    ));
                }
                if update.new_value > entry.self_stake {
                    return Err(StakingError::new(
                        StakingErrorKind::InsufficientBalance,
                        "stake decrease exceeds held stake",
                    ));
                }
                if entry.self_stake - update.new_value < self.params.min_validator_stake {
                    return Err(StakingError::new(
                        StakingErrorKind::BelowMinimum,
                        "cannot reduce stake below minimum",
                    ));
                }
                entry.self_stake -= update.new_value;
                info!(
                    validator = %entry.id,
                    delta = update.new_value,
                    stake = entry.self_stake,
                    "decreased self-stake"
                );
            }
        }

        Ok(entry.clone())
    }

    /// Re-indexes the stake outpoint atomically.
    pub fn update_stake_outpoint(
        &self,
        id: &ValidatorId,
        new_outpoint: Option<OutPoint>,
    ) -> Result<(), StakingError> {
        let mut inner = self.lock()?;
        if let Some(outpoint) = new_outpoint {
            if let Some(owner) = inner.by_outpoint.get(&outpoint) {
                if owner != id {
                    return Err(StakingError::new(
                        StakingErrorKind::AlreadyExists,
                        "stake outpoint already indexed",
                    ));
                }
            }
        }
        let Some(entry) = inner.validators.get_mut(id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {id}"),
            ));
        };
        let old = entry.stake_outpoint;
        entry.stake_outpoint = new_outpoint;
        if let Some(old) = old {
            inner.by_outpoint.remove(&old);
        }
        if let Some(new_outpoint) = new_outpoint {
            inner.by_outpoint.insert(new_outpoint, *id);
        }
        Ok(())
    }

    pub fn get(&self, id: &ValidatorId) -> Option<ValidatorRecord> {
        let Ok(inner) = self.inner.lock() else {
            return None;
        };
        inner.validators.get(id).cloned()
    }

    pub fn get_by_outpoint(&self, outpoint: &OutPoint) -> Option<ValidatorRecord> {
        let Ok(inner) = self.inner.lock() else {
            return None;
        };
        let id = inner.by_outpoint.get(outpoint)?;
        inner.validators.get(id).cloned()
    }

    pub fn is_validator_stake(&self, outpoint: &OutPoint) -> bool {
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        inner.by_outpoint.contains_key(outpoint)
    }

    pub fn active_validators(&self) -> Vec<ValidatorRecord> {
        self.filtered(|entry| entry.status == ValidatorStatus::Active)
    }

    pub fn by_stake_desc(&self) -> Vec<ValidatorRecord> {
        let mut result = self.active_validators();
        result.sort_by(|a, b| b.total_stake().cmp(&a.total_stake()));
        result
    }

    pub fn by_max_fee(&self, max_fee_bps: i64) -> Vec<ValidatorRecord> {
        let mut result =
            self.filtered(|entry| entry.status == ValidatorStatus::Active && entry.fee_bps <= max_fee_bps);
        result.sort_by(|a, b| a.fee_bps.cmp(&b.fee_bps));
        result
    }

    pub fn all_validators(&self) -> Vec<ValidatorRecord> {
        self.filtered(|_| true)
    }

    fn filtered(&self, keep: impl Fn(&ValidatorRecord) -> bool) -> Vec<ValidatorRecord> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner.validators.values().filter(|entry| keep(entry)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.validators.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.active_validators().len()
    }

    pub fn height(&self) -> i32 {
        self.inner.lock().map(|inner| inner.height).unwrap_or(0)
    }

    pub fn set_status(&self, id: &ValidatorId, status: ValidatorStatus) -> Result<(), StakingError> {
        let mut inner = self.lock()?;
        let height = inner.height;
        let Some(entry) = inner.validators.get_mut(id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {id}"),
            ));
        };
        entry.status = status;
        if status == ValidatorStatus::Active {
            entry.last_active_height = height;
        }
        Ok(())
    }

    /// Jails a validator until `current_height + jail_blocks`.
    pub fn jail(&self, id: &ValidatorId, jail_blocks: i32) -> Result<(), StakingError> {
        let mut inner = self.lock()?;
        let height = inner.height;
        let Some(entry) = inner.validators.get_mut(id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {id}"),
            ));
        };
        entry.status = ValidatorStatus::Jailed;
        entry.jail_release_height = height + jail_blocks;
        warn!(
            validator = %entry.id,
            release_height = entry.jail_release_height,
            "jailed validator"
        );
        Ok(())
    }

    pub fn unjail(&self, id: &ValidatorId) -> Result<(), StakingError> {
        let mut inner = self.lock()?;
        let height = inner.height;
        let Some(entry) = inner.validators.get_mut(id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {id}"),
            ));
        };
        if entry.status != ValidatorStatus::Jailed {
            return Err(StakingError::new(
                StakingErrorKind::WrongStatus,
                "validator is not jailed",
            ));
        }
        if height < entry.jail_release_height {
            return Err(StakingError::new(
                StakingErrorKind::WrongStatus,
                format!(
                    "jailed until height {}, current {height}",
                    entry.jail_release_height
                ),
            ));
        }
        entry.status = ValidatorStatus::Active;
        entry.jail_release_height = 0;
        entry.last_active_height = height;
        info!(validator = %entry.id, "unjailed validator");
        Ok(())
    }

    /// Called by the delegation ledger when a delegation becomes Active.
    /// `new_delegator` marks the delegator's first active delegation to
    /// this validator.
    pub fn add_delegation(
        &self,
        id: &ValidatorId,
        amount: Amount,
        new_delegator: bool,
    ) -> Result<(), StakingError> {
        if amount <= 0 {
            return Err(StakingError::new(
                StakingErrorKind::BadParameter,
                "delegated amount must be positive",
            ));
        }
        let mut inner = self.lock()?;
        let Some(entry) = inner.validators.get_mut(id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {id}"),
            ));
        };
        entry.total_delegated += amount;
        if new_delegator {
            entry.delegator_count += 1;
        }
        debug!(
            validator = %entry.id,
            amount,
            total_delegated = entry.total_delegated,
            delegators = entry.delegator_count,
            "added delegation"
        );
        Ok(())
    }

    /// Called by the delegation ledger when an active delegation unbonds.
    /// `removed_delegator` marks the delegator's last active delegation to
    /// this validator going away.
    pub fn remove_delegation(
        &self,
        id: &ValidatorId,
        amount: Amount,
        removed_delegator: bool,
    ) -> Result<(), StakingError> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.validators.get_mut(id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {id}"),
            ));
        };
        if amount > entry.total_delegated {
            return Err(StakingError::new(
                StakingErrorKind::InsufficientBalance,
                "removal exceeds delegated total",
            ));
        }
        entry.total_delegated -= amount;
        if removed_delegator {
            entry.delegator_count = entry.delegator_count.saturating_sub(1);
        }
        debug!(
            validator = %entry.id,
            amount,
            total_delegated = entry.total_delegated,
            delegators = entry.delegator_count,
            "removed delegation"
        );
        Ok(())
    }

    /// Block tick: matures pending registrations, completes unbonding, and
    /// logs expired jail windows (release still requires an explicit
    /// reactivate). Returns the transitions that occurred.
    pub fn on_block(&self, height: i32) -> Vec<StatusChange> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner.height = height;

        let min_stake = self.params.min_validator_stake;
        let maturity = self.params.validator_maturity;
        let unbonding = self.params.unbonding_period;
        let mut changes = Vec::new();

        for entry in inner.validators.values_mut() {
            match entry.status {
                ValidatorStatus::Pending => {
                    if height - entry.registration_height >= maturity && entry.self_stake >= min_stake
                    {
                        entry.status = ValidatorStatus::Active;
                        entry.last_active_height = height;
                        info!(validator = %entry.id, height, "validator matured to active");
                        changes.push(StatusChange {
                            id: entry.id,
                            from: ValidatorStatus::Pending,
                            to: ValidatorStatus::Active,
                        });
                    }
                }
                ValidatorStatus::Unbonding => {
                    if height - entry.last_active_height >= unbonding {
                        entry.status = ValidatorStatus::Inactive;
                        info!(validator = %entry.id, height, "validator unbonding complete");
                        changes.push(StatusChange {
                            id: entry.id,
                            from: ValidatorStatus::Unbonding,
                            to: ValidatorStatus::Inactive,
                        });
                    }
                }
                ValidatorStatus::Jailed => {
                    if height >= entry.jail_release_height {
                        debug!(validator = %entry.id, "jail window expired, reactivate allowed");
                    }
                }
                ValidatorStatus::Active | ValidatorStatus::Inactive => {}
            }
        }
        changes
    }

    /// Serializes the record map. The outpoint index is never persisted.
    pub fn serialize(&self) -> Vec<u8> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut encoder = Encoder::new();
        encoder.write_varint(inner.validators.len() as u64);
        for record in inner.validators.values() {
            encoder.write_bytes(&record.encode());
        }
        encoder.into_inner()
    }

    /// Replaces the record map from serialized bytes and rebuilds the
    /// outpoint index with a single scan.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<(), StakingError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder
            .read_varint()
            .map_err(|err| StakingError::new(StakingErrorKind::BadParameter, err.to_string()))?;
        let mut validators = BTreeMap::new();
        let mut by_outpoint = BTreeMap::new();
        for _ in 0..count {
            let record = ValidatorRecord::decode_from(&mut decoder)
                .map_err(|err| StakingError::new(StakingErrorKind::BadParameter, err.to_string()))?;
            if let Some(outpoint) = record.stake_outpoint {
                by_outpoint.insert(outpoint, record.id);
            }
            validators.insert(record.id, record);
        }
        if !decoder.is_empty() {
            return Err(StakingError::new(
                StakingErrorKind::BadParameter,
                "trailing bytes in validator snapshot",
            ));
        }
        let mut inner = self.lock()?;
        inner.validators = validators;
        inner.by_outpoint = by_outpoint;
        Ok(())
    }
}
