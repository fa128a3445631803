//! Delegation ledger: signed delegate/undelegate/claim requests, reward
//! distribution, and reverse indices over delegation records.
//!
//! The ledger never mutates validator aggregates while holding its own
//! lock: deltas are captured inside the critical section and applied to
//! the registry after it is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use secp256k1::SecretKey;
use tracing::{debug, info, warn};
use voltd_consensus::{Amount, StakingParams};
use voltd_primitives::encoding::{DecodeError, Decoder, Encoder};
use voltd_primitives::hash::sha256d;
use voltd_primitives::sig::{sign_digest, verify_digest};
use voltd_primitives::{DelegatorId, Hash256, KeyId, OutPoint, ValidatorId};

use crate::error::{StakingError, StakingErrorKind};
use crate::registry::{
    read_optional_outpoint, write_optional_outpoint, ValidatorRegistry, ValidatorStatus,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DelegationStatus {
    Pending,
    Active,
    Unbonding,
    Withdrawn,
}

impl DelegationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DelegationStatus::Pending => "pending",
            DelegationStatus::Active => "active",
            DelegationStatus::Unbonding => "unbonding",
            DelegationStatus::Withdrawn => "withdrawn",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            DelegationStatus::Pending => 0,
            DelegationStatus::Active => 1,
            DelegationStatus::Unbonding => 2,
            DelegationStatus::Withdrawn => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(DelegationStatus::Pending),
            1 => Ok(DelegationStatus::Active),
            2 => Ok(DelegationStatus::Unbonding),
            3 => Ok(DelegationStatus::Withdrawn),
            _ => Err(DecodeError::InvalidValue("unknown delegation status")),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DelegationRecord {
    pub delegator: DelegatorId,
    pub validator: ValidatorId,
    pub amount: Amount,
    pub delegation_height: i32,
    pub last_reward_height: i32,
    pub unbonding_start_height: i32,
    pub status: DelegationStatus,
    pub outpoint: Option<OutPoint>,
    pub pending_rewards: Amount,
}

impl DelegationRecord {
    pub fn is_active(&self) -> bool {
        self.status == DelegationStatus::Active
    }

    /// H(delegator ‖ validator ‖ delegation_height).
    pub fn delegation_id(&self) -> Hash256 {
        delegation_id(&self.delegator, &self.validator, self.delegation_height)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.delegator.consensus_encode(&mut encoder);
        self.validator.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.amount);
        encoder.write_i32_le(self.delegation_height);
        encoder.write_i32_le(self.last_reward_height);
        encoder.write_i32_le(self.unbonding_start_height);
        encoder.write_u8(self.status.to_u8());
        write_optional_outpoint(&mut encoder, &self.outpoint);
        encoder.write_i64_le(self.pending_rewards);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let delegator = DelegatorId::consensus_decode(decoder)?;
        let validator = ValidatorId::consensus_decode(decoder)?;
        let amount = decoder.read_i64_le()?;
        let delegation_height = decoder.read_i32_le()?;
        let last_reward_height = decoder.read_i32_le()?;
        let unbonding_start_height = decoder.read_i32_le()?;
        let status = DelegationStatus::from_u8(decoder.read_u8()?)?;
        let outpoint = read_optional_outpoint(decoder)?;
        let pending_rewards = decoder.read_i64_le()?;
        Ok(Self {
            delegator,
            validator,
            amount,
            delegation_height,
            last_reward_height,
            unbonding_start_height,
            status,
            outpoint,
            pending_rewards,
        })
    }
}

pub fn delegation_id(delegator: &DelegatorId, validator: &ValidatorId, height: i32) -> Hash256 {
    let mut encoder = Encoder::new();
    delegator.consensus_encode(&mut encoder);
    validator.consensus_encode(&mut encoder);
    encoder.write_i32_le(height);
    sha256d(&encoder.into_inner())
}

/// Signed request to create a delegation.
#[derive(Clone, Debug)]
pub struct DelegationRequest {
    pub delegator: DelegatorId,
    pub delegator_pubkey: Vec<u8>,
    pub validator: ValidatorId,
    pub amount: Amount,
    pub height: i32,
    pub signature: Vec<u8>,
}

impl DelegationRequest {
    pub fn sighash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.delegator.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.delegator_pubkey);
        self.validator.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.amount);
        encoder.write_i32_le(self.height);
        sha256d(&encoder.into_inner())
    }

    pub fn sign(&mut self, secret: &SecretKey) {
        self.signature = sign_digest(secret, &self.sighash());
    }

    /// The embedded pubkey must both hash to the claimed delegator id and
    /// verify the signature.
    pub fn verify(&self) -> bool {
        KeyId::from_pubkey(&self.delegator_pubkey) == self.delegator
            && verify_digest(&self.delegator_pubkey, &self.sighash(), &self.signature)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.delegator.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.delegator_pubkey);
        self.validator.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.amount);
        encoder.write_i32_le(self.height);
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let delegator = DelegatorId::consensus_decode(&mut decoder)?;
        let delegator_pubkey = decoder.read_var_bytes()?;
        let validator = ValidatorId::consensus_decode(&mut decoder)?;
        let amount = decoder.read_i64_le()?;
        let height = decoder.read_i32_le()?;
        let signature = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            delegator,
            delegator_pubkey,
            validator,
            amount,
            height,
            signature,
        })
    }
}

/// Signed request to unbond delegated stake. `amount = 0` means all.
#[derive(Clone, Debug)]
pub struct UndelegationRequest {
    pub delegator: DelegatorId,
    pub delegator_pubkey: Vec<u8>,
    pub validator: ValidatorId,
    pub amount: Amount,
    pub height: i32,
    pub signature: Vec<u8>,
}

impl UndelegationRequest {
    pub fn sighash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.delegator.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.delegator_pubkey);
        self.validator.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.amount);
        encoder.write_i32_le(self.height);
        sha256d(&encoder.into_inner())
    }

    pub fn sign(&mut self, secret: &SecretKey) {
        self.signature = sign_digest(secret, &self.sighash());
    }

    pub fn verify(&self) -> bool {
        KeyId::from_pubkey(&self.delegator_pubkey) == self.delegator
            && verify_digest(&self.delegator_pubkey, &self.sighash(), &self.signature)
    }
}

/// Signed request to collect pending rewards, optionally scoped to one
/// validator.
#[derive(Clone, Debug)]
pub struct RewardClaimRequest {
    pub delegator: DelegatorId,
    pub delegator_pubkey: Vec<u8>,
    pub validator: Option<ValidatorId>,
    pub height: i32,
    pub signature: Vec<u8>,
}

impl RewardClaimRequest {
    pub fn sighash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.delegator.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.delegator_pubkey);
        match &self.validator {
            Some(validator) => {
                encoder.write_u8(1);
                validator.consensus_encode(&mut encoder);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_i32_le(self.height);
        sha256d(&encoder.into_inner())
    }

    pub fn sign(&mut self, secret: &SecretKey) {
        self.signature = sign_digest(secret, &self.sighash());
    }

    pub fn verify(&self) -> bool {
        KeyId::from_pubkey(&self.delegator_pubkey) == self.delegator
            && verify_digest(&self.delegator_pubkey, &self.sighash(), &self.signature)
    }
}

/// Result of an undelegation: the amount unbonded and how many records it
/// consumed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UndelegationOutcome {
    pub amount: Amount,
    pub records: usize,
}

#[derive(Default)]
struct LedgerInner {
    delegations: BTreeMap<Hash256, DelegationRecord>,
    by_delegator: BTreeMap<DelegatorId, Vec<Hash256>>,
    by_validator: BTreeMap<ValidatorId, Vec<Hash256>>,
    by_outpoint: BTreeMap<OutPoint, Hash256>,
    height: i32,
}

impl LedgerInner {
    fn index(&mut self, id: Hash256, record: &DelegationRecord) {
        self.by_delegator.entry(record.delegator).or_default().push(id);
        self.by_validator.entry(record.validator).or_default().push(id);
        if let Some(outpoint) = record.outpoint {
            self.by_outpoint.insert(outpoint, id);
        }
    }

    /// Whether the delegator holds an Active record to `validator` other
    /// than `skip`.
    fn has_other_active(
        &self,
        delegator: &DelegatorId,
        validator: &ValidatorId,
        skip: &Hash256,
    ) -> bool {
        let Some(ids) = self.by_delegator.get(delegator) else {
            return false;
        };
        ids.iter().any(|id| {
            id != skip
                && self
                    .delegations
                    .get(id)
                    .is_some_and(|record| record.is_active() && record.validator == *validator)
        })
    }
}

/// Aggregate change to forward to the registry once the ledger lock is
/// released.
struct AggregateDelta {
    validator: ValidatorId,
    amount: Amount,
    delegator_edge: bool,
    added: bool,
}

pub struct DelegationLedger {
    params: StakingParams,
    registry: Arc<ValidatorRegistry>,
    inner: Mutex<LedgerInner>,
}

impl DelegationLedger {
    pub fn new(params: StakingParams, registry: Arc<ValidatorRegistry>) -> Self {
        Self {
            params,
            registry,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn params(&self) -> &StakingParams {
        &self.params
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerInner>, StakingError> {
        self.inner.lock().map_err(|_| {
            StakingError::new(StakingErrorKind::Internal, "delegation ledger lock poisoned")
        })
    }

    fn apply_deltas(&self, deltas: Vec<AggregateDelta>) {
        for delta in deltas {
            let result = if delta.added {
                self.registry
                    .add_delegation(&delta.validator, delta.amount, delta.delegator_edge)
            } else {
                self.registry
                    .remove_delegation(&delta.validator, delta.amount, delta.delegator_edge)
            };
            if let Err(err) = result {
                warn!(
                    validator = %delta.validator,
                    amount = delta.amount,
                    error = %err,
                    "failed to sync delegation aggregate"
                );
            }
        }
    }

    /// Creates a new Pending delegation. Aggregates move when the record
    /// matures to Active.
    pub fn process_delegation(
        &self,
        request: &DelegationRequest,
        outpoint: Option<OutPoint>,
    ) -> Result<Hash256, StakingError> {
        if !request.verify() {
            return Err(StakingError::new(
                StakingErrorKind::BadSignature,
                "invalid delegation request signature",
            ));
        }
        if request.amount < self.params.min_delegation {
            return Err(StakingError::new(
                StakingErrorKind::BelowMinimum,
                format!(
                    "delegation {} below minimum {}",
                    request.amount, self.params.min_delegation
                ),
            ));
        }

        // Cross-component check, outside our own lock.
        let validator = self.registry.get(&request.validator).ok_or_else(|| {
            StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {}", request.validator),
            )
        })?;
        if !matches!(
            validator.status,
            ValidatorStatus::Active | ValidatorStatus::Pending
        ) {
            return Err(StakingError::new(
                StakingErrorKind::WrongStatus,
                format!(
                    "cannot delegate to {} validator",
                    validator.status.as_str()
                ),
            ));
        }

        let id = delegation_id(&request.delegator, &request.validator, request.height);
        let mut inner = self.lock()?;
        if inner.delegations.contains_key(&id) {
            return Err(StakingError::new(
                StakingErrorKind::AlreadyExists,
                "duplicate delegation",
            ));
        }
        if let Some(outpoint) = outpoint {
            if inner.by_outpoint.contains_key(&outpoint) {
                return Err(StakingError::new(
                    StakingErrorKind::AlreadyExists,
                    "delegation outpoint already indexed",
                ));
            }
        }

        let record = DelegationRecord {
            delegator: request.delegator,
            validator: request.validator,
            amount: request.amount,
            delegation_height: request.height,
            last_reward_height: request.height,
            unbonding_start_height: 0,
            status: DelegationStatus::Pending,
            outpoint,
            pending_rewards: 0,
        };
        inner.index(id, &record);
        inner.delegations.insert(id, record);
        info!(
            delegator = %request.delegator,
            validator = %request.validator,
            amount = request.amount,
            "created delegation"
        );
        Ok(id)
    }

    /// Unbonds whole records in enumeration order until the requested
    /// amount is covered (`amount = 0` unbonds everything). Partial splits
    /// of a single record are not supported.
    pub fn process_undelegation(
        &self,
        request: &UndelegationRequest,
    ) -> Result<UndelegationOutcome, StakingError> {
        if !request.verify() {
            return Err(StakingError::new(
                StakingErrorKind::BadSignature,
                "invalid undelegation request signature",
            ));
        }
        if request.amount < 0 {
            return Err(StakingError::new(
                StakingErrorKind::BadParameter,
                "undelegation amount cannot be negative",
            ));
        }

        let mut deltas = Vec::new();
        let outcome;
        {
            let mut inner = self.lock()?;
            let height = inner.height;
            let ids = inner
                .by_delegator
                .get(&request.delegator)
                .cloned()
                .unwrap_or_default();

            let mut consumed = 0;
            let mut records = 0;
            let mut remaining = request.amount;
            let mut last_consumed = None;
            for id in ids {
                if request.amount != 0 && remaining <= 0 {
                    break;
                }
                let Some(record) = inner.delegations.get_mut(&id) else {
                    continue;
                };
                if record.validator != request.validator || !record.is_active() {
                    continue;
                }
                record.status = DelegationStatus::Unbonding;
                record.unbonding_start_height = height;
                consumed += record.amount;
                remaining -= record.amount;
                records += 1;
                last_consumed = Some(id);
                debug!(
                    delegation = %voltd_primitives::hash::hash256_to_hex(&id),
                    amount = record.amount,
                    "delegation unbonding started"
                );
            }

            if records == 0 {
                return Err(StakingError::new(
                    StakingErrorKind::NotFound,
                    "no active delegations to unbond",
                ));
            }

            let departed = match last_consumed {
                Some(last) => {
                    !inner.has_other_active(&request.delegator, &request.validator, &last)
                }
                None => false,
            };
            deltas.push(AggregateDelta {
                validator: request.validator,
                amount: consumed,
                delegator_edge: departed,
                added: false,
            });
            outcome = UndelegationOutcome {
                amount: consumed,
                records,
            };
        }
        self.apply_deltas(deltas);
        info!(
            delegator = %request.delegator,
            validator = %request.validator,
            amount = outcome.amount,
            records = outcome.records,
            "processed undelegation"
        );
        Ok(outcome)
    }

    /// Sums and zeroes pending rewards on the delegator's Active records,
    /// optionally filtered to one validator. Returns the total claimed and
    /// the number of records it came from.
    pub fn process_reward_claim(
        &self,
        request: &RewardClaimRequest,
    ) -> Result<(Amount, usize), StakingError> {
        if !request.verify() {
            return Err(StakingError::new(
                StakingErrorKind::BadSignature,
                "invalid reward claim signature",
            ));
        }

        let mut inner = self.lock()?;
        let height = inner.height;
        let ids = inner
            .by_delegator
            .get(&request.delegator)
            .cloned()
            .unwrap_or_default();

        let mut total = 0;
        let mut records = 0;
        for id in ids {
            let Some(record) = inner.delegations.get_mut(&id) else {
                continue;
            };
            if !record.is_active() {
                continue;
            }
            if let Some(filter) = &request.validator {
                if record.validator != *filter {
                    continue;
                }
            }
            if record.pending_rewards > 0 {
                total += record.pending_rewards;
                record.pending_rewards = 0;
                records += 1;
            }
            record.last_reward_height = height;
        }
        if total > 0 {
            info!(delegator = %request.delegator, amount = total, "claimed rewards");
        }
        Ok((total, records))
    }

    /// Credits each Active delegation its floor-proportional slice of
    /// `delegators_share`. The rounding residue (at most one unit per
    /// record) is dropped. Returns the amount actually credited.
    pub fn distribute_block_reward(
        &self,
        validator: &ValidatorId,
        delegators_share: Amount,
    ) -> Result<Amount, StakingError> {
        if delegators_share <= 0 {
            return Ok(0);
        }
        let mut inner = self.lock()?;
        let ids = inner.by_validator.get(validator).cloned().unwrap_or_default();

        let mut total_active = 0;
        for id in &ids {
            if let Some(record) = inner.delegations.get(id) {
                if record.is_active() {
                    total_active += record.amount;
                }
            }
        }
        if total_active == 0 {
            return Ok(0);
        }

        let mut distributed = 0;
        for id in &ids {
            let Some(record) = inner.delegations.get_mut(id) else {
                continue;
            };
            if !record.is_active() {
                continue;
            }
            let share = (i128::from(delegators_share) * i128::from(record.amount)
                / i128::from(total_active)) as Amount;
            if share > 0 {
                record.pending_rewards += share;
                distributed += share;
            }
        }
        debug!(
            validator = %validator,
            share = delegators_share,
            distributed,
            "distributed block reward to delegators"
        );
        Ok(distributed)
    }

    /// Block tick: matures Pending records (moving their amounts into the
    /// registry aggregates) and completes unbonding.
    pub fn on_block(&self, height: i32) {
        let mut deltas = Vec::new();
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.height = height;

            let maturity = self.params.delegation_maturity;
            let unbonding = self.params.unbonding_period;
            let ids: Vec<Hash256> = inner.delegations.keys().copied().collect();
            for id in ids {
                let Some(record) = inner.delegations.get(&id) else {
                    continue;
                };
                match record.status {
                    DelegationStatus::Pending
                        if height - record.delegation_height >= maturity =>
                    {
                        let delegator = record.delegator;
                        let validator = record.validator;
                        let amount = record.amount;
                        let first = !inner.has_other_active(&delegator, &validator, &id);
                        if let Some(record) = inner.delegations.get_mut(&id) {
                            record.status = DelegationStatus::Active;
                        }
                        deltas.push(AggregateDelta {
                            validator,
                            amount,
                            delegator_edge: first,
                            added: true,
                        });
                        debug!(
                            delegation = %voltd_primitives::hash::hash256_to_hex(&id),
                            "delegation matured to active"
                        );
                    }
                    DelegationStatus::Unbonding
                        if height - record.unbonding_start_height >= unbonding =>
                    {
                        if let Some(record) = inner.delegations.get_mut(&id) {
                            record.status = DelegationStatus::Withdrawn;
                        }
                        debug!(
                            delegation = %voltd_primitives::hash::hash256_to_hex(&id),
                            "delegation unbonding complete"
                        );
                    }
                    _ => {}
                }
            }
        }
        self.apply_deltas(deltas);
    }

    pub fn get(&self, id: &Hash256) -> Option<DelegationRecord> {
        let Ok(inner) = self.inner.lock() else {
            return None;
        };
        inner.delegations.get(id).cloned()
    }

    pub fn get_by_outpoint(&self, outpoint: &OutPoint) -> Option<DelegationRecord> {
        let Ok(inner) = self.inner.lock() else {
            return None;
        };
        let id = inner.by_outpoint.get(outpoint)?;
        inner.delegations.get(id).cloned()
    }

    pub fn is_delegation(&self, outpoint: &OutPoint) -> bool {
        let Ok(inner) = self.inner.lock() else {
            return false;
        };
        inner.by_outpoint.contains_key(outpoint)
    }

    pub fn update_outpoint(
        &self,
        id: &Hash256,
        new_outpoint: Option<OutPoint>,
    ) -> Result<(), StakingError> {
        let mut inner = self.lock()?;
        if let Some(outpoint) = new_outpoint {
            if let Some(owner) = inner.by_outpoint.get(&outpoint) {
                if owner != id {
                    return Err(StakingError::new(
                        StakingErrorKind::AlreadyExists,
                        "delegation outpoint already indexed",
                    ));
                }
            }
        }
        let Some(record) = inner.delegations.get_mut(id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                "unknown delegation",
            ));
        };
        let old = record.outpoint;
        record.outpoint = new_outpoint;
        if let Some(old) = old {
            inner.by_outpoint.remove(&old);
        }
        if let Some(new_outpoint) = new_outpoint {
            inner.by_outpoint.insert(new_outpoint, *id);
        }
        Ok(())
    }

    pub fn for_delegator(&self, delegator: &DelegatorId) -> Vec<(Hash256, DelegationRecord)> {
        self.indexed(&|inner: &LedgerInner| {
            inner.by_delegator.get(delegator).cloned().unwrap_or_default()
        })
    }

    pub fn for_validator(&self, validator: &ValidatorId) -> Vec<(Hash256, DelegationRecord)> {
        self.indexed(&|inner: &LedgerInner| {
            inner.by_validator.get(validator).cloned().unwrap_or_default()
        })
    }

    fn indexed(
        &self,
        ids_for: &dyn Fn(&LedgerInner) -> Vec<Hash256>,
    ) -> Vec<(Hash256, DelegationRecord)> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        ids_for(&inner)
            .into_iter()
            .filter_map(|id| inner.delegations.get(&id).cloned().map(|record| (id, record)))
            .collect()
    }

    /// Sum of Active delegation amounts for a validator.
    pub fn total_for_validator(&self, validator: &ValidatorId) -> Amount {
        self.for_validator(validator)
            .iter()
            .filter(|(_, record)| record.is_active())
            .map(|(_, record)| record.amount)
            .sum()
    }

    pub fn pending_for_delegator(&self, delegator: &DelegatorId) -> Amount {
        self.for_delegator(delegator)
            .iter()
            .map(|(_, record)| record.pending_rewards)
            .sum()
    }

    pub fn active_count(&self) -> usize {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        inner
            .delegations
            .values()
            .filter(|record| record.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.delegations.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct delegators with at least one Active delegation to
    /// the validator.
    pub fn unique_delegator_count(&self, validator: &ValidatorId) -> usize {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        let Some(ids) = inner.by_validator.get(validator) else {
            return 0;
        };
        let mut delegators: Vec<DelegatorId> = ids
            .iter()
            .filter_map(|id| inner.delegations.get(id))
            .filter(|record| record.is_active())
            .map(|record| record.delegator)
            .collect();
        delegators.sort();
        delegators.dedup();
        delegators.len()
    }

    /// Serializes the record map. Reverse indices are never persisted.
    pub fn serialize(&self) -> Vec<u8> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut encoder = Encoder::new();
        encoder.write_varint(inner.delegations.len() as u64);
        for record in inner.delegations.values() {
            encoder.write_bytes(&record.encode());
        }
        encoder.into_inner()
    }

    /// Replaces the record map from serialized bytes; all reverse indices
    /// are rebuilt from scratch by a single scan, never trusted from the
    /// stream.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<(), StakingError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder
            .read_varint()
            .map_err(|err| StakingError::new(StakingErrorKind::BadParameter, err.to_string()))?;
        let mut rebuilt = LedgerInner::default();
        for _ in 0..count {
            let record = DelegationRecord::decode_from(&mut decoder)
                .map_err(|err| StakingError::new(StakingErrorKind::BadParameter, err.to_string()))?;
            let id = record.delegation_id();
            rebuilt.index(id, &record);
            rebuilt.delegations.insert(id, record);
        }
        if !decoder.is_empty() {
            return Err(StakingError::new(
                StakingErrorKind::BadParameter,
                "trailing bytes in delegation snapshot",
            ));
        }
        let mut inner = self.lock()?;
        rebuilt.height = inner.height;
        *inner = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secp256k1::SecretKey;
    use voltd_consensus::params::{chain_params, Network, StakingParams};
    use voltd_primitives::sig::pubkey_bytes;
    use voltd_primitives::{KeyId, OutPoint};

    use super::{
        DelegationLedger, DelegationRequest, DelegationStatus, RewardClaimRequest,
        UndelegationRequest,
    };
    use crate::error::StakingErrorKind;
    use crate::registry::{ValidatorRecord, ValidatorRegistry, ValidatorStatus};

    fn test_key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).expect("secret key")
    }

    fn key_id(secret: &SecretKey) -> KeyId {
        KeyId::from_pubkey(&pubkey_bytes(secret))
    }

    /// Small parameters so maturities are easy to cross, with permissive
    /// minimums matching the S1 scenario scale.
    fn scenario_params() -> StakingParams {
        let mut params = chain_params(Network::Regtest).staking;
        params.min_validator_stake = 100;
        params.min_delegation = 10;
        params
    }

    struct Harness {
        registry: Arc<ValidatorRegistry>,
        ledger: DelegationLedger,
        validator_key: SecretKey,
        validator: KeyId,
    }

    fn setup() -> Harness {
        let params = scenario_params();
        let registry = Arc::new(ValidatorRegistry::new(params.clone()));
        let validator_key = test_key(1);
        let pubkey = pubkey_bytes(&validator_key);
        let validator = KeyId::from_pubkey(&pubkey);
        registry
            .register(ValidatorRecord::new(
                validator,
                pubkey,
                200,
                1_000,
                String::from("pool"),
                0,
            ))
            .expect("register");
        // Past validator maturity.
        registry.on_block(params.validator_maturity);
        let ledger = DelegationLedger::new(params.clone(), Arc::clone(&registry));
        ledger.on_block(params.validator_maturity);
        Harness {
            registry,
            ledger,
            validator_key,
            validator,
        }
    }

    fn delegate(harness: &Harness, secret: &SecretKey, amount: i64, height: i32) -> [u8; 32] {
        let mut request = DelegationRequest {
            delegator: key_id(secret),
            delegator_pubkey: pubkey_bytes(secret),
            validator: harness.validator,
            amount,
            height,
            signature: Vec::new(),
        };
        request.sign(secret);
        harness
            .ledger
            .process_delegation(&request, None)
            .expect("delegation accepted")
    }

    fn mature_delegations(harness: &Harness, from_height: i32) -> i32 {
        let height = from_height + harness.ledger.params().delegation_maturity;
        harness.registry.on_block(height);
        harness.ledger.on_block(height);
        height
    }

    fn undelegate(harness: &Harness, secret: &SecretKey, amount: i64, height: i32) -> super::UndelegationOutcome {
        let mut request = UndelegationRequest {
            delegator: key_id(secret),
            delegator_pubkey: pubkey_bytes(secret),
            validator: harness.validator,
            amount,
            height,
            signature: Vec::new(),
        };
        request.sign(secret);
        harness.ledger.process_undelegation(&request).expect("undelegation")
    }

    fn claim(harness: &Harness, secret: &SecretKey) -> (i64, usize) {
        let mut request = RewardClaimRequest {
            delegator: key_id(secret),
            delegator_pubkey: pubkey_bytes(secret),
            validator: Some(harness.validator),
            height: 0,
            signature: Vec::new(),
        };
        request.sign(secret);
        harness.ledger.process_reward_claim(&request).expect("claim")
    }

    #[test]
    fn delegation_request_validation() {
        let harness = setup();
        let delegator = test_key(2);
        let height = harness.registry.height();

        // Below minimum.
        let mut request = DelegationRequest {
            delegator: key_id(&delegator),
            delegator_pubkey: pubkey_bytes(&delegator),
            validator: harness.validator,
            amount: 9,
            height,
            signature: Vec::new(),
        };
        request.sign(&delegator);
        assert_eq!(
            harness.ledger.process_delegation(&request, None).unwrap_err().kind,
            StakingErrorKind::BelowMinimum
        );

        // Exactly minimum is accepted.
        request.amount = 10;
        request.sign(&delegator);
        harness.ledger.process_delegation(&request, None).expect("at minimum");

        // Same (delegator, validator, height) is a duplicate.
        assert_eq!(
            harness.ledger.process_delegation(&request, None).unwrap_err().kind,
            StakingErrorKind::AlreadyExists
        );

        // Tampered signature.
        let mut request = DelegationRequest {
            delegator: key_id(&delegator),
            delegator_pubkey: pubkey_bytes(&delegator),
            validator: harness.validator,
            amount: 50,
            height: height + 1,
            signature: Vec::new(),
        };
        request.sign(&delegator);
        request.amount = 500;
        assert_eq!(
            harness.ledger.process_delegation(&request, None).unwrap_err().kind,
            StakingErrorKind::BadSignature
        );

        // Unknown validator.
        let mut request = DelegationRequest {
            delegator: key_id(&delegator),
            delegator_pubkey: pubkey_bytes(&delegator),
            validator: KeyId([0xee; 20]),
            amount: 50,
            height: height + 1,
            signature: Vec::new(),
        };
        request.sign(&delegator);
        assert_eq!(
            harness.ledger.process_delegation(&request, None).unwrap_err().kind,
            StakingErrorKind::NotFound
        );
    }

    #[test]
    fn delegating_to_unbonding_validator_rejected() {
        let harness = setup();
        harness
            .registry
            .set_status(&harness.validator, ValidatorStatus::Unbonding)
            .expect("set status");
        let delegator = test_key(2);
        let mut request = DelegationRequest {
            delegator: key_id(&delegator),
            delegator_pubkey: pubkey_bytes(&delegator),
            validator: harness.validator,
            amount: 50,
            height: harness.registry.height(),
            signature: Vec::new(),
        };
        request.sign(&delegator);
        assert_eq!(
            harness.ledger.process_delegation(&request, None).unwrap_err().kind,
            StakingErrorKind::WrongStatus
        );
    }

    #[test]
    fn reward_split_scenario() {
        // S1: R=600, fee 10%, self 200, delegations 100 + 300.
        let harness = setup();
        let d1 = test_key(2);
        let d2 = test_key(3);
        let height = harness.registry.height();
        delegate(&harness, &d1, 100, height);
        delegate(&harness, &d2, 300, height);
        let height = mature_delegations(&harness, height);

        let validator = harness.registry.get(&harness.validator).expect("validator");
        assert_eq!(validator.total_delegated, 400);
        assert_eq!(validator.delegator_count, 2);

        let delegators_share = validator.delegators_reward(600);
        assert_eq!(delegators_share, 360);
        assert_eq!(validator.validator_reward(600), 240);

        let distributed = harness
            .ledger
            .distribute_block_reward(&harness.validator, delegators_share)
            .expect("distribute");
        assert_eq!(distributed, 360);
        assert_eq!(harness.ledger.pending_for_delegator(&key_id(&d1)), 90);
        assert_eq!(harness.ledger.pending_for_delegator(&key_id(&d2)), 270);

        // S2: undelegate-all for D1.
        let outcome = undelegate(&harness, &d1, 0, height);
        assert_eq!(outcome.amount, 100);
        assert_eq!(outcome.records, 1);
        let validator = harness.registry.get(&harness.validator).expect("validator");
        assert_eq!(validator.total_delegated, 300);
        assert_eq!(validator.delegator_count, 1);

        let unbonding = harness.ledger.params().unbonding_period;
        harness.ledger.on_block(height + unbonding);
        let withdrawn = harness
            .ledger
            .for_delegator(&key_id(&d1))
            .into_iter()
            .map(|(_, record)| record.status)
            .collect::<Vec<_>>();
        assert_eq!(withdrawn, vec![DelegationStatus::Withdrawn]);
    }

    #[test]
    fn claim_twice_returns_zero_second_time() {
        let harness = setup();
        let d1 = test_key(2);
        let height = harness.registry.height();
        delegate(&harness, &d1, 100, height);
        mature_delegations(&harness, height);
        harness
            .ledger
            .distribute_block_reward(&harness.validator, 90)
            .expect("distribute");

        assert_eq!(claim(&harness, &d1), (90, 1));
        assert_eq!(claim(&harness, &d1), (0, 0));
    }

    #[test]
    fn distribution_residue_is_bounded() {
        let harness = setup();
        let keys: Vec<SecretKey> = (2u8..5).map(test_key).collect();
        let height = harness.registry.height();
        for (i, key) in keys.iter().enumerate() {
            delegate(&harness, key, 30 + i as i64 * 7, height);
        }
        mature_delegations(&harness, height);

        let share = 1_000;
        let distributed = harness
            .ledger
            .distribute_block_reward(&harness.validator, share)
            .expect("distribute");
        assert!(distributed <= share);
        assert!(share - distributed <= keys.len() as i64 - 1);

        let total_pending: i64 = keys
            .iter()
            .map(|key| harness.ledger.pending_for_delegator(&key_id(key)))
            .sum();
        assert_eq!(total_pending, distributed);
    }

    #[test]
    fn undelegate_consumes_whole_records_in_order() {
        let harness = setup();
        let d1 = test_key(2);
        let height = harness.registry.height();
        delegate(&harness, &d1, 40, height);
        delegate(&harness, &d1, 60, height + 1);
        harness.registry.on_block(height + 1);
        harness.ledger.on_block(height + 1);
        let height = mature_delegations(&harness, height + 1);

        // Requesting 50 consumes the first record entirely, then the second
        // (whole-record semantics; no splitting).
        let outcome = undelegate(&harness, &d1, 50, height);
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.amount, 100);
        let validator = harness.registry.get(&harness.validator).expect("validator");
        assert_eq!(validator.total_delegated, 0);
        assert_eq!(validator.delegator_count, 0);
    }

    #[test]
    fn undelegate_without_active_records_is_not_found() {
        let harness = setup();
        let d1 = test_key(2);
        let outcome = {
            let mut request = UndelegationRequest {
                delegator: key_id(&d1),
                delegator_pubkey: pubkey_bytes(&d1),
                validator: harness.validator,
                amount: 0,
                height: 0,
                signature: Vec::new(),
            };
            request.sign(&d1);
            harness.ledger.process_undelegation(&request)
        };
        assert_eq!(outcome.unwrap_err().kind, StakingErrorKind::NotFound);
    }

    #[test]
    fn outpoint_index_is_exclusive() {
        let harness = setup();
        let d1 = test_key(2);
        let d2 = test_key(3);
        let outpoint = OutPoint::new([0x55; 32], 3);
        let height = harness.registry.height();

        let mut request = DelegationRequest {
            delegator: key_id(&d1),
            delegator_pubkey: pubkey_bytes(&d1),
            validator: harness.validator,
            amount: 50,
            height,
            signature: Vec::new(),
        };
        request.sign(&d1);
        let id = harness
            .ledger
            .process_delegation(&request, Some(outpoint))
            .expect("delegation");
        assert!(harness.ledger.is_delegation(&outpoint));
        assert_eq!(
            harness.ledger.get_by_outpoint(&outpoint).expect("lookup").delegator,
            key_id(&d1)
        );

        let mut request = DelegationRequest {
            delegator: key_id(&d2),
            delegator_pubkey: pubkey_bytes(&d2),
            validator: harness.validator,
            amount: 50,
            height,
            signature: Vec::new(),
        };
        request.sign(&d2);
        assert_eq!(
            harness
                .ledger
                .process_delegation(&request, Some(outpoint))
                .unwrap_err()
                .kind,
            StakingErrorKind::AlreadyExists
        );

        let moved = OutPoint::new([0x66; 32], 0);
        harness.ledger.update_outpoint(&id, Some(moved)).expect("re-index");
        assert!(!harness.ledger.is_delegation(&outpoint));
        assert!(harness.ledger.is_delegation(&moved));
    }

    #[test]
    fn snapshot_roundtrip_rebuilds_indices() {
        let harness = setup();
        let d1 = test_key(2);
        let d2 = test_key(3);
        let height = harness.registry.height();
        delegate(&harness, &d1, 40, height);
        delegate(&harness, &d2, 60, height);
        mature_delegations(&harness, height);
        harness
            .ledger
            .distribute_block_reward(&harness.validator, 100)
            .expect("distribute");

        let snapshot = harness.ledger.serialize();
        let restored = DelegationLedger::new(
            harness.ledger.params().clone(),
            Arc::clone(&harness.registry),
        );
        restored.deserialize(&snapshot).expect("deserialize");

        assert_eq!(restored.len(), harness.ledger.len());
        assert_eq!(
            restored.total_for_validator(&harness.validator),
            harness.ledger.total_for_validator(&harness.validator)
        );
        assert_eq!(
            restored.pending_for_delegator(&key_id(&d1)),
            harness.ledger.pending_for_delegator(&key_id(&d1))
        );
        assert_eq!(
            restored.unique_delegator_count(&harness.validator),
            harness.ledger.unique_delegator_count(&harness.validator)
        );
        for (id, record) in harness.ledger.for_delegator(&key_id(&d2)) {
            assert_eq!(restored.get(&id), Some(record));
        }
    }
}
