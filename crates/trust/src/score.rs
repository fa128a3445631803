//! Trust scoring: per-validator heartbeat accounting over a rolling window
//! and the tier derivation that shapes block rewards.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tracing::{debug, warn};
use voltd_consensus::{Amount, StakingParams};
use voltd_primitives::ValidatorId;
use voltd_validators::{StakingError, StakingErrorKind};

use crate::heartbeat::Heartbeat;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum TrustTier {
    None,
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl TrustTier {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustTier::None => "none",
            TrustTier::Bronze => "bronze",
            TrustTier::Silver => "silver",
            TrustTier::Gold => "gold",
            TrustTier::Platinum => "platinum",
        }
    }

    pub fn threshold(self, params: &StakingParams) -> i32 {
        match self {
            TrustTier::None => 0,
            TrustTier::Bronze => params.bronze_uptime,
            TrustTier::Silver => params.silver_uptime,
            TrustTier::Gold => params.gold_uptime,
            TrustTier::Platinum => params.platinum_uptime,
        }
    }

    /// Reward multiplier in percent; 100 = 1.0x. `None` earns nothing.
    pub fn reward_multiplier(self, params: &StakingParams) -> i32 {
        match self {
            TrustTier::None => 0,
            TrustTier::Bronze => params.bronze_multiplier,
            TrustTier::Silver => params.silver_multiplier,
            TrustTier::Gold => params.gold_multiplier,
            TrustTier::Platinum => params.platinum_multiplier,
        }
    }
}

/// Liveness bookkeeping for one validator.
#[derive(Clone, Debug)]
pub struct UptimeRecord {
    pub validator_id: ValidatorId,
    pub stake: Amount,
    pub registration_height: i32,
    pub last_heartbeat_height: i32,
    pub heartbeats_expected: i32,
    pub heartbeats_received: i32,
    pub is_active: bool,
    pub last_known_address: Option<SocketAddr>,
    pub last_check_in_time: i64,
    pub consecutive_check_ins: i32,
    pub missed_check_ins: i32,
}

impl UptimeRecord {
    fn new(validator_id: ValidatorId, stake: Amount, height: i32) -> Self {
        Self {
            validator_id,
            stake,
            registration_height: height,
            last_heartbeat_height: height,
            heartbeats_expected: 0,
            heartbeats_received: 0,
            is_active: true,
            last_known_address: None,
            last_check_in_time: 0,
            consecutive_check_ins: 0,
            missed_check_ins: 0,
        }
    }

    /// Uptime in per-mille. A validator with no expected heartbeats yet
    /// counts as fully up until the first window elapses.
    pub fn uptime_per_mille(&self) -> i32 {
        if self.heartbeats_expected == 0 {
            return 1_000;
        }
        self.heartbeats_received * 1_000 / self.heartbeats_expected
    }

    /// Pure derivation from the current counters; tiers are never stored.
    pub fn trust_tier(&self, params: &StakingParams) -> TrustTier {
        if !self.is_active || self.stake < params.min_validator_stake {
            return TrustTier::None;
        }
        let uptime = self.uptime_per_mille();
        if uptime >= params.platinum_uptime {
            TrustTier::Platinum
        } else if uptime >= params.gold_uptime {
            TrustTier::Gold
        } else if uptime >= params.silver_uptime {
            TrustTier::Silver
        } else if uptime >= params.bronze_uptime {
            TrustTier::Bronze
        } else {
            TrustTier::None
        }
    }

    pub fn reward_multiplier(&self, params: &StakingParams) -> i32 {
        self.trust_tier(params).reward_multiplier(params)
    }
}

/// Outcome of feeding one heartbeat into the scorer. A heartbeat arriving
/// before the interval has elapsed is a benign no-op, not an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatStatus {
    Recorded,
    TooEarly,
}

pub struct TrustScorer {
    params: StakingParams,
    inner: Mutex<BTreeMap<ValidatorId, UptimeRecord>>,
}

impl TrustScorer {
    pub fn new(params: StakingParams) -> Self {
        Self {
            params,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn params(&self) -> &StakingParams {
        &self.params
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<ValidatorId, UptimeRecord>>, StakingError> {
        self.inner
            .lock()
            .map_err(|_| StakingError::new(StakingErrorKind::Internal, "trust scorer lock poisoned"))
    }

    pub fn register(
        &self,
        validator_id: ValidatorId,
        stake: Amount,
        height: i32,
    ) -> Result<(), StakingError> {
        let mut validators = self.lock()?;
        if validators.contains_key(&validator_id) {
            return Err(StakingError::new(
                StakingErrorKind::AlreadyExists,
                format!("validator {validator_id} already tracked"),
            ));
        }
        validators.insert(validator_id, UptimeRecord::new(validator_id, stake, height));
        debug!(validator = %validator_id, stake, height, "tracking validator uptime");
        Ok(())
    }

    pub fn update_stake(&self, validator_id: &ValidatorId, stake: Amount) -> Result<(), StakingError> {
        let mut validators = self.lock()?;
        let Some(record) = validators.get_mut(validator_id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("validator {validator_id} not tracked"),
            ));
        };
        record.stake = stake;
        Ok(())
    }

    pub fn set_active(&self, validator_id: &ValidatorId, active: bool) -> Result<(), StakingError> {
        let mut validators = self.lock()?;
        let Some(record) = validators.get_mut(validator_id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                format!("validator {validator_id} not tracked"),
            ));
        };
        record.is_active = active;
        Ok(())
    }

    /// Recomputes expected heartbeat counts for all active validators at a
    /// new height, bounded by the rolling uptime window.
    pub fn update_expectations(&self, height: i32) {
        let Ok(mut validators) = self.inner.lock() else {
            return;
        };
        for record in validators.values_mut() {
            if !record.is_active {
                continue;
            }
            let blocks_since_registration = height - record.registration_height;
            if blocks_since_registration <= 0 {
                continue;
            }
            let window = blocks_since_registration.min(self.params.uptime_window);
            record.heartbeats_expected = window / self.params.heartbeat_interval;
        }
    }

    /// Records a heartbeat. Signature verification and replay dedup are the
    /// heartbeat manager's job; this only enforces interval pacing.
    pub fn process_heartbeat(
        &self,
        heartbeat: &Heartbeat,
        height: i32,
    ) -> Result<HeartbeatStatus, StakingError> {
        let mut validators = self.lock()?;
        let Some(record) = validators.get_mut(&heartbeat.validator_id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                "heartbeat from unknown validator",
            ));
        };
        if !record.is_active {
            return Err(StakingError::new(
                StakingErrorKind::WrongStatus,
                "heartbeat from inactive validator",
            ));
        }
        if height < record.last_heartbeat_height + self.params.heartbeat_interval {
            return Ok(HeartbeatStatus::TooEarly);
        }
        record.heartbeats_received += 1;
        record.last_heartbeat_height = height;
        debug!(validator = %heartbeat.validator_id, height, "recorded heartbeat");
        Ok(HeartbeatStatus::Recorded)
    }

    /// Charges a missed check-in to every active validator that is more
    /// than two intervals behind.
    pub fn record_missed_check_ins(&self, height: i32) {
        let Ok(mut validators) = self.inner.lock() else {
            return;
        };
        for record in validators.values_mut() {
            if !record.is_active {
                continue;
            }
            if height - record.last_heartbeat_height > 2 * self.params.heartbeat_interval {
                record.missed_check_ins += 1;
                record.consecutive_check_ins = 0;
                warn!(
                    validator = %record.validator_id,
                    missed = record.missed_check_ins,
                    "validator missed check-in"
                );
            }
        }
    }

    pub fn update_address(
        &self,
        validator_id: &ValidatorId,
        address: SocketAddr,
        timestamp: i64,
    ) -> Result<(), StakingError> {
        let mut validators = self.lock()?;
        let Some(record) = validators.get_mut(validator_id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                "address check-in from unknown validator",
            ));
        };
        record.last_known_address = Some(address);
        record.last_check_in_time = timestamp;
        record.consecutive_check_ins += 1;
        debug!(
            validator = %validator_id,
            address = %address,
            consecutive = record.consecutive_check_ins,
            "validator checked in"
        );
        Ok(())
    }

    pub fn get(&self, validator_id: &ValidatorId) -> Option<UptimeRecord> {
        let Ok(validators) = self.inner.lock() else {
            return None;
        };
        validators.get(validator_id).cloned()
    }

    pub fn tier(&self, validator_id: &ValidatorId) -> TrustTier {
        self.get(validator_id)
            .map(|record| record.trust_tier(&self.params))
            .unwrap_or(TrustTier::None)
    }

    pub fn reward_multiplier(&self, validator_id: &ValidatorId) -> i32 {
        self.get(validator_id)
            .map(|record| record.reward_multiplier(&self.params))
            .unwrap_or(0)
    }

    pub fn active_validators(&self) -> Vec<UptimeRecord> {
        let Ok(validators) = self.inner.lock() else {
            return Vec::new();
        };
        validators.values().filter(|record| record.is_active).cloned().collect()
    }

    pub fn validators_by_tier(&self, tier: TrustTier) -> Vec<UptimeRecord> {
        let Ok(validators) = self.inner.lock() else {
            return Vec::new();
        };
        validators
            .values()
            .filter(|record| record.is_active && record.trust_tier(&self.params) == tier)
            .cloned()
            .collect()
    }

    /// Count of active validators in each tier:
    /// `[none, bronze, silver, gold, platinum]`.
    pub fn tier_counts(&self) -> [usize; 5] {
        let Ok(validators) = self.inner.lock() else {
            return [0; 5];
        };
        let mut counts = [0usize; 5];
        for record in validators.values() {
            if !record.is_active {
                continue;
            }
            let slot = match record.trust_tier(&self.params) {
                TrustTier::None => 0,
                TrustTier::Bronze => 1,
                TrustTier::Silver => 2,
                TrustTier::Gold => 3,
                TrustTier::Platinum => 4,
            };
            counts[slot] += 1;
        }
        counts
    }

    pub fn validator_addresses(&self) -> Vec<SocketAddr> {
        let Ok(validators) = self.inner.lock() else {
            return Vec::new();
        };
        validators
            .values()
            .filter(|record| record.is_active)
            .filter_map(|record| record.last_known_address)
            .collect()
    }

    pub fn trusted_addresses(&self, min_tier: TrustTier) -> Vec<SocketAddr> {
        let Ok(validators) = self.inner.lock() else {
            return Vec::new();
        };
        validators
            .values()
            .filter(|record| record.is_active && record.trust_tier(&self.params) >= min_tier)
            .filter_map(|record| record.last_known_address)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use voltd_consensus::params::{chain_params, Network, StakingParams};
    use voltd_primitives::KeyId;

    use super::{HeartbeatStatus, TrustScorer, TrustTier};
    use crate::heartbeat::Heartbeat;

    /// interval 10, window 100, thresholds 950/970/990/999.
    fn params() -> StakingParams {
        let mut params = chain_params(Network::Regtest).staking;
        params.min_validator_stake = 100;
        params
    }

    fn heartbeat(id: KeyId, height: i32) -> Heartbeat {
        Heartbeat {
            validator_id: id,
            block_height: height,
            block_hash: [0u8; 32],
            timestamp: 0,
            node_address: String::new(),
            node_port: 0,
            signature: Vec::new(),
        }
    }

    #[test]
    fn fresh_validator_counts_as_fully_up() {
        let scorer = TrustScorer::new(params());
        let id = KeyId([1; 20]);
        scorer.register(id, 100, 0).expect("register");
        let record = scorer.get(&id).expect("record");
        assert_eq!(record.uptime_per_mille(), 1_000);
        assert_eq!(record.trust_tier(scorer.params()), TrustTier::Platinum);
    }

    #[test]
    fn below_min_stake_is_tier_none() {
        let scorer = TrustScorer::new(params());
        let id = KeyId([1; 20]);
        scorer.register(id, 99, 0).expect("register");
        assert_eq!(scorer.tier(&id), TrustTier::None);
        assert_eq!(scorer.reward_multiplier(&id), 0);
    }

    #[test]
    fn uptime_window_scenario() {
        // Register at 0; send heartbeats at every multiple of 10 except one.
        let scorer = TrustScorer::new(params());
        let id = KeyId([1; 20]);
        scorer.register(id, 100, 0).expect("register");

        for height in (10..=100).step_by(10) {
            if height == 50 {
                continue;
            }
            let status = scorer.process_heartbeat(&heartbeat(id, height), height).expect("hb");
            assert_eq!(status, HeartbeatStatus::Recorded);
        }
        scorer.update_expectations(100);

        let record = scorer.get(&id).expect("record");
        assert_eq!(record.heartbeats_expected, 10);
        assert_eq!(record.heartbeats_received, 9);
        assert_eq!(record.uptime_per_mille(), 900);
        assert_eq!(record.trust_tier(scorer.params()), TrustTier::None);
    }

    #[test]
    fn full_uptime_reaches_platinum() {
        let scorer = TrustScorer::new(params());
        let id = KeyId([1; 20]);
        scorer.register(id, 100, 0).expect("register");
        for height in (10..=100).step_by(10) {
            scorer.process_heartbeat(&heartbeat(id, height), height).expect("hb");
        }
        scorer.update_expectations(100);
        let record = scorer.get(&id).expect("record");
        assert_eq!(record.uptime_per_mille(), 1_000);
        assert_eq!(record.trust_tier(scorer.params()), TrustTier::Platinum);
        assert_eq!(record.reward_multiplier(scorer.params()), 200);
    }

    #[test]
    fn tier_thresholds_are_inclusive() {
        let mut record = {
            let scorer = TrustScorer::new(params());
            let id = KeyId([1; 20]);
            scorer.register(id, 100, 0).expect("register");
            scorer.get(&id).expect("record")
        };
        let params = params();
        // 950/1000 exactly → Bronze, not Silver.
        record.heartbeats_expected = 1_000;
        record.heartbeats_received = 950;
        assert_eq!(record.trust_tier(&params), TrustTier::Bronze);
        record.heartbeats_received = 969;
        assert_eq!(record.trust_tier(&params), TrustTier::Bronze);
        record.heartbeats_received = 970;
        assert_eq!(record.trust_tier(&params), TrustTier::Silver);
        record.heartbeats_received = 990;
        assert_eq!(record.trust_tier(&params), TrustTier::Gold);
        record.heartbeats_received = 999;
        assert_eq!(record.trust_tier(&params), TrustTier::Platinum);
        record.heartbeats_received = 949;
        assert_eq!(record.trust_tier(&params), TrustTier::None);
    }

    #[test]
    fn heartbeat_interval_boundary() {
        let scorer = TrustScorer::new(params());
        let id = KeyId([1; 20]);
        scorer.register(id, 100, 0).expect("register");

        // One block before the interval has elapsed: benign no-op.
        let status = scorer.process_heartbeat(&heartbeat(id, 9), 9).expect("hb");
        assert_eq!(status, HeartbeatStatus::TooEarly);
        let status = scorer.process_heartbeat(&heartbeat(id, 10), 10).expect("hb");
        assert_eq!(status, HeartbeatStatus::Recorded);
        assert_eq!(scorer.get(&id).expect("record").heartbeats_received, 1);

        // Unknown and inactive validators are errors.
        let stranger = KeyId([9; 20]);
        assert!(scorer.process_heartbeat(&heartbeat(stranger, 20), 20).is_err());
        scorer.set_active(&id, false).expect("set inactive");
        assert!(scorer.process_heartbeat(&heartbeat(id, 20), 20).is_err());
    }

    #[test]
    fn missed_check_ins_reset_streak() {
        let scorer = TrustScorer::new(params());
        let id = KeyId([1; 20]);
        scorer.register(id, 100, 0).expect("register");
        let addr = "10.0.0.1:37771".parse().expect("addr");
        scorer.update_address(&id, addr, 1_234).expect("check-in");
        scorer.update_address(&id, addr, 1_244).expect("check-in");
        assert_eq!(scorer.get(&id).expect("record").consecutive_check_ins, 2);

        // Within two intervals: no penalty.
        scorer.record_missed_check_ins(20);
        assert_eq!(scorer.get(&id).expect("record").missed_check_ins, 0);

        // Beyond two intervals: charged and streak reset.
        scorer.record_missed_check_ins(21);
        let record = scorer.get(&id).expect("record");
        assert_eq!(record.missed_check_ins, 1);
        assert_eq!(record.consecutive_check_ins, 0);
        assert_eq!(record.last_known_address, Some(addr));
    }

    #[test]
    fn tier_counts_cover_active_validators() {
        let scorer = TrustScorer::new(params());
        let up = KeyId([1; 20]);
        let poor = KeyId([2; 20]);
        scorer.register(up, 100, 0).expect("register");
        scorer.register(poor, 99, 0).expect("register");
        let counts = scorer.tier_counts();
        assert_eq!(counts[4], 1); // fresh, fully up
        assert_eq!(counts[0], 1); // below stake minimum
    }
}
