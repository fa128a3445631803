//! The staking service: owns the five core components, drives block ticks
//! across them in a fixed order, and keeps the trust scorer's stake and
//! activity mirrors in sync with the registry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use secp256k1::SecretKey;
use tracing::{info, warn};
use voltd_consensus::{Amount, ChainParams};
use voltd_primitives::sig::pubkey_bytes;
use voltd_primitives::{Hash256, KeyId, ValidatorId};
use voltd_trust::{HeartbeatManager, HeartbeatSink, PeerDiscovery, TrustScorer};
use voltd_validators::{
    DelegationLedger, DelegationRequest, RewardClaimRequest, StakingError, StakingErrorKind,
    UndelegationOutcome, UndelegationRequest, ValidatorRecord, ValidatorRegistry, ValidatorStatus,
    ValidatorUpdate, ValidatorUpdateKind,
};

const VALIDATORS_FILE: &str = "validators.dat";
const DELEGATIONS_FILE: &str = "delegations.dat";
const PEERS_FILE: &str = "validator_peers.conf";

/// Heartbeat sink backed by a channel to the P2P relay task.
pub struct ChannelSink {
    sender: Sender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<Vec<u8>>) -> Self {
        Self { sender }
    }
}

impl HeartbeatSink for ChannelSink {
    fn broadcast(&self, payload: Vec<u8>) {
        if self.sender.try_send(payload).is_err() {
            warn!("heartbeat relay channel full, dropping broadcast");
        }
    }
}

/// Reward split for a connected coinstake block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoinstakeSplit {
    pub validator_amount: Amount,
    pub delegators_amount: Amount,
}

struct Wallet {
    secret: SecretKey,
    pubkey: Vec<u8>,
    id: KeyId,
}

pub struct StakingNode {
    params: ChainParams,
    registry: Arc<ValidatorRegistry>,
    ledger: Arc<DelegationLedger>,
    scorer: Arc<TrustScorer>,
    heartbeats: Arc<HeartbeatManager>,
    peers: Arc<PeerDiscovery>,
    wallet: Mutex<Option<Wallet>>,
    data_dir: Mutex<Option<PathBuf>>,
}

impl StakingNode {
    pub fn new(params: ChainParams, sink: Box<dyn HeartbeatSink>) -> Self {
        let staking = params.staking.clone();
        let registry = Arc::new(ValidatorRegistry::new(staking.clone()));
        let ledger = Arc::new(DelegationLedger::new(staking.clone(), Arc::clone(&registry)));
        let scorer = Arc::new(TrustScorer::new(staking.clone()));
        let peers = Arc::new(PeerDiscovery::new(None));
        let heartbeats = Arc::new(HeartbeatManager::new(
            staking,
            Arc::clone(&registry),
            Arc::clone(&scorer),
            Arc::clone(&peers),
            sink,
        ));
        Self {
            params,
            registry,
            ledger,
            scorer,
            heartbeats,
            peers,
            wallet: Mutex::new(None),
            data_dir: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<DelegationLedger> {
        &self.ledger
    }

    pub fn scorer(&self) -> &Arc<TrustScorer> {
        &self.scorer
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatManager> {
        &self.heartbeats
    }

    pub fn peers(&self) -> &Arc<PeerDiscovery> {
        &self.peers
    }

    /// Points persistence at a data directory and loads any prior state.
    pub fn open_data_dir(&self, dir: &Path) -> Result<(), StakingError> {
        self.peers.set_path(dir.join(PEERS_FILE));
        if let Err(err) = self.peers.load() {
            warn!(error = %err, "failed to load peers file");
        }
        self.load_state(dir)?;
        if let Ok(mut data_dir) = self.data_dir.lock() {
            *data_dir = Some(dir.to_path_buf());
        }
        Ok(())
    }

    /// Installs the wallet key used to sign RPC-originated requests.
    pub fn set_wallet_key(&self, secret: SecretKey) {
        let pubkey = pubkey_bytes(&secret);
        let id = KeyId::from_pubkey(&pubkey);
        info!(id = %id, "wallet key loaded");
        if let Ok(mut wallet) = self.wallet.lock() {
            *wallet = Some(Wallet { secret, pubkey, id });
        }
    }

    /// Also enables local heartbeat broadcasting from `address`.
    pub fn enable_validator(&self, secret: SecretKey, address: std::net::SocketAddr) {
        self.heartbeats.set_local_identity(secret, address);
        self.set_wallet_key(secret);
    }

    pub fn wallet_id(&self) -> Option<KeyId> {
        self.wallet.lock().ok()?.as_ref().map(|wallet| wallet.id)
    }

    fn with_wallet<T>(
        &self,
        action: impl FnOnce(&SecretKey, &[u8], KeyId) -> T,
    ) -> Result<T, StakingError> {
        let wallet = self.wallet.lock().map_err(|_| {
            StakingError::new(StakingErrorKind::Internal, "wallet lock poisoned")
        })?;
        let Some(wallet) = wallet.as_ref() else {
            return Err(StakingError::new(
                StakingErrorKind::WrongStatus,
                "no wallet key loaded",
            ));
        };
        Ok(action(&wallet.secret, &wallet.pubkey, wallet.id))
    }

    /// Block tick. Callers must serialize notifications per height.
    pub fn on_block(&self, height: i32, block_hash: Hash256) {
        let changes = self.registry.on_block(height);
        for change in changes {
            self.sync_scorer(&change.id);
        }
        self.ledger.on_block(height);
        // Updates scoring expectations and broadcasts when due.
        self.heartbeats.on_block(height, block_hash);
        let interval = self.params.staking.heartbeat_interval;
        if interval > 0 && height % interval == 0 {
            self.scorer.record_missed_check_ins(height);
        }
    }

    /// Mirrors the registry's stake and activity into the trust scorer.
    fn sync_scorer(&self, id: &ValidatorId) {
        let Some(record) = self.registry.get(id) else {
            return;
        };
        if self.scorer.get(id).is_none() {
            if let Err(err) = self
                .scorer
                .register(*id, record.self_stake, record.registration_height)
            {
                warn!(error = %err, "failed to track validator in scorer");
                return;
            }
        }
        if let Err(err) = self.scorer.update_stake(id, record.self_stake) {
            warn!(error = %err, "failed to sync validator stake");
        }
        let active = record.status == ValidatorStatus::Active;
        if let Err(err) = self.scorer.set_active(id, active) {
            warn!(error = %err, "failed to sync validator activity");
        }
    }

    /// Registers the wallet as a validator with the given terms.
    pub fn register_validator(
        &self,
        self_stake: Amount,
        fee_bps: i64,
        name: String,
    ) -> Result<ValidatorRecord, StakingError> {
        let height = self.registry.height();
        let (id, record) = self.with_wallet(|_, pubkey, id| {
            (
                id,
                ValidatorRecord::new(id, pubkey.to_vec(), self_stake, fee_bps, name, height),
            )
        })?;
        self.registry.register(record)?;
        if let Err(err) = self.scorer.register(id, self_stake, height) {
            warn!(error = %err, "failed to track validator in scorer");
        }
        // Registrations start Pending; the mirror follows the registry.
        self.sync_scorer(&id);
        self.registry
            .get(&id)
            .ok_or_else(|| StakingError::new(StakingErrorKind::Internal, "record vanished"))
    }

    /// Signs and applies a validator update for the wallet key.
    pub fn submit_update(
        &self,
        kind: ValidatorUpdateKind,
        new_value: i64,
        new_name: String,
    ) -> Result<ValidatorRecord, StakingError> {
        let height = self.registry.height();
        let update = self.with_wallet(|secret, _, id| {
            let mut update = ValidatorUpdate {
                validator_id: id,
                kind,
                new_value,
                new_name,
                height,
                signature: Vec::new(),
            };
            update.sign(secret);
            update
        })?;
        let record = self.registry.process_update(&update)?;
        self.sync_scorer(&record.id);
        Ok(record)
    }

    /// Delegates wallet funds to a validator.
    pub fn delegate(
        &self,
        validator: ValidatorId,
        amount: Amount,
    ) -> Result<Hash256, StakingError> {
        let height = self.registry.height();
        let request = self.with_wallet(|secret, pubkey, id| {
            let mut request = DelegationRequest {
                delegator: id,
                delegator_pubkey: pubkey.to_vec(),
                validator,
                amount,
                height,
                signature: Vec::new(),
            };
            request.sign(secret);
            request
        })?;
        self.ledger.process_delegation(&request, None)
    }

    /// Unbonds wallet delegations to a validator; `amount = 0` means all.
    pub fn undelegate(
        &self,
        validator: ValidatorId,
        amount: Amount,
    ) -> Result<UndelegationOutcome, StakingError> {
        let height = self.registry.height();
        let request = self.with_wallet(|secret, pubkey, id| {
            let mut request = UndelegationRequest {
                delegator: id,
                delegator_pubkey: pubkey.to_vec(),
                validator,
                amount,
                height,
                signature: Vec::new(),
            };
            request.sign(secret);
            request
        })?;
        self.ledger.process_undelegation(&request)
    }

    /// Claims pending rewards, optionally scoped to one validator.
    pub fn claim_rewards(
        &self,
        validator: Option<ValidatorId>,
    ) -> Result<(Amount, usize), StakingError> {
        let height = self.registry.height();
        let request = self.with_wallet(|secret, pubkey, id| {
            let mut request = RewardClaimRequest {
                delegator: id,
                delegator_pubkey: pubkey.to_vec(),
                validator,
                height,
                signature: Vec::new(),
            };
            request.sign(secret);
            request
        })?;
        self.ledger.process_reward_claim(&request)
    }

    /// Applies the reward split for a connected coinstake block: the
    /// delegators' post-fee share is distributed across their pending
    /// rewards, the rest belongs to the validator's own payout.
    pub fn apply_coinstake(
        &self,
        validator: &ValidatorId,
        block_reward: Amount,
    ) -> Result<CoinstakeSplit, StakingError> {
        let record = self.registry.get(validator).ok_or_else(|| {
            StakingError::new(
                StakingErrorKind::NotFound,
                format!("unknown validator {validator}"),
            )
        })?;
        let delegators_amount = record.delegators_reward(block_reward);
        self.ledger.distribute_block_reward(validator, delegators_amount)?;
        Ok(CoinstakeSplit {
            validator_amount: record.validator_reward(block_reward),
            delegators_amount,
        })
    }

    /// Writes both record maps and the peer file under the data dir.
    pub fn save_state(&self) -> Result<(), StakingError> {
        let dir = {
            let data_dir = self.data_dir.lock().map_err(|_| {
                StakingError::new(StakingErrorKind::Internal, "data dir lock poisoned")
            })?;
            data_dir.clone().ok_or_else(|| {
                StakingError::new(StakingErrorKind::BadParameter, "no data dir configured")
            })?
        };
        std::fs::create_dir_all(&dir).map_err(|err| {
            StakingError::new(StakingErrorKind::Internal, format!("create data dir: {err}"))
        })?;
        std::fs::write(dir.join(VALIDATORS_FILE), self.registry.serialize()).map_err(|err| {
            StakingError::new(StakingErrorKind::Internal, format!("write validators: {err}"))
        })?;
        std::fs::write(dir.join(DELEGATIONS_FILE), self.ledger.serialize()).map_err(|err| {
            StakingError::new(StakingErrorKind::Internal, format!("write delegations: {err}"))
        })?;
        if let Err(err) = self.peers.persist() {
            warn!(error = %err, "failed to persist peers file");
        }
        info!(dir = %dir.display(), "saved staking state");
        Ok(())
    }

    fn load_state(&self, dir: &Path) -> Result<(), StakingError> {
        let validators_path = dir.join(VALIDATORS_FILE);
        match std::fs::read(&validators_path) {
            Ok(bytes) => {
                self.registry.deserialize(&bytes)?;
                // Rebuild scorer mirrors for every known validator.
                for record in self.registry.all_validators() {
                    self.sync_scorer(&record.id);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StakingError::new(
                    StakingErrorKind::Internal,
                    format!("read validators: {err}"),
                ));
            }
        }
        let delegations_path = dir.join(DELEGATIONS_FILE);
        match std::fs::read(&delegations_path) {
            Ok(bytes) => self.ledger.deserialize(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StakingError::new(
                    StakingErrorKind::Internal,
                    format!("read delegations: {err}"),
                ));
            }
        }
        info!(dir = %dir.display(), "loaded staking state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secp256k1::SecretKey;
    use voltd_consensus::params::{chain_params, Network};
    use voltd_trust::heartbeat::NullSink;
    use voltd_validators::ValidatorUpdateKind;

    use super::StakingNode;

    fn test_key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).expect("secret key")
    }

    fn node() -> StakingNode {
        let mut params = chain_params(Network::Regtest);
        params.staking.min_validator_stake = 100;
        params.staking.min_delegation = 10;
        StakingNode::new(params, Box::new(NullSink))
    }

    #[test]
    fn full_staking_cycle() {
        let validator_node = node();
        validator_node.set_wallet_key(test_key(1));
        let record = validator_node
            .register_validator(200, 1_000, String::from("pool"))
            .expect("register");
        let validator_id = record.id;

        let maturity = validator_node.params().staking.validator_maturity;
        validator_node.on_block(maturity, [0u8; 32]);
        assert!(validator_node
            .registry()
            .get(&validator_id)
            .expect("validator")
            .is_eligible_for_staking(&validator_node.params().staking, maturity));

        // Delegate from a second wallet on the same node state.
        validator_node.set_wallet_key(test_key(2));
        validator_node.delegate(validator_id, 100).expect("delegate");
        let height = maturity + validator_node.params().staking.delegation_maturity;
        validator_node.on_block(height, [0u8; 32]);

        let split = validator_node.apply_coinstake(&validator_id, 600).expect("coinstake");
        // Self 200 + delegated 100: delegators' pre-fee share 200, fee 20.
        assert_eq!(split.delegators_amount, 180);
        assert_eq!(split.validator_amount, 420);

        let (claimed, records) = validator_node.claim_rewards(Some(validator_id)).expect("claim");
        assert_eq!((claimed, records), (180, 1));

        let outcome = validator_node.undelegate(validator_id, 0).expect("undelegate");
        assert_eq!(outcome.amount, 100);

        // Validator fee change through the signed-update path.
        validator_node.set_wallet_key(test_key(1));
        let updated = validator_node
            .submit_update(ValidatorUpdateKind::FeeBps, 250, String::new())
            .expect("fee update");
        assert_eq!(updated.fee_bps, 250);
    }

    #[test]
    fn scorer_follows_registry_transitions() {
        let staking_node = node();
        staking_node.set_wallet_key(test_key(1));
        let record = staking_node
            .register_validator(150, 500, String::new())
            .expect("register");

        // Pending: tracked but the maturity tick flips activity on.
        let maturity = staking_node.params().staking.validator_maturity;
        staking_node.on_block(maturity, [0u8; 32]);
        let uptime = staking_node.scorer().get(&record.id).expect("uptime");
        assert!(uptime.is_active);
        assert_eq!(uptime.stake, 150);

        let updated = staking_node
            .submit_update(ValidatorUpdateKind::Deactivate, 0, String::new())
            .expect("deactivate");
        assert_eq!(updated.status.as_str(), "unbonding");
        let uptime = staking_node.scorer().get(&record.id).expect("uptime");
        assert!(!uptime.is_active);
    }

    #[test]
    fn state_roundtrip_through_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staking_node = node();
        staking_node.open_data_dir(dir.path()).expect("open");
        staking_node.set_wallet_key(test_key(1));
        let record = staking_node
            .register_validator(200, 1_000, String::from("pool"))
            .expect("register");
        let maturity = staking_node.params().staking.validator_maturity;
        staking_node.on_block(maturity, [0u8; 32]);
        staking_node.set_wallet_key(test_key(2));
        staking_node.delegate(record.id, 50).expect("delegate");
        staking_node.save_state().expect("save");

        let restored = node();
        restored.open_data_dir(dir.path()).expect("reopen");
        let loaded = restored.registry().get(&record.id).expect("validator");
        assert_eq!(loaded.self_stake, 200);
        assert_eq!(restored.ledger().len(), 1);
        // Scorer mirror rebuilt from the registry.
        assert!(restored.scorer().get(&record.id).is_some());
    }
}
