//! Heartbeat production and dispatch.
//!
//! The manager signs heartbeats for the local validator on a block cadence,
//! validates and deduplicates inbound ones, feeds accepted heartbeats to
//! the trust scorer, and forwards learned addresses to peer discovery.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::SecretKey;
use tracing::{debug, info, warn};
use voltd_consensus::StakingParams;
use voltd_primitives::encoding::{DecodeError, Decoder, Encoder};
use voltd_primitives::hash::sha256d;
use voltd_primitives::sig::{pubkey_bytes, sign_digest, verify_digest};
use voltd_primitives::{Hash256, KeyId, ValidatorId};
use voltd_validators::{StakingError, StakingErrorKind, ValidatorRecord, ValidatorRegistry};

use crate::peers::PeerDiscovery;
use crate::score::{HeartbeatStatus, TrustScorer};

/// Hard cap on the replay set; the oldest half is dropped on overflow.
pub const MAX_SEEN_HEARTBEATS: usize = 10_000;

/// Signed liveness proof. The node address travels as a printable
/// `ip:port` string so the signed payload is transport-independent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Heartbeat {
    pub validator_id: ValidatorId,
    pub block_height: i32,
    pub block_hash: Hash256,
    pub timestamp: i64,
    pub node_address: String,
    pub node_port: u16,
    pub signature: Vec<u8>,
}

impl Heartbeat {
    pub fn sighash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.validator_id.consensus_encode(&mut encoder);
        encoder.write_i32_le(self.block_height);
        encoder.write_bytes(&self.block_hash);
        encoder.write_i64_le(self.timestamp);
        encoder.write_var_str(&self.node_address);
        encoder.write_u16_le(self.node_port);
        sha256d(&encoder.into_inner())
    }

    pub fn sign(&mut self, secret: &SecretKey) {
        self.signature = sign_digest(secret, &self.sighash());
    }

    pub fn verify(&self, pubkey: &[u8]) -> bool {
        verify_digest(pubkey, &self.sighash(), &self.signature)
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.node_address.parse().ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.validator_id.consensus_encode(&mut encoder);
        encoder.write_i32_le(self.block_height);
        encoder.write_bytes(&self.block_hash);
        encoder.write_i64_le(self.timestamp);
        encoder.write_var_str(&self.node_address);
        encoder.write_u16_le(self.node_port);
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let validator_id = ValidatorId::consensus_decode(&mut decoder)?;
        let block_height = decoder.read_i32_le()?;
        let block_hash = decoder.read_fixed::<32>()?;
        let timestamp = decoder.read_i64_le()?;
        let node_address = decoder.read_var_str()?;
        let node_port = decoder.read_u16_le()?;
        let signature = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            validator_id,
            block_height,
            block_hash,
            timestamp,
            node_address,
            node_port,
            signature,
        })
    }
}

/// Gossiped registration announcement, self-contained: the id is derived
/// from the announced pubkey.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatorAnnouncement {
    pub pubkey: Vec<u8>,
    pub stake: i64,
    pub fee_bps: i64,
    pub registration_height: i32,
    pub signature: Vec<u8>,
}

impl ValidatorAnnouncement {
    pub fn sighash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_i64_le(self.stake);
        encoder.write_i64_le(self.fee_bps);
        encoder.write_i32_le(self.registration_height);
        sha256d(&encoder.into_inner())
    }

    pub fn sign(&mut self, secret: &SecretKey) {
        self.signature = sign_digest(secret, &self.sighash());
    }

    pub fn verify(&self) -> bool {
        verify_digest(&self.pubkey, &self.sighash(), &self.signature)
    }

    pub fn validator_id(&self) -> ValidatorId {
        KeyId::from_pubkey(&self.pubkey)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_bytes(&self.pubkey);
        encoder.write_i64_le(self.stake);
        encoder.write_i64_le(self.fee_bps);
        encoder.write_i32_le(self.registration_height);
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let pubkey = decoder.read_var_bytes()?;
        let stake = decoder.read_i64_le()?;
        let fee_bps = decoder.read_i64_le()?;
        let registration_height = decoder.read_i32_le()?;
        let signature = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            pubkey,
            stake,
            fee_bps,
            registration_height,
            signature,
        })
    }
}

/// Transport seam: the P2P layer injects whatever actually moves bytes.
pub trait HeartbeatSink: Send + Sync {
    fn broadcast(&self, payload: Vec<u8>);
}

/// Sink that drops everything; useful for non-listening nodes and tests.
pub struct NullSink;

impl HeartbeatSink for NullSink {
    fn broadcast(&self, _payload: Vec<u8>) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatOutcome {
    Accepted,
    AlreadySeen,
    TooEarly,
}

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatStats {
    pub is_validator: bool,
    pub last_broadcast_height: i32,
    pub seen_heartbeats: usize,
    pub active_validators: usize,
}

struct LocalIdentity {
    secret: SecretKey,
    address: SocketAddr,
}

struct HeartbeatState {
    identity: Option<LocalIdentity>,
    last_broadcast_height: i32,
    seen: HashSet<Hash256>,
    seen_order: VecDeque<Hash256>,
}

impl HeartbeatState {
    fn remember(&mut self, hash: Hash256) {
        if !self.seen.insert(hash) {
            return;
        }
        self.seen_order.push_back(hash);
        if self.seen.len() > MAX_SEEN_HEARTBEATS {
            // FIFO eviction of the oldest half.
            for _ in 0..self.seen.len() / 2 {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}

pub struct HeartbeatManager {
    params: StakingParams,
    registry: Arc<ValidatorRegistry>,
    scorer: Arc<TrustScorer>,
    peers: Arc<PeerDiscovery>,
    sink: Box<dyn HeartbeatSink>,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatManager {
    pub fn new(
        params: StakingParams,
        registry: Arc<ValidatorRegistry>,
        scorer: Arc<TrustScorer>,
        peers: Arc<PeerDiscovery>,
        sink: Box<dyn HeartbeatSink>,
    ) -> Self {
        Self {
            params,
            registry,
            scorer,
            peers,
            sink,
            state: Mutex::new(HeartbeatState {
                identity: None,
                last_broadcast_height: 0,
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
            }),
        }
    }

    /// Configures this node as a validator.
    pub fn set_local_identity(&self, secret: SecretKey, address: SocketAddr) {
        if let Ok(mut state) = self.state.lock() {
            let id = KeyId::from_pubkey(&pubkey_bytes(&secret));
            info!(validator = %id, address = %address, "configured as validator");
            state.identity = Some(LocalIdentity { secret, address });
        }
    }

    pub fn is_validator(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.identity.is_some())
            .unwrap_or(false)
    }

    pub fn local_validator_id(&self) -> Option<ValidatorId> {
        let Ok(state) = self.state.lock() else {
            return None;
        };
        state
            .identity
            .as_ref()
            .map(|identity| KeyId::from_pubkey(&pubkey_bytes(&identity.secret)))
    }

    /// Block tick: refresh scoring expectations and, when configured as a
    /// validator on an interval boundary, broadcast a signed heartbeat.
    /// Concurrent ticks at the same height produce at most one broadcast.
    pub fn on_block(&self, height: i32, block_hash: Hash256) {
        self.scorer.update_expectations(height);

        let payload = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let Some(identity) = state.identity.as_ref() else {
                return;
            };
            let interval = self.params.heartbeat_interval;
            if interval <= 0 || height % interval != 0 {
                return;
            }
            if height - state.last_broadcast_height < interval {
                return;
            }

            let mut heartbeat = Heartbeat {
                validator_id: KeyId::from_pubkey(&pubkey_bytes(&identity.secret)),
                block_height: height,
                block_hash,
                timestamp: now_secs(),
                node_address: identity.address.to_string(),
                node_port: identity.address.port(),
                signature: Vec::new(),
            };
            heartbeat.sign(&identity.secret);
            state.last_broadcast_height = height;
            state.remember(heartbeat.sighash());
            debug!(height, "broadcasting heartbeat");
            heartbeat.encode()
        };
        // Dispatch outside the lock.
        self.sink.broadcast(payload);
    }

    /// Inbound heartbeat pipeline: replay dedup, signature check against
    /// the registry's pubkey, scorer update, then address propagation.
    pub fn process_heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatOutcome, StakingError> {
        let hash = heartbeat.sighash();
        {
            let Ok(state) = self.state.lock() else {
                return Err(StakingError::new(
                    StakingErrorKind::Internal,
                    "heartbeat manager lock poisoned",
                ));
            };
            if state.seen.contains(&hash) {
                return Ok(HeartbeatOutcome::AlreadySeen);
            }
        }

        let Some(validator) = self.registry.get(&heartbeat.validator_id) else {
            return Err(StakingError::new(
                StakingErrorKind::NotFound,
                "heartbeat from unknown validator",
            ));
        };
        if !heartbeat.verify(&validator.pubkey) {
            return Err(StakingError::new(
                StakingErrorKind::BadSignature,
                "invalid heartbeat signature",
            ));
        }

        match self.scorer.process_heartbeat(heartbeat, heartbeat.block_height)? {
            HeartbeatStatus::TooEarly => return Ok(HeartbeatOutcome::TooEarly),
            HeartbeatStatus::Recorded => {}
        }

        if let Ok(mut state) = self.state.lock() {
            state.remember(hash);
        }

        if let Some(address) = heartbeat.socket_addr() {
            if let Err(err) =
                self.scorer
                    .update_address(&heartbeat.validator_id, address, heartbeat.timestamp)
            {
                warn!(error = %err, "failed to record validator address");
            }
            if self.peers.process(address, &heartbeat.validator_id) {
                info!(
                    address = %address,
                    validator = %heartbeat.validator_id,
                    "discovered validator peer from heartbeat"
                );
            }
        }

        debug!(
            validator = %heartbeat.validator_id,
            height = heartbeat.block_height,
            "accepted heartbeat"
        );
        Ok(HeartbeatOutcome::Accepted)
    }

    /// Inbound registration announcement: verify, enforce the stake floor,
    /// then install the validator if it is not already known.
    pub fn process_announcement(
        &self,
        announcement: &ValidatorAnnouncement,
    ) -> Result<ValidatorId, StakingError> {
        if !announcement.verify() {
            return Err(StakingError::new(
                StakingErrorKind::BadSignature,
                "invalid registration announcement signature",
            ));
        }
        if announcement.stake < self.params.min_validator_stake {
            return Err(StakingError::new(
                StakingErrorKind::BelowMinimum,
                format!(
                    "announced stake {} below minimum {}",
                    announcement.stake, self.params.min_validator_stake
                ),
            ));
        }

        let id = announcement.validator_id();
        if self.registry.get(&id).is_some() {
            return Ok(id);
        }
        self.registry.register(ValidatorRecord::new(
            id,
            announcement.pubkey.clone(),
            announcement.stake,
            announcement.fee_bps,
            String::new(),
            announcement.registration_height,
        ))?;
        if let Err(err) = self.scorer.register(id, announcement.stake, announcement.registration_height)
        {
            warn!(error = %err, "failed to track announced validator");
        } else if let Err(err) = self.scorer.set_active(&id, false) {
            // Registrations start Pending; activity follows maturity.
            warn!(error = %err, "failed to mark announced validator pending");
        }
        info!(validator = %id, stake = announcement.stake, "registered announced validator");
        Ok(id)
    }

    /// Builds and signs an announcement for the local validator.
    pub fn create_announcement(
        &self,
        stake: i64,
        fee_bps: i64,
        height: i32,
    ) -> Result<ValidatorAnnouncement, StakingError> {
        let Ok(state) = self.state.lock() else {
            return Err(StakingError::new(
                StakingErrorKind::Internal,
                "heartbeat manager lock poisoned",
            ));
        };
        let Some(identity) = state.identity.as_ref() else {
            return Err(StakingError::new(
                StakingErrorKind::WrongStatus,
                "node is not configured as a validator",
            ));
        };
        let mut announcement = ValidatorAnnouncement {
            pubkey: pubkey_bytes(&identity.secret),
            stake,
            fee_bps,
            registration_height: height,
            signature: Vec::new(),
        };
        announcement.sign(&identity.secret);
        Ok(announcement)
    }

    pub fn stats(&self) -> HeartbeatStats {
        let (is_validator, last_broadcast_height, seen_heartbeats) = self
            .state
            .lock()
            .map(|state| {
                (
                    state.identity.is_some(),
                    state.last_broadcast_height,
                    state.seen.len(),
                )
            })
            .unwrap_or((false, 0, 0));
        HeartbeatStats {
            is_validator,
            last_broadcast_height,
            seen_heartbeats,
            active_validators: self.scorer.active_validators().len(),
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
