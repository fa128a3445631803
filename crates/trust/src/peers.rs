//! Validator peer discovery: an idempotent set of addresses learned from
//! heartbeats, persisted as an `addnode=` config fragment.

use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};
use voltd_primitives::ValidatorId;
use voltd_validators::{StakingError, StakingErrorKind};

struct PeerState {
    known: BTreeSet<SocketAddr>,
    pending: BTreeSet<SocketAddr>,
    path: Option<PathBuf>,
}

pub struct PeerDiscovery {
    state: Mutex<PeerState>,
}

impl PeerDiscovery {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(PeerState {
                known: BTreeSet::new(),
                pending: BTreeSet::new(),
                path,
            }),
        }
    }

    pub fn set_path(&self, path: PathBuf) {
        if let Ok(mut state) = self.state.lock() {
            state.path = Some(path);
        }
    }

    /// Records a validator address. Returns true when the address is new;
    /// a repeated address is a benign no-op.
    pub fn process(&self, address: SocketAddr, validator_id: &ValidatorId) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.known.contains(&address) {
            return false;
        }
        state.known.insert(address);
        state.pending.insert(address);
        info!(address = %address, validator = %validator_id, "new validator peer");
        true
    }

    /// Returns and clears the queue of peers awaiting an addnode call.
    pub fn drain_pending(&self) -> Vec<SocketAddr> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let pending = state.pending.iter().copied().collect();
        state.pending.clear();
        pending
    }

    /// Drops a single address from the pending queue; the address stays
    /// known.
    pub fn mark_added(&self, address: &SocketAddr) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(address);
        }
    }

    pub fn is_known(&self, address: &SocketAddr) -> bool {
        self.state
            .lock()
            .map(|state| state.known.contains(address))
            .unwrap_or(false)
    }

    pub fn known_count(&self) -> usize {
        self.state.lock().map(|state| state.known.len()).unwrap_or(0)
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.state
            .lock()
            .map(|state| state.known.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Clears the known and pending sets. Used before reloading from disk.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.known.clear();
            state.pending.clear();
        }
    }

    /// Writes the known peers as a config fragment:
    /// comments plus one `addnode=ip:port` line per peer.
    pub fn persist(&self) -> Result<usize, StakingError> {
        let Ok(state) = self.state.lock() else {
            return Err(StakingError::new(
                StakingErrorKind::Internal,
                "peer discovery lock poisoned",
            ));
        };
        let Some(path) = state.path.clone() else {
            return Err(StakingError::new(
                StakingErrorKind::BadParameter,
                "no peer file path configured",
            ));
        };

        let mut contents = String::new();
        contents.push_str("# Validator peers discovered from heartbeats\n");
        contents.push_str("# Format: addnode=ip:port\n");
        for peer in &state.known {
            contents.push_str(&format!("addnode={peer}\n"));
        }
        let count = state.known.len();
        drop(state);

        fs::write(&path, contents).map_err(|err| {
            StakingError::new(
                StakingErrorKind::Internal,
                format!("failed to write peer file: {err}"),
            )
        })?;
        info!(peers = count, path = %path.display(), "saved validator peers");
        Ok(count)
    }

    /// Loads peers from the config fragment. Lines that are comments,
    /// blank, or fail to parse are skipped. A missing file is not an error.
    pub fn load(&self) -> Result<usize, StakingError> {
        let path = {
            let Ok(state) = self.state.lock() else {
                return Err(StakingError::new(
                    StakingErrorKind::Internal,
                    "peer discovery lock poisoned",
                ));
            };
            let Some(path) = state.path.clone() else {
                return Err(StakingError::new(
                    StakingErrorKind::BadParameter,
                    "no peer file path configured",
                ));
            };
            path
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(StakingError::new(
                    StakingErrorKind::Internal,
                    format!("failed to read peer file: {err}"),
                ));
            }
        };

        let mut loaded = 0;
        let Ok(mut state) = self.state.lock() else {
            return Err(StakingError::new(
                StakingErrorKind::Internal,
                "peer discovery lock poisoned",
            ));
        };
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(addr_str) = line.strip_prefix("addnode=") else {
                continue;
            };
            match addr_str.trim().parse::<SocketAddr>() {
                Ok(address) => {
                    if state.known.insert(address) {
                        loaded += 1;
                    }
                }
                Err(_) => {
                    warn!(entry = addr_str, "skipping unresolvable peer entry");
                }
            }
        }
        info!(peers = loaded, path = %path.display(), "loaded validator peers");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use voltd_primitives::KeyId;

    use super::PeerDiscovery;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:37771").parse().expect("addr")
    }

    #[test]
    fn process_is_idempotent() {
        let peers = PeerDiscovery::new(None);
        let id = KeyId([1; 20]);
        assert!(peers.process(addr(1), &id));
        assert!(!peers.process(addr(1), &id));
        assert_eq!(peers.known_count(), 1);
        assert!(peers.is_known(&addr(1)));
    }

    #[test]
    fn pending_queue_drains_and_marks() {
        let peers = PeerDiscovery::new(None);
        let id = KeyId([1; 20]);
        peers.process(addr(1), &id);
        peers.process(addr(2), &id);
        peers.mark_added(&addr(1));
        assert_eq!(peers.drain_pending(), vec![addr(2)]);
        assert!(peers.drain_pending().is_empty());
        // Still known after draining.
        assert_eq!(peers.known_count(), 2);
    }

    #[test]
    fn peer_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("validator_peers.conf");
        let peers = PeerDiscovery::new(Some(path.clone()));
        let id = KeyId([1; 20]);
        for last in 1..=3 {
            peers.process(addr(last), &id);
        }
        assert_eq!(peers.persist().expect("persist"), 3);

        peers.clear();
        assert_eq!(peers.known_count(), 0);
        assert_eq!(peers.load().expect("load"), 3);
        assert_eq!(peers.known_peers(), vec![addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn load_skips_junk_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("validator_peers.conf");
        std::fs::write(
            &path,
            "# comment\n\naddnode=10.0.0.1:37771\naddnode=not-an-address\nrandom line\naddnode=10.0.0.2:37771\n",
        )
        .expect("write");
        let peers = PeerDiscovery::new(Some(path));
        assert_eq!(peers.load().expect("load"), 2);
        assert!(peers.is_known(&addr(1)));
        assert!(peers.is_known(&addr(2)));
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let peers = PeerDiscovery::new(Some(dir.path().join("absent.conf")));
        assert_eq!(peers.load().expect("load"), 0);
    }

    #[test]
    fn no_path_is_an_error() {
        let peers = PeerDiscovery::new(None);
        assert!(peers.persist().is_err());
        assert!(peers.load().is_err());
    }
}
