//! Liveness scoring, heartbeat plumbing, and validator peer discovery.

pub mod heartbeat;
pub mod peers;
pub mod score;

pub use heartbeat::{
    Heartbeat, HeartbeatManager, HeartbeatOutcome, HeartbeatSink, HeartbeatStats, NullSink,
    ValidatorAnnouncement, MAX_SEEN_HEARTBEATS,
};
pub use peers::PeerDiscovery;
pub use score::{HeartbeatStatus, TrustScorer, TrustTier, UptimeRecord};
