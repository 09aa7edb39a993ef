use serde::{Deserialize, Serialize};

/// Heartbeat probe sent by a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatPing {
    /// Identifies one monitor instance; acks from an older epoch are stale
    pub epoch_nonce: u64,

    /// Unique per heartbeat within an epoch
    pub seq_num: u64,
}

/// Answer to a heartbeat, echoing its identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatAck {
    pub epoch_nonce: u64,
    pub seq_num: u64,

    /// The responder's current active-circuit count, piggybacked so the
    /// coordinator's load view rides on liveness traffic
    pub active_count: u64,
}
