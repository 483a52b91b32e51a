//! One-shot tunnel signaling.
//!
//! The whole offer/answer exchange collapses into a single protocol request:
//! the dialer gathers candidates non-trickle, packs the complete offer into
//! the request body, and the answerer replies with its complete answer. Both
//! sides also declare the largest single frame they accept; the effective
//! limit of the tunnel is the smaller of the two.

use serde::{Deserialize, Serialize};

use crate::model::encode_path;

/// Method under which every tunnel-capable terminal serves signaling.
pub fn signal_method() -> String {
    encode_path(&["PeerTunnel", "Signal"])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Complete SDP offer, candidates included.
    pub offer_sdp: String,
    /// Largest single frame the dialer accepts over the channel.
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResponse {
    /// Complete SDP answer, candidates included.
    pub answer_sdp: String,
    /// Largest single frame the answerer accepts over the channel.
    pub max_message_size: usize,
}

/// Of two terminals dialing each other at once, exactly one offer survives.
/// The lexicographically smaller terminal id holds the offerer role.
pub fn is_offerer(local_id: &str, peer_id: &str) -> bool {
    local_id < peer_id
}
