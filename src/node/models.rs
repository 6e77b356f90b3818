//! Status snapshot models

use serde::Serialize;

/// Complete node status
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Local address of the shared P2P socket
    pub lan: Option<String>,
    /// Reflexive address reported by STUN
    pub wan: Option<String>,
    pub stun_server: Option<String>,
    /// LAN multicast discovery running
    pub beacon: bool,
    pub peers: Vec<PeerInfo>,
}

/// One peer session
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: String,
    pub state: String,
    /// Milliseconds since the last datagram, absent when nothing received
    pub last_receive_ms_ago: Option<u64>,
}
