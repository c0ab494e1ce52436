//! Configuration for the WebRTC stream network

use rtctunnel_crypt::PublicKey;
use rtctunnel_net::apprtc::ApprtcNetwork;
use rtctunnel_net::PacketNetwork;
use std::sync::Arc;

/// Configuration for a [`crate::Network`]
#[derive(Clone)]
pub struct NetworkConfig {
    /// Signal used to exchange session descriptions and ICE candidates
    pub signal: Arc<dyn PacketNetwork>,
    /// Keep the signal receiver running and admit every inbound peer
    pub accept_all_peers: bool,
    /// Static allowlist of inbound peers. Once every listed peer is connected
    /// and no others are, the signal receiver is stopped to reduce rendezvous
    /// load.
    pub accept_peers: Vec<PublicKey>,
    /// ICE servers handed to each peer connection. An empty list restricts
    /// gathering to host candidates.
    pub ice_servers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signal: Arc::new(ApprtcNetwork::default()),
            accept_all_peers: false,
            accept_peers: Vec::new(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl std::fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("accept_all_peers", &self.accept_all_peers)
            .field("accept_peers", &self.accept_peers)
            .field("ice_servers", &self.ice_servers)
            .finish_non_exhaustive()
    }
}
