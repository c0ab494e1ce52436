//! Peer-to-peer stream network over WebRTC data channels
//!
//! Establishes direct, authenticated byte streams between endpoints
//! identified by long-term keys. A signal ([`rtctunnel_net::PacketNetwork`])
//! is used only to exchange the offer/answer/ICE payloads needed to bring the
//! direct transport up; once connected, data flows peer-to-peer over reliable
//! ordered data channels, one logical port per channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use rtctunnel_crypt::PrivateKey;
//! use rtctunnel_net::Stream;
//! use rtctunnel_webrtc::{Network, NetworkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = PrivateKey::generate();
//!     let network = Network::new(NetworkConfig {
//!         accept_all_peers: true,
//!         ..Default::default()
//!     });
//!
//!     loop {
//!         let (remote, port, stream) = network.accept(&key).await?;
//!         println!("stream from {remote} on port {port}");
//!         stream.write(b"hello").await?;
//!     }
//! }
//! ```

mod config;
mod network;
mod peer;
mod stream;
mod types;

pub use config::NetworkConfig;
pub use network::Network;
pub use peer::PeerError;
pub use types::{channel_label, parse_channel_label, MessageType, SignalMessage};
