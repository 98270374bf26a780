//! Peer-connection management for the kestrel bitcoin node.
//!
//! This crate implements the outbound side of the P2P layer: it discovers
//! peer addresses, dials them, performs the `version`/`verack` handshake,
//! keeps connections alive with pings, and retires peers that misbehave or
//! age out. It provides:
//!
//! - **A peer-manager actor** - a single task that owns all peer state and
//!   serializes every transition through one mailbox
//! - **Peer discovery** - static peers, DNS seeds, and `addr` gossip merged
//!   into a pool of known addresses
//! - **Liveness monitoring** - per-peer idle tracking with ping probes,
//!   timeout enforcement, and jittered forced rotation
//! - **Event publication** - `PeerConnected`/`PeerDisconnected` events plus
//!   a feed of protocol messages for upstream consumers
//!
//! # Architecture
//!
//! The crate is organized around these components:
//!
//! - [`PeerManager`] - starts and owns the actor, the connect loop, and the
//!   supervisor for all per-peer tasks
//! - [`ManagerHandle`] - cloneable entry point for injecting messages and
//!   observing the online registry
//! - [`PeerRegistry`] - the transactional record of online peers, sorted by
//!   median ping and keyed by mailbox, task, and address
//! - [`Connector`] - the seam behind which the socket I/O loop and wire
//!   codec live; the manager itself never touches the network
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_net::{network, Connector, PeerContext, PeerManager, PeerManagerConfig, PeerMessage};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! /// A connector that discards outbound traffic.
//! struct NullConnector;
//!
//! #[async_trait::async_trait]
//! impl Connector for NullConnector {
//!     async fn run(&self, mut ctx: PeerContext) -> kestrel_net::Result<()> {
//!         while let Some(msg) = ctx.mailbox.recv().await {
//!             if let PeerMessage::Kill(err) = msg {
//!                 return Err(err.into());
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() {
//! let (events_tx, mut events_rx) = mpsc::unbounded_channel();
//! let (messages_tx, _messages_rx) = mpsc::unbounded_channel();
//!
//! let mut config =
//!     PeerManagerConfig::new(network::BTC, Arc::new(NullConnector), events_tx, messages_tx);
//! config.max_peers = 8;
//!
//! let manager = PeerManager::start(config);
//! manager.handle().best(850_000).unwrap();
//!
//! while let Some(event) = events_rx.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

mod discovery;
mod error;
mod manager;
mod message;
pub mod network;
mod peer;
mod registry;
mod resolver;
mod supervisor;

pub use discovery::{discover, KnownAddresses};
pub use error::{NetError, PeerError};
pub use manager::{with_peer_manager, ManagerHandle, ManagerMessage, PeerManager};
pub use message::{
    Message, NetworkAddress, Version, NODE_NETWORK, NODE_WITNESS, PROTOCOL_VERSION,
};
pub use network::Network;
pub use peer::{Connector, Peer, PeerContext, PeerEvent, PeerMessage};
pub use registry::{OnlinePeer, PeerRegistry};
pub use resolver::{resolve, to_host_service};
pub use supervisor::TaskHandle;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result type for peer-manager operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Configuration for the peer manager.
///
/// Most fields have sensible defaults from [`PeerManagerConfig::new`]; the
/// connector and the two publishers must always be supplied.
pub struct PeerManagerConfig {
    /// Target number of concurrent online peers.
    pub max_peers: usize,

    /// Statically configured peers as `host:port` strings, resolved at
    /// startup.
    pub static_peers: Vec<String>,

    /// Whether to use DNS seeds and `addr` gossip to find peers.
    ///
    /// When disabled, only `static_peers` are dialed and gossip is ignored.
    pub discover: bool,

    /// Our own address and service bits, sent as `addr_send` in outbound
    /// `version` messages.
    pub local_address: NetworkAddress,

    /// The network being joined (magic, seeds, default port, user agent).
    pub network: Network,

    /// Idle threshold before a peer is pinged; also the base period of the
    /// per-peer liveness ticker.
    pub timeout: Duration,

    /// Upper bound on a single connection's lifetime. Each connection gets
    /// a budget jittered uniformly into `[0.75, 1.0]` of this value.
    pub max_life: Duration,

    /// Factory producing the per-peer connection task.
    pub connector: Arc<dyn Connector>,

    /// Publisher of peer connection events.
    pub events: mpsc::UnboundedSender<PeerEvent>,

    /// Publisher of protocol messages the manager does not consume itself.
    pub messages: mpsc::UnboundedSender<(Peer, Message)>,
}

impl PeerManagerConfig {
    /// Creates a configuration with defaults: 20 peers, discovery on, a
    /// two-minute idle timeout, and a 48-hour connection lifetime.
    pub fn new(
        network: Network,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<PeerEvent>,
        messages: mpsc::UnboundedSender<(Peer, Message)>,
    ) -> Self {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), network.default_port);
        Self {
            max_peers: 20,
            static_peers: Vec::new(),
            discover: true,
            local_address: NetworkAddress::new(0, local),
            network,
            timeout: Duration::from_secs(120),
            max_life: Duration::from_secs(48 * 3600),
            connector,
            events,
            messages,
        }
    }
}
