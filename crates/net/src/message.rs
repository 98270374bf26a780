//! Protocol data model as seen by the peer manager.
//!
//! The wire codec (framing, checksums, consensus encoding) lives in the
//! per-peer I/O layer behind the [`Connector`] seam. The manager only deals
//! with parsed payloads: the handshake pair (`version`/`verack`), liveness
//! probes (`ping`/`pong`), and address gossip (`getaddr`/`addr`). Everything
//! else travels through [`Message::Raw`] untouched.
//!
//! [`Connector`]: crate::Connector

use std::net::SocketAddr;

/// Protocol version advertised in our outbound `version` message.
pub const PROTOCOL_VERSION: u32 = 70012;

/// Service bit for nodes that can serve the full block chain.
pub const NODE_NETWORK: u64 = 1;

/// Service bit for nodes that support segregated witness.
pub const NODE_WITNESS: u64 = 1 << 3;

/// A network-visible endpoint together with its advertised service bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    /// Service bits advertised for this endpoint.
    pub services: u64,
    /// The socket endpoint (IPv4 or IPv6 plus port).
    pub address: SocketAddr,
}

impl NetworkAddress {
    /// Creates a network address from service bits and a socket endpoint.
    pub fn new(services: u64, address: SocketAddr) -> Self {
        Self { services, address }
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Payload of the `version` message exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Highest protocol version the sender speaks.
    pub version: u32,
    /// Service bits of the sender.
    pub services: u64,
    /// Unix timestamp at the sender.
    pub timestamp: u64,
    /// Address the sender believes it is talking to.
    pub addr_recv: NetworkAddress,
    /// Address of the sender.
    pub addr_send: NetworkAddress,
    /// Random value used to detect connections to ourselves.
    pub nonce: u64,
    /// Sender's user agent string.
    pub user_agent: String,
    /// Height of the sender's best block.
    pub start_height: u32,
    /// Whether the sender wants transactions relayed to it.
    pub relay: bool,
}

/// A parsed protocol message.
///
/// Only the kinds the manager produces or consumes are modeled; any other
/// traffic is carried opaquely in [`Message::Raw`] and forwarded to upstream
/// subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake `version` announcement.
    Version(Version),
    /// Handshake `verack` acknowledgement.
    VerAck,
    /// Liveness probe with a random nonce.
    Ping(u64),
    /// Reply to a `ping`, echoing its nonce.
    Pong(u64),
    /// Request for known peer addresses.
    GetAddr,
    /// Gossiped peer addresses.
    Addr(Vec<NetworkAddress>),
    /// Any other protocol message, with its raw payload.
    Raw {
        /// Wire command name (e.g. `"headers"`).
        command: String,
        /// Undecoded payload bytes.
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the wire command name for this message.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Raw { command, .. } => command,
        }
    }
}
