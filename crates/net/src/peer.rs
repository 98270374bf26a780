//! Peer handles and the connector seam.
//!
//! The manager never touches sockets. Each peer is represented by a
//! [`Peer`] handle - a mailbox the manager writes protocol messages into -
//! while the actual I/O loop runs in a task produced by a [`Connector`]
//! implementation. The connector reads the mailbox, writes to the wire,
//! and injects parsed inbound messages back into the manager through the
//! [`ManagerHandle`] it receives in its [`PeerContext`].
//!
//! The `Peer` handle doubles as the peer's identity: two handles compare
//! equal iff they refer to the same mailbox, regardless of address reuse
//! across reconnects.
//!
//! [`ManagerHandle`]: crate::ManagerHandle

use crate::error::PeerError;
use crate::message::Message;
use crate::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// A message delivered to a peer task's mailbox.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Write this protocol message to the remote.
    Send(Message),
    /// Terminate the connection with the given diagnostic.
    ///
    /// The task is expected to return the error from its run loop so the
    /// supervisor can report it in the death notification.
    Kill(PeerError),
}

/// Handle to a live peer task.
///
/// Cloneable, cheap, and usable as a key: equality, ordering and hashing
/// are all on the mailbox identity, never on the address.
#[derive(Debug, Clone)]
pub struct Peer {
    id: u64,
    address: SocketAddr,
    tx: mpsc::UnboundedSender<PeerMessage>,
}

impl Peer {
    /// Allocates a fresh mailbox for a peer at `address`.
    ///
    /// Returns the handle and the receiving end that is moved into the
    /// peer task's [`PeerContext`].
    pub(crate) fn new(address: SocketAddr) -> (Self, mpsc::UnboundedReceiver<PeerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            address,
            tx,
        };
        (peer, rx)
    }

    /// The mailbox identity of this peer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The remote socket endpoint this peer was dialed at.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Sends a protocol message to the peer task, fire-and-forget.
    ///
    /// Returns `false` if the task is gone; the caller never blocks on a
    /// peer and death is handled through the supervisor, so a failed send
    /// is not an error.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(PeerMessage::Send(message)).is_ok()
    }

    /// Tells the peer task to terminate with a diagnostic.
    pub(crate) fn kill(&self, err: PeerError) {
        let _ = self.tx.send(PeerMessage::Kill(err));
    }

    /// Returns true if the peer task has dropped its mailbox.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Peer connection events emitted by the manager.
///
/// `Connected` fires at most once per peer, on the edge where the
/// handshake completes; `Disconnected` fires only for peers that were
/// previously announced as connected.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The handshake completed; the peer is usable.
    Connected(Peer),
    /// A previously connected peer's task died.
    Disconnected(Peer),
}

/// Everything a peer task needs to run.
///
/// Handed to [`Connector::run`] when the manager launches the task.
pub struct PeerContext {
    /// Remote endpoint to dial.
    pub address: SocketAddr,
    /// Mailbox of messages from the manager (sends and kills).
    pub mailbox: mpsc::UnboundedReceiver<PeerMessage>,
    /// Handle for injecting parsed inbound messages into the manager.
    pub manager: crate::ManagerHandle,
    /// Set by the peer task while it performs blocking initial I/O;
    /// liveness checks are skipped while it is held.
    pub busy: Arc<AtomicBool>,
}

/// Factory for outbound peer connections.
///
/// Implementations own the socket, the wire codec, and the per-peer read
/// loop: dial `ctx.address`, write every `PeerMessage::Send`, and feed
/// parsed inbound messages to `ctx.manager.incoming`. On
/// `PeerMessage::Kill(e)` the implementation must return `Err(e.into())`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Runs the peer connection to completion.
    async fn run(&self, ctx: PeerContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_identity_is_the_mailbox() {
        let addr: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        let (a, _rx_a) = Peer::new(addr);
        let (b, _rx_b) = Peer::new(addr);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_send_after_mailbox_dropped() {
        let addr: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        let (peer, rx) = Peer::new(addr);
        assert!(!peer.is_closed());
        drop(rx);
        assert!(peer.is_closed());
        assert!(!peer.send(Message::VerAck));
    }
}
