//! Online-peer registry.
//!
//! The registry is the single shared record of every peer the manager has
//! dialed, keyed three ways: by mailbox (the peer's identity), by task
//! handle (for death notifications), and by address (to prevent duplicate
//! dials). All operations take one short critical section; nothing is held
//! across an await point.
//!
//! # Invariants
//!
//! After every mutation the stored sequence is de-duplicated by mailbox and
//! sorted ascending by median ping, so any observation sees the best-latency
//! peers first. A peer with no recorded round-trips sorts as if its median
//! were 60 seconds.

use crate::peer::Peer;
use crate::supervisor::TaskHandle;
use crate::message::Version;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Median assumed for peers that have not completed a ping round-trip yet.
const DEFAULT_PING: Duration = Duration::from_secs(60);

/// How many round-trip samples are retained per peer.
const PING_SAMPLES: usize = 11;

/// Manager-side record for a live (or dialing) peer.
#[derive(Debug, Clone)]
pub struct OnlinePeer {
    /// Remote socket endpoint.
    pub address: SocketAddr,
    /// Mailbox handle; the peer's identity.
    pub peer: Peer,
    /// Supervised task running the connection.
    pub task: TaskHandle,
    /// Nonce we sent in our `version`; used to detect self-connects.
    pub nonce: u64,
    /// Held by the peer task during blocking initial I/O.
    pub busy: Arc<AtomicBool>,
    /// Whether the remote acknowledged our `version`.
    pub verack_received: bool,
    /// The remote's `version` payload, once received.
    pub version: Option<Version>,
    /// True iff `verack_received` and `version` is present.
    pub connected: bool,
    /// Round-trip samples, sorted ascending, at most 11 retained.
    pub pings: Vec<Duration>,
    /// The single in-flight ping, if any: when it was sent and its nonce.
    pub outstanding_ping: Option<(Instant, u64)>,
    /// When the task was launched.
    pub connect_time: Instant,
    /// Last moment the peer produced any protocol message.
    pub tickled_at: Instant,
    /// Scheduled forced-retirement moment.
    pub disconnect_at: Instant,
}

impl OnlinePeer {
    /// Creates a fresh record for a peer launched at `now`.
    pub(crate) fn new(
        address: SocketAddr,
        peer: Peer,
        task: TaskHandle,
        nonce: u64,
        busy: Arc<AtomicBool>,
        now: Instant,
        disconnect_at: Instant,
    ) -> Self {
        Self {
            address,
            peer,
            task,
            nonce,
            busy,
            verack_received: false,
            version: None,
            connected: false,
            pings: Vec::new(),
            outstanding_ping: None,
            connect_time: now,
            tickled_at: now,
            disconnect_at,
        }
    }

    /// Median of the recorded round-trips, or 60 seconds when none exist.
    pub fn median_ping(&self) -> Duration {
        if self.pings.is_empty() {
            DEFAULT_PING
        } else {
            self.pings[self.pings.len() / 2]
        }
    }

    /// Records a new round-trip sample, trimming to the cap and keeping
    /// the list sorted for the median.
    pub(crate) fn record_ping(&mut self, rtt: Duration) {
        self.pings.insert(0, rtt);
        self.pings.truncate(PING_SAMPLES);
        self.pings.sort();
    }

    /// Recomputes the derived `connected` flag.
    pub(crate) fn recompute_connected(&mut self) {
        self.connected = self.verack_received && self.version.is_some();
    }
}

/// Transactional container of [`OnlinePeer`] records.
///
/// All operations are atomic with respect to each other; readers always
/// observe the sorted, de-duplicated view.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<Vec<OnlinePeer>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a peer by mailbox identity.
    pub fn find_by_peer(&self, peer: &Peer) -> Option<OnlinePeer> {
        self.peers.lock().iter().find(|op| op.peer == *peer).cloned()
    }

    /// Looks up a peer by its supervised task handle.
    pub fn find_by_task(&self, task: &TaskHandle) -> Option<OnlinePeer> {
        self.peers.lock().iter().find(|op| op.task == *task).cloned()
    }

    /// Looks up a peer by remote address.
    pub fn find_by_address(&self, address: &SocketAddr) -> Option<OnlinePeer> {
        self.peers
            .lock()
            .iter()
            .find(|op| op.address == *address)
            .cloned()
    }

    /// Returns true if any record carries this version nonce.
    pub fn nonce_in_use(&self, nonce: u64) -> bool {
        self.peers.lock().iter().any(|op| op.nonce == nonce)
    }

    /// Inserts a record, replacing any existing entry with the same mailbox.
    pub fn insert(&self, op: OnlinePeer) {
        let mut peers = self.peers.lock();
        peers.retain(|existing| existing.peer != op.peer);
        peers.push(op);
        Self::normalize(&mut peers);
    }

    /// Applies `f` to the record with this mailbox, if present, and
    /// restores the view invariants.
    ///
    /// Returns clones of the record before and after the change so callers
    /// can detect edges (e.g. the handshake completing) atomically.
    pub fn modify<F>(&self, peer: &Peer, f: F) -> Option<(OnlinePeer, OnlinePeer)>
    where
        F: FnOnce(&mut OnlinePeer),
    {
        let mut peers = self.peers.lock();
        let idx = peers.iter().position(|op| op.peer == *peer)?;
        let before = peers[idx].clone();
        f(&mut peers[idx]);
        let after = peers[idx].clone();
        Self::normalize(&mut peers);
        Some((before, after))
    }

    /// Removes every record with this mailbox, returning the first one.
    pub fn remove(&self, peer: &Peer) -> Option<OnlinePeer> {
        let mut peers = self.peers.lock();
        let idx = peers.iter().position(|op| op.peer == *peer)?;
        let removed = peers.remove(idx);
        peers.retain(|op| op.peer != *peer);
        Some(removed)
    }

    /// Number of records, dialing peers included.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Returns true if no peers are online.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Clones the current view, sorted by median ping.
    pub fn snapshot(&self) -> Vec<OnlinePeer> {
        self.peers.lock().clone()
    }

    fn normalize(peers: &mut Vec<OnlinePeer>) {
        let mut seen = HashSet::new();
        peers.retain(|op| seen.insert(op.peer.id()));
        peers.sort_by_key(OnlinePeer::median_ping);
    }
}
