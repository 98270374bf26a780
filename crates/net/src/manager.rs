//! The peer-manager actor.
//!
//! A single long-lived task owns all registry mutation. Every external
//! input - parsed messages from peer tasks, dial requests from the connect
//! loop, liveness ticks, death notifications from the supervisor - arrives
//! as a [`ManagerMessage`] on one mailbox and is processed strictly
//! serially, so per-peer state transitions are linearizable without any
//! lock being held across a suspension point.
//!
//! # Architecture
//!
//! The manager runs these tasks:
//!
//! 1. **Actor task**: consumes the mailbox and dispatches to the handshake,
//!    liveness, and discovery handlers
//! 2. **Connect loop**: keeps the online count at the configured target by
//!    sampling the known-address pool and requesting dials
//! 3. **Peer tasks**: one per connection, produced by the configured
//!    [`Connector`], supervised so their deaths reach the actor
//! 4. **Liveness tickers**: one per peer, requesting a `CheckPeer` at
//!    jittered intervals derived from the idle timeout
//!
//! # Handshake
//!
//! We send our `version` at launch; the remote answers with its `version`
//! and a `verack`, in either order. A peer is announced (`PeerConnected`)
//! exactly once, on the edge where both have arrived. Peers that fail the
//! service-bit check, echo one of our own nonces, or message us without
//! being registered are killed with the corresponding [`PeerError`].

use crate::discovery::{discover, KnownAddresses};
use crate::error::{NetError, PeerError};
use crate::message::{Message, NetworkAddress, Version, NODE_NETWORK, NODE_WITNESS, PROTOCOL_VERSION};
use crate::peer::{Connector, Peer, PeerContext, PeerEvent};
use crate::registry::{OnlinePeer, PeerRegistry};
use crate::supervisor::{Supervisor, TaskHandle};
use crate::{PeerManagerConfig, Result};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Messages accepted by the manager's mailbox.
#[derive(Debug)]
pub enum ManagerMessage {
    /// Set the best-block height advertised in outbound `version`s.
    Best(u32),
    /// Dial a new peer at this endpoint.
    Connect(SocketAddr),
    /// A peer sent its `version`.
    PeerVersion(Peer, Version),
    /// A peer acknowledged our `version`.
    PeerVerAck(Peer),
    /// A peer probed us; answer with a `pong`.
    PeerPing(Peer, u64),
    /// A peer answered one of our probes.
    PeerPong(Peer, u64),
    /// A peer gossiped addresses.
    PeerAddrs(Peer, Vec<NetworkAddress>),
    /// A peer produced a protocol message the manager does not consume;
    /// forward it to upstream subscribers.
    PeerRelay(Peer, Message),
    /// A peer produced some protocol message; refresh its idle accounting.
    PeerTickle(Peer),
    /// Run the liveness check for this peer.
    CheckPeer(Peer),
    /// A supervised peer task ended.
    PeerDied(TaskHandle, Option<NetError>),
    /// Stop the actor once the mailbox backlog is processed; sent during
    /// shutdown after every child has reported in.
    Stop,
}

/// Cloneable handle to a running peer manager.
///
/// Entry points convert calls into mailbox messages; registry reads
/// (`get_peers`, `online_peers`) observe the shared registry directly and
/// atomically, without a round-trip through the actor.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerMessage>,
    registry: Arc<PeerRegistry>,
    closed: Arc<AtomicBool>,
}

impl ManagerHandle {
    fn send(&self, msg: ManagerMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::ManagerClosed);
        }
        self.tx.send(msg).map_err(|_| NetError::ManagerClosed)
    }

    /// Sets the best-block height. Must be sent once before the actor
    /// starts processing; later calls update the advertised height.
    pub fn best(&self, height: u32) -> Result<()> {
        self.send(ManagerMessage::Best(height))
    }

    /// Requests a dial to `address`.
    pub fn connect(&self, address: SocketAddr) -> Result<()> {
        self.send(ManagerMessage::Connect(address))
    }

    /// Injects a peer's `version`.
    pub fn version(&self, peer: &Peer, version: Version) -> Result<()> {
        self.send(ManagerMessage::PeerVersion(peer.clone(), version))
    }

    /// Injects a peer's `verack`.
    pub fn ver_ack(&self, peer: &Peer) -> Result<()> {
        self.send(ManagerMessage::PeerVerAck(peer.clone()))
    }

    /// Injects a peer's `ping`.
    pub fn ping(&self, peer: &Peer, nonce: u64) -> Result<()> {
        self.send(ManagerMessage::PeerPing(peer.clone(), nonce))
    }

    /// Injects a peer's `pong`.
    pub fn pong(&self, peer: &Peer, nonce: u64) -> Result<()> {
        self.send(ManagerMessage::PeerPong(peer.clone(), nonce))
    }

    /// Injects gossiped addresses from a peer.
    pub fn addrs(&self, peer: &Peer, addrs: Vec<NetworkAddress>) -> Result<()> {
        self.send(ManagerMessage::PeerAddrs(peer.clone(), addrs))
    }

    /// Refreshes a peer's idle accounting.
    pub fn tickle(&self, peer: &Peer) -> Result<()> {
        self.send(ManagerMessage::PeerTickle(peer.clone()))
    }

    /// Requests a liveness check for a peer.
    pub fn check(&self, peer: &Peer) -> Result<()> {
        self.send(ManagerMessage::CheckPeer(peer.clone()))
    }

    /// Routes an arbitrary parsed inbound message to the right mailbox
    /// variants. Every message counts as a tickle; the kinds the manager
    /// does not consume are relayed to upstream subscribers.
    pub fn incoming(&self, peer: &Peer, message: Message) -> Result<()> {
        self.tickle(peer)?;
        match message {
            Message::Version(v) => self.version(peer, v),
            Message::VerAck => self.ver_ack(peer),
            Message::Ping(nonce) => self.ping(peer, nonce),
            Message::Pong(nonce) => self.pong(peer, nonce),
            Message::Addr(addrs) => self.addrs(peer, addrs),
            other => self.send(ManagerMessage::PeerRelay(peer.clone(), other)),
        }
    }

    /// Returns the peers that have completed the handshake, ordered by
    /// median ping ascending.
    pub fn get_peers(&self) -> Vec<OnlinePeer> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|op| op.connected)
            .collect()
    }

    /// Returns every registered peer, dialing peers included.
    pub fn online_peers(&self) -> Vec<OnlinePeer> {
        self.registry.snapshot()
    }

    /// Looks up a single peer by mailbox identity.
    pub fn get_online_peer(&self, peer: &Peer) -> Option<OnlinePeer> {
        self.registry.find_by_peer(peer)
    }
}

/// The peer-connection manager.
///
/// Owns the actor task, the connect loop, and the supervisor for all peer
/// tasks. Dropping the manager without calling [`shutdown`](Self::shutdown)
/// leaves the background tasks running; use [`with_peer_manager`] for
/// scoped usage.
pub struct PeerManager {
    handle: ManagerHandle,
    actor: JoinHandle<()>,
    connect_loop: JoinHandle<()>,
    supervisor: Supervisor,
}

impl PeerManager {
    /// Starts the manager and its background tasks.
    ///
    /// The actor waits for an initial [`ManagerHandle::best`] before
    /// processing anything else; messages arriving earlier are held back
    /// and replayed in order.
    pub fn start(config: PeerManagerConfig) -> PeerManager {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerRegistry::new());
        let known = Arc::new(KnownAddresses::new());
        let closed = Arc::new(AtomicBool::new(false));
        let handle = ManagerHandle {
            tx: tx.clone(),
            registry: Arc::clone(&registry),
            closed,
        };
        let supervisor = Supervisor::new(tx);

        info!(
            "Starting peer manager on {} (max {} peers)",
            config.network, config.max_peers
        );

        let connect_loop = tokio::spawn(connect_loop(
            handle.clone(),
            Arc::clone(&known),
            config.network,
            config.static_peers.clone(),
            config.discover,
            config.max_peers,
        ));

        let actor = Actor {
            config,
            registry,
            known,
            supervisor: supervisor.clone(),
            handle: handle.clone(),
            best: 0,
        };
        let actor = tokio::spawn(actor.run(rx));

        PeerManager {
            handle,
            actor,
            connect_loop,
            supervisor,
        }
    }

    /// Returns a handle for injecting messages and observing peers.
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// Stops the connect loop, tears down every peer task, and stops the
    /// actor once their deaths have been processed. Entry points fail with
    /// [`NetError::ManagerClosed`] afterwards.
    pub async fn shutdown(self) {
        self.handle.closed.store(true, Ordering::Release);
        self.connect_loop.abort();
        // Every child reports in before the actor is told to stop, so
        // pending deaths are still dispatched and published.
        self.supervisor.shutdown().await;
        let _ = self.handle.tx.send(ManagerMessage::Stop);
        let _ = self.connect_loop.await;
        let _ = self.actor.await;
        info!("Peer manager stopped");
    }
}

/// Runs `f` against a freshly started manager and shuts it down when the
/// returned future completes.
pub async fn with_peer_manager<F, Fut, T>(config: PeerManagerConfig, f: F) -> T
where
    F: FnOnce(ManagerHandle) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let manager = PeerManager::start(config);
    let out = f(manager.handle()).await;
    manager.shutdown().await;
    out
}

/// State owned by the actor task.
struct Actor {
    config: PeerManagerConfig,
    registry: Arc<PeerRegistry>,
    known: Arc<KnownAddresses>,
    supervisor: Supervisor,
    handle: ManagerHandle,
    best: u32,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerMessage>) {
        // Hold everything back until the caller has set the best block;
        // the stashed messages are replayed in arrival order.
        let mut stash = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                ManagerMessage::Best(height) => {
                    debug!("Best block at start: {}", height);
                    self.best = height;
                    break;
                }
                ManagerMessage::Stop => return,
                other => stash.push(other),
            }
        }
        for msg in stash {
            if !self.dispatch(msg) {
                return;
            }
        }

        while let Some(msg) = rx.recv().await {
            if !self.dispatch(msg) {
                break;
            }
        }
        debug!("Peer manager mailbox closed");
    }

    /// Returns false once the actor should stop.
    fn dispatch(&mut self, msg: ManagerMessage) -> bool {
        match msg {
            ManagerMessage::Best(height) => {
                trace!("Best block now {}", height);
                self.best = height;
            }
            ManagerMessage::Connect(address) => self.handle_connect(address),
            ManagerMessage::PeerVersion(peer, version) => self.handle_version(peer, version),
            ManagerMessage::PeerVerAck(peer) => self.handle_ver_ack(peer),
            ManagerMessage::PeerPing(peer, nonce) => {
                trace!("Answering ping from peer {}", peer);
                peer.send(Message::Pong(nonce));
            }
            ManagerMessage::PeerPong(peer, nonce) => self.handle_pong(peer, nonce),
            ManagerMessage::PeerAddrs(peer, addrs) => self.handle_addrs(peer, addrs),
            ManagerMessage::PeerRelay(peer, message) => {
                let _ = self.config.messages.send((peer, message));
            }
            ManagerMessage::PeerTickle(peer) => {
                let now = Instant::now();
                self.registry.modify(&peer, |op| op.tickled_at = now);
            }
            ManagerMessage::CheckPeer(peer) => self.handle_check(peer),
            ManagerMessage::PeerDied(task, err) => self.handle_peer_died(task, err),
            ManagerMessage::Stop => return false,
        }
        true
    }

    /// Dials a new peer: allocates a mailbox, launches the connector under
    /// the supervisor, registers the record, and sends our `version`.
    fn handle_connect(&mut self, address: SocketAddr) {
        if self.registry.find_by_address(&address).is_some() {
            debug!("Already connected to {}", address);
            return;
        }

        let (peer, mailbox) = Peer::new(address);
        let nonce = rand::random::<u64>();
        let busy = Arc::new(AtomicBool::new(false));
        let now = Instant::now();
        let life = self
            .config
            .max_life
            .mul_f64(rand::thread_rng().gen_range(0.75..=1.0));

        let ctx = PeerContext {
            address,
            mailbox,
            manager: self.handle.clone(),
            busy: Arc::clone(&busy),
        };
        let connector = Arc::clone(&self.config.connector);
        let task = self.supervisor.spawn(async move { connector.run(ctx).await });

        let record = OnlinePeer::new(address, peer.clone(), task, nonce, busy, now, now + life);
        self.registry.insert(record);
        info!(
            "Connecting to peer {} ({} online)",
            address,
            self.registry.len()
        );

        peer.send(Message::Version(self.local_version(address, nonce)));
        self.spawn_ticker(peer);
    }

    /// Builds the `version` payload we advertise to a freshly dialed peer.
    fn local_version(&self, remote: SocketAddr, nonce: u64) -> Version {
        let recv_services = if self.config.network.segwit {
            NODE_WITNESS
        } else {
            0
        };
        Version {
            version: PROTOCOL_VERSION,
            services: self.config.local_address.services,
            timestamp: unix_now(),
            addr_recv: NetworkAddress::new(recv_services, remote),
            addr_send: self.config.local_address,
            nonce,
            user_agent: self.config.network.user_agent.to_string(),
            start_height: self.best,
            relay: true,
        }
    }

    /// Per-peer liveness ticker: requests a check at a random point in
    /// the last quarter of every idle window, until the peer dies.
    fn spawn_ticker(&self, peer: Peer) {
        let handle = self.handle.clone();
        let timeout = self.config.timeout;
        tokio::spawn(async move {
            loop {
                let wait = timeout.mul_f64(rand::thread_rng().gen_range(0.75..=1.0));
                tokio::time::sleep(wait).await;
                if peer.is_closed() || handle.check(&peer).is_err() {
                    break;
                }
            }
        });
    }

    fn handle_version(&mut self, peer: Peer, version: Version) {
        if version.services & NODE_NETWORK == 0 {
            self.kill_peer(PeerError::NotNetworkPeer, &peer);
            return;
        }
        if self.registry.nonce_in_use(version.nonce) {
            self.kill_peer(PeerError::PeerIsMyself, &peer);
            return;
        }

        let user_agent = version.user_agent.clone();
        let remote_version = version.version;
        let Some((before, after)) = self.registry.modify(&peer, |op| {
            op.version = Some(version);
            op.recompute_connected();
        }) else {
            self.kill_peer(PeerError::UnknownPeer, &peer);
            return;
        };

        debug!(
            "Peer {} is {} (protocol {})",
            peer, user_agent, remote_version
        );
        peer.send(Message::VerAck);

        if !before.connected && after.connected {
            self.announce(&peer, &after);
        }
    }

    fn handle_ver_ack(&mut self, peer: Peer) {
        let Some((before, after)) = self.registry.modify(&peer, |op| {
            op.verack_received = true;
            op.recompute_connected();
        }) else {
            self.kill_peer(PeerError::UnknownPeer, &peer);
            return;
        };

        if !before.connected && after.connected {
            self.announce(&peer, &after);
        }
    }

    /// Publishes `PeerConnected` on the handshake-completion edge and, if
    /// discovery is on, solicits address gossip from the new peer.
    fn announce(&self, peer: &Peer, record: &OnlinePeer) {
        info!(
            "Connected to peer {} ({} online)",
            record.address,
            self.registry.len()
        );
        let _ = self.config.events.send(PeerEvent::Connected(peer.clone()));
        if self.config.discover {
            peer.send(Message::GetAddr);
        }
    }

    fn handle_pong(&mut self, peer: Peer, nonce: u64) {
        let now = Instant::now();
        self.registry.modify(&peer, |op| match op.outstanding_ping {
            Some((sent_at, expected)) if expected == nonce => {
                op.record_ping(now.duration_since(sent_at));
                op.outstanding_ping = None;
            }
            _ => {
                trace!("Ignoring unmatched pong from peer {}", op.peer);
            }
        });
    }

    fn handle_addrs(&mut self, peer: Peer, addrs: Vec<NetworkAddress>) {
        if !self.config.discover {
            return;
        }
        // Only peers that completed the handshake may feed the pool.
        let connected = self
            .registry
            .find_by_peer(&peer)
            .map_or(false, |op| op.connected);
        if !connected {
            debug!("Ignoring addresses from unconnected peer {}", peer);
            return;
        }
        let total = addrs.len();
        let mut fresh = 0;
        for na in addrs {
            if self.registry.find_by_address(&na.address).is_none() && self.known.add(na.address) {
                fresh += 1;
            }
        }
        debug!(
            "Received {} addresses from peer {} ({} new)",
            total, peer, fresh
        );
    }

    /// Liveness check: retire peers past their lifetime, ping idle peers,
    /// and kill peers that left a ping unanswered for a full window.
    fn handle_check(&mut self, peer: Peer) {
        let Some(op) = self.registry.find_by_peer(&peer) else {
            return;
        };
        if op.busy.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        if now >= op.disconnect_at {
            self.kill_peer(PeerError::PeerTooOld, &peer);
            return;
        }

        if now.duration_since(op.tickled_at) > self.config.timeout {
            match op.outstanding_ping {
                None => {
                    let nonce = rand::random::<u64>();
                    self.registry
                        .modify(&peer, |op| op.outstanding_ping = Some((now, nonce)));
                    debug!("Pinging idle peer {}", peer);
                    peer.send(Message::Ping(nonce));
                }
                Some(_) => self.kill_peer(PeerError::PeerTimeout, &peer),
            }
        }
    }

    fn handle_peer_died(&mut self, task: TaskHandle, err: Option<NetError>) {
        let Some(op) = self.registry.find_by_task(&task) else {
            if let Some(e) = err {
                debug!("Unsupervised peer {} died: {}", task, e);
            }
            return;
        };

        self.registry.remove(&op.peer);
        match err {
            Some(e) => warn!(
                "Peer {} died: {} ({} online)",
                op.address,
                e,
                self.registry.len()
            ),
            None => info!(
                "Peer {} disconnected ({} online)",
                op.address,
                self.registry.len()
            ),
        }

        if op.connected {
            let _ = self
                .config
                .events
                .send(PeerEvent::Disconnected(op.peer.clone()));
        }
    }

    /// Terminates a peer with a diagnostic; the death notification and
    /// registry cleanup arrive through the supervisor.
    fn kill_peer(&self, err: PeerError, peer: &Peer) {
        warn!("Killing peer {}: {}", peer, err);
        peer.kill(err);
    }
}

/// Background task that keeps the online count at the configured target.
///
/// Each tick sleeps a random interval, then dials one address sampled from
/// the known pool, re-running discovery whenever the pool is dry. Sampled
/// addresses that are already online are dropped from the pool and the
/// sampling retried.
async fn connect_loop(
    handle: ManagerHandle,
    known: Arc<KnownAddresses>,
    network: crate::network::Network,
    static_peers: Vec<String>,
    use_discovery: bool,
    max_peers: usize,
) {
    loop {
        let wait = Duration::from_millis(rand::thread_rng().gen_range(100..=5000));
        tokio::time::sleep(wait).await;

        if handle.registry.len() >= max_peers {
            continue;
        }

        if known.is_empty() {
            let found = discover(&network, &static_peers, use_discovery).await;
            known.extend(
                found
                    .into_iter()
                    .filter(|addr| handle.registry.find_by_address(addr).is_none()),
            );
            if !known.is_empty() {
                debug!("Known pool refilled with {} addresses", known.len());
            }
        }

        let address = loop {
            match known.sample() {
                None => break None,
                Some(addr) if handle.registry.find_by_address(&addr).is_some() => continue,
                Some(addr) => break Some(addr),
            }
        };

        if let Some(address) = address {
            if handle.connect(address).is_err() {
                break;
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
