//! End-to-end scenarios for the peer-manager actor.
//!
//! All tests run on paused test time with a mock connector that records
//! what the manager sends to each peer, so handshake, liveness, and
//! rotation behavior can be asserted deterministically.

use kestrel_net::{
    network, Connector, ManagerHandle, Message, Network, NetworkAddress, OnlinePeer, Peer,
    PeerContext, PeerError, PeerEvent, PeerManager, PeerManagerConfig, PeerMessage, Version,
    NODE_NETWORK,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Records everything the manager delivers to peer mailboxes.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(SocketAddr, Message)>>,
    kills: Mutex<Vec<(SocketAddr, PeerError)>>,
}

impl Recorder {
    fn sent_to(&self, addr: SocketAddr) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn versions_to(&self, addr: SocketAddr) -> Vec<Version> {
        self.sent_to(addr)
            .into_iter()
            .filter_map(|m| match m {
                Message::Version(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    fn pings_to(&self, addr: SocketAddr) -> Vec<u64> {
        self.sent_to(addr)
            .into_iter()
            .filter_map(|m| match m {
                Message::Ping(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn kills_for(&self, addr: SocketAddr) -> Vec<PeerError> {
        self.kills
            .lock()
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, e)| *e)
            .collect()
    }
}

/// Connector that never touches the network: it records sends and turns
/// kills into task errors, like a real I/O loop would.
struct MockConnector {
    recorder: Arc<Recorder>,
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn run(&self, mut ctx: PeerContext) -> kestrel_net::Result<()> {
        while let Some(msg) = ctx.mailbox.recv().await {
            match msg {
                PeerMessage::Send(m) => self.recorder.sent.lock().push((ctx.address, m)),
                PeerMessage::Kill(e) => {
                    self.recorder.kills.lock().push((ctx.address, e));
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

fn test_network() -> Network {
    Network {
        name: "mocknet",
        seeds: &[],
        ..network::BTC_TEST
    }
}

struct Harness {
    manager: Option<PeerManager>,
    handle: ManagerHandle,
    recorder: Arc<Recorder>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    messages: mpsc::UnboundedReceiver<(Peer, Message)>,
}

impl Harness {
    fn start_without_best(configure: impl FnOnce(&mut PeerManagerConfig)) -> Self {
        let recorder = Arc::new(Recorder::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let mut config = PeerManagerConfig::new(
            test_network(),
            Arc::new(MockConnector {
                recorder: Arc::clone(&recorder),
            }),
            events_tx,
            messages_tx,
        );
        config.discover = false;
        config.max_peers = 4;
        config.max_life = Duration::from_secs(1_000_000);
        config.timeout = Duration::from_secs(3600);
        configure(&mut config);

        let manager = PeerManager::start(config);
        let handle = manager.handle();
        Harness {
            manager: Some(manager),
            handle,
            recorder,
            events,
            messages,
        }
    }

    fn start(configure: impl FnOnce(&mut PeerManagerConfig)) -> Self {
        let harness = Self::start_without_best(configure);
        harness.handle.best(100).unwrap();
        harness
    }

    /// Dials `addr` through the actor and returns the registered record.
    async fn dial(&self, addr: SocketAddr) -> OnlinePeer {
        self.handle.connect(addr).unwrap();
        settle().await;
        self.handle
            .online_peers()
            .into_iter()
            .find(|op| op.address == addr)
            .expect("peer not registered")
    }

    /// Completes the handshake for a dialed peer.
    async fn complete_handshake(&self, op: &OnlinePeer) {
        self.handle
            .version(&op.peer, remote_version(op.address, 0xAA))
            .unwrap();
        self.handle.ver_ack(&op.peer).unwrap();
        settle().await;
    }

    fn drain_events(&mut self) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn shutdown(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.shutdown().await;
        }
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn remote_version(from: SocketAddr, nonce: u64) -> Version {
    Version {
        version: 70015,
        services: NODE_NETWORK,
        timestamp: 0,
        addr_recv: NetworkAddress::new(0, addr("0.0.0.0:0")),
        addr_send: NetworkAddress::new(NODE_NETWORK, from),
        nonce,
        user_agent: "/Satoshi:25.0.0/".to_string(),
        start_height: 0,
        relay: true,
    }
}

/// Lets every ready task run without advancing the clock.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Advances test time in steps until `done` holds.
async fn advance_until(step: Duration, max_steps: usize, mut done: impl FnMut() -> bool) {
    for _ in 0..max_steps {
        if done() {
            return;
        }
        tokio::time::advance(step).await;
        settle().await;
    }
    assert!(done(), "condition not reached in {} steps", max_steps);
}

#[tokio::test(start_paused = true)]
async fn test_connect_registers_peer_and_sends_version() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    assert!(!op.connected);
    assert!(harness.handle.get_peers().is_empty());

    let versions = harness.recorder.versions_to(remote);
    assert_eq!(versions.len(), 1);
    let version = &versions[0];
    assert_eq!(version.version, 70012);
    assert_eq!(version.start_height, 100);
    assert_eq!(version.addr_recv.address, remote);
    assert_eq!(version.nonce, op.nonce);
    assert!(version.relay);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_handshake_version_first() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    harness
        .handle
        .version(&op.peer, remote_version(remote, 0xAA))
        .unwrap();
    settle().await;

    assert!(harness
        .recorder
        .sent_to(remote)
        .contains(&Message::VerAck));
    assert!(harness.drain_events().is_empty());
    assert!(harness.handle.get_peers().is_empty());

    harness.handle.ver_ack(&op.peer).unwrap();
    settle().await;

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], PeerEvent::Connected(p) if *p == op.peer));
    assert_eq!(harness.handle.get_peers().len(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_handshake_verack_first() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    harness.handle.ver_ack(&op.peer).unwrap();
    settle().await;
    assert!(harness.drain_events().is_empty());

    harness
        .handle
        .version(&op.peer, remote_version(remote, 0xAA))
        .unwrap();
    settle().await;

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], PeerEvent::Connected(p) if *p == op.peer));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_getaddr_solicited_when_discovery_enabled() {
    let mut harness = Harness::start(|config| config.discover = true);
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;
    harness.complete_handshake(&op).await;

    assert!(harness
        .recorder
        .sent_to(remote)
        .contains(&Message::GetAddr));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_self_connect_is_rejected() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    // Remote echoes the nonce we sent in our own version.
    harness
        .handle
        .version(&op.peer, remote_version(remote, op.nonce))
        .unwrap();
    settle().await;

    assert_eq!(
        harness.recorder.kills_for(remote),
        vec![PeerError::PeerIsMyself]
    );
    assert!(harness.handle.online_peers().is_empty());
    assert!(harness.drain_events().is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_without_network_service_is_rejected() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    let mut version = remote_version(remote, 0xAA);
    version.services = 0;
    harness.handle.version(&op.peer, version).unwrap();
    settle().await;

    assert_eq!(
        harness.recorder.kills_for(remote),
        vec![PeerError::NotNetworkPeer]
    );
    assert!(harness.handle.online_peers().is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_message_from_retired_peer_is_harmless() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    harness
        .handle
        .version(&op.peer, remote_version(remote, op.nonce))
        .unwrap();
    settle().await;
    assert!(harness.handle.online_peers().is_empty());

    // The registry no longer knows this mailbox; nothing should happen.
    harness.handle.ver_ack(&op.peer).unwrap();
    harness.handle.tickle(&op.peer).unwrap();
    settle().await;
    assert!(harness.handle.online_peers().is_empty());
    assert!(harness.drain_events().is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_inbound_ping_gets_pong() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    harness.handle.ping(&op.peer, 77).unwrap();
    settle().await;

    assert!(harness
        .recorder
        .sent_to(remote)
        .contains(&Message::Pong(77)));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_peer_is_pinged_and_pong_records_rtt() {
    let mut harness = Harness::start(|config| config.timeout = Duration::from_secs(1));
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    // The liveness ticker pings once the peer has been silent past the
    // timeout.
    let recorder = Arc::clone(&harness.recorder);
    advance_until(Duration::from_millis(500), 20, || {
        !recorder.pings_to(remote).is_empty()
    })
    .await;
    let nonce = harness.recorder.pings_to(remote)[0];

    // A pong with the wrong nonce is ignored.
    harness.handle.pong(&op.peer, nonce.wrapping_add(1)).unwrap();
    settle().await;
    let entry = harness.handle.get_online_peer(&op.peer).unwrap();
    assert!(entry.pings.is_empty());
    assert!(entry.outstanding_ping.is_some());

    // The matching pong clears the outstanding ping and records a sample.
    harness.handle.pong(&op.peer, nonce).unwrap();
    settle().await;
    let entry = harness.handle.get_online_peer(&op.peer).unwrap();
    assert_eq!(entry.pings.len(), 1);
    assert!(entry.outstanding_ping.is_none());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ping_kills_peer() {
    let mut harness = Harness::start(|config| config.timeout = Duration::from_secs(1));
    let remote = addr("10.0.0.1:18333");
    harness.dial(remote).await;

    let recorder = Arc::clone(&harness.recorder);
    advance_until(Duration::from_millis(500), 40, || {
        !recorder.kills_for(remote).is_empty()
    })
    .await;

    assert_eq!(
        harness.recorder.kills_for(remote),
        vec![PeerError::PeerTimeout]
    );
    assert!(!harness.recorder.pings_to(remote).is_empty());
    assert!(harness.handle.online_peers().is_empty());
    // Never announced, so no disconnect event either.
    assert!(harness.drain_events().is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lifetime_expiry_kills_peer() {
    let mut harness = Harness::start(|config| {
        config.max_life = Duration::from_secs(10);
        config.timeout = Duration::from_secs(3600);
    });
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    // Past the full lifetime budget even before jitter.
    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    harness.handle.check(&op.peer).unwrap();
    settle().await;

    assert_eq!(
        harness.recorder.kills_for(remote),
        vec![PeerError::PeerTooOld]
    );
    assert!(harness.handle.online_peers().is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_peer_skips_liveness_checks() {
    let mut harness = Harness::start(|config| {
        config.max_life = Duration::from_secs(10);
        config.timeout = Duration::from_secs(3600);
    });
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    op.busy.store(true, std::sync::atomic::Ordering::Release);
    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;
    harness.handle.check(&op.peer).unwrap();
    settle().await;
    assert!(harness.recorder.kills_for(remote).is_empty());

    op.busy.store(false, std::sync::atomic::Ordering::Release);
    harness.handle.check(&op.peer).unwrap();
    settle().await;
    assert_eq!(
        harness.recorder.kills_for(remote),
        vec![PeerError::PeerTooOld]
    );

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_tickle_resets_idle_accounting() {
    let mut harness = Harness::start(|config| config.timeout = Duration::from_secs(3600));
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    tokio::time::advance(Duration::from_secs(3500)).await;
    settle().await;
    harness.handle.tickle(&op.peer).unwrap();
    harness.handle.check(&op.peer).unwrap();
    settle().await;

    assert!(harness.recorder.pings_to(remote).is_empty());
    assert!(harness.handle.get_online_peer(&op.peer).is_some());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_addr_gossip_feeds_the_connect_loop() {
    let mut harness = Harness::start(|config| config.discover = true);
    let first = addr("10.0.0.1:18333");
    let gossiped = addr("10.0.0.2:18333");
    let op = harness.dial(first).await;
    harness.complete_handshake(&op).await;

    harness
        .handle
        .addrs(
            &op.peer,
            vec![
                NetworkAddress::new(NODE_NETWORK, gossiped),
                // Already online; must not be re-dialed.
                NetworkAddress::new(NODE_NETWORK, first),
            ],
        )
        .unwrap();
    settle().await;

    let recorder = Arc::clone(&harness.recorder);
    advance_until(Duration::from_secs(5), 10, || {
        !recorder.versions_to(gossiped).is_empty()
    })
    .await;

    assert_eq!(harness.recorder.versions_to(first).len(), 1);
    assert_eq!(harness.handle.online_peers().len(), 2);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_gossip_from_unconnected_peer_is_ignored() {
    let mut harness = Harness::start(|config| config.discover = true);
    let remote = addr("10.0.0.1:18333");
    let gossiped = addr("10.0.0.2:18333");
    // Dialed, but the handshake never completes.
    let op = harness.dial(remote).await;

    harness
        .handle
        .addrs(&op.peer, vec![NetworkAddress::new(NODE_NETWORK, gossiped)])
        .unwrap();
    settle().await;

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
    }
    assert!(harness.recorder.versions_to(gossiped).is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_gossip_ignored_when_discovery_disabled() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let gossiped = addr("10.0.0.2:18333");
    let op = harness.dial(remote).await;

    harness
        .handle
        .addrs(&op.peer, vec![NetworkAddress::new(NODE_NETWORK, gossiped)])
        .unwrap();
    settle().await;

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
    }
    assert!(harness.recorder.versions_to(gossiped).is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_loop_respects_max_peers() {
    let mut harness = Harness::start(|config| {
        config.max_peers = 1;
        config.static_peers = vec!["127.0.0.1:19001".to_string(), "127.0.0.1:19002".to_string()];
    });

    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
    }

    assert_eq!(harness.handle.online_peers().len(), 1);
    assert_eq!(harness.recorder.sent.lock().len(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_connect_is_dropped() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    harness.dial(remote).await;
    harness.handle.connect(remote).unwrap();
    settle().await;

    assert_eq!(harness.handle.online_peers().len(), 1);
    assert_eq!(harness.recorder.versions_to(remote).len(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_event_fires_only_for_connected_peers() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;
    harness.complete_handshake(&op).await;
    assert_eq!(harness.drain_events().len(), 1);

    // A later self-connect version kills the now-connected peer.
    harness
        .handle
        .version(&op.peer, remote_version(remote, op.nonce))
        .unwrap();
    settle().await;

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], PeerEvent::Disconnected(p) if *p == op.peer));
    assert!(harness.handle.online_peers().is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unconsumed_messages_are_relayed_upstream() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;

    let raw = Message::Raw {
        command: "headers".to_string(),
        payload: vec![1, 2, 3],
    };
    harness.handle.incoming(&op.peer, raw.clone()).unwrap();
    settle().await;

    let (from, relayed) = harness.messages.try_recv().unwrap();
    assert_eq!(from, op.peer);
    assert_eq!(relayed, raw);

    // Handshake messages are consumed, not relayed.
    harness
        .handle
        .incoming(&op.peer, Message::Version(remote_version(remote, 0xAA)))
        .unwrap();
    settle().await;
    assert!(harness.messages.try_recv().is_err());
    assert!(harness.recorder.sent_to(remote).contains(&Message::VerAck));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_nothing_happens_before_best_block() {
    let mut harness = Harness::start_without_best(|_| {});
    let remote = addr("10.0.0.1:18333");

    harness.handle.connect(remote).unwrap();
    settle().await;
    assert!(harness.handle.online_peers().is_empty());

    harness.handle.best(42).unwrap();
    settle().await;
    assert_eq!(harness.handle.online_peers().len(), 1);
    assert_eq!(harness.recorder.versions_to(remote)[0].start_height, 42);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_connected_peers() {
    let mut harness = Harness::start(|_| {});
    let remote = addr("10.0.0.1:18333");
    let op = harness.dial(remote).await;
    harness.complete_handshake(&op).await;
    assert_eq!(harness.drain_events().len(), 1);

    harness.shutdown().await;

    let events = harness.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], PeerEvent::Disconnected(p) if *p == op.peer));
    assert!(harness.handle.online_peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_entry_points_fail_after_shutdown() {
    let mut harness = Harness::start(|_| {});
    harness.shutdown().await;

    assert!(matches!(
        harness.handle.best(1),
        Err(kestrel_net::NetError::ManagerClosed)
    ));
    assert!(matches!(
        harness.handle.connect(addr("10.0.0.1:18333")),
        Err(kestrel_net::NetError::ManagerClosed)
    ));
}
