//! Peer discovery and the known-address pool.
//!
//! Addresses come from three places: the statically configured peers, the
//! network's DNS seeds (when discovery is enabled), and `addr` gossip from
//! connected peers. They all land in a [`KnownAddresses`] pool that the
//! connect loop samples from; an address leaves the pool when it is picked
//! for a dial attempt.

use crate::network::Network;
use crate::resolver::resolve;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::debug;

/// Pool of endpoints available for future dials. Duplicate-free.
#[derive(Debug, Default)]
pub struct KnownAddresses {
    addrs: Mutex<HashSet<SocketAddr>>,
}

impl KnownAddresses {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one address; returns false if it was already known.
    pub fn add(&self, addr: SocketAddr) -> bool {
        self.addrs.lock().insert(addr)
    }

    /// Adds every address from `iter`.
    pub fn extend<I: IntoIterator<Item = SocketAddr>>(&self, iter: I) {
        self.addrs.lock().extend(iter);
    }

    /// Removes and returns a uniformly random address, if any.
    pub fn sample(&self) -> Option<SocketAddr> {
        let mut addrs = self.addrs.lock();
        if addrs.is_empty() {
            return None;
        }
        let nth = rand::thread_rng().gen_range(0..addrs.len());
        let picked = *addrs.iter().nth(nth)?;
        addrs.remove(&picked);
        Some(picked)
    }

    /// Number of addresses currently in the pool.
    pub fn len(&self) -> usize {
        self.addrs.lock().len()
    }

    /// Returns true if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.addrs.lock().is_empty()
    }
}

/// Resolves the configured static peers, plus the network's DNS seeds when
/// `use_seeds` is set, into a flat endpoint list.
///
/// Hosts that fail to resolve contribute nothing; discovery never fails.
pub async fn discover(
    network: &Network,
    static_peers: &[String],
    use_seeds: bool,
) -> Vec<SocketAddr> {
    let mut endpoints = Vec::new();
    for peer in static_peers {
        endpoints.extend(resolve(network, peer).await);
    }
    if use_seeds {
        for seed in network.seeds {
            let found = resolve(network, seed).await;
            if !found.is_empty() {
                debug!("Seed {} yielded {} endpoints", seed, found.len());
            }
            endpoints.extend(found);
        }
    }
    endpoints
}
