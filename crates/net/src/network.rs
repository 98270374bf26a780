//! Network descriptors.
//!
//! A [`Network`] bundles the constants that distinguish one bitcoin-family
//! chain from another: magic bytes, the well-known port, the DNS seed hosts
//! used for discovery, the user agent we advertise, and whether the chain
//! deploys segregated witness.
//!
//! # Standard Networks
//!
//! | Network | Magic | Port |
//! |---------|-------|------|
//! | Mainnet | `0xf9beb4d9` | 8333 |
//! | Testnet3 | `0x0b110907` | 18333 |

/// Static description of a bitcoin-family network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    /// Short network name, used in logs.
    pub name: &'static str,
    /// Message-envelope magic bytes.
    pub magic: u32,
    /// Well-known port, used when an address string carries no service.
    pub default_port: u16,
    /// DNS seed hostnames queried when discovery is enabled.
    pub seeds: &'static [&'static str],
    /// User agent advertised in our `version` messages.
    pub user_agent: &'static str,
    /// Whether the network deploys segregated witness.
    pub segwit: bool,
}

/// Bitcoin mainnet.
pub const BTC: Network = Network {
    name: "btc",
    magic: 0xf9be_b4d9,
    default_port: 8333,
    seeds: &[
        "seed.bitcoin.sipa.be",
        "dnsseed.bluematt.me",
        "dnsseed.bitcoin.dashjr.org",
        "seed.bitcoinstats.com",
        "seed.bitcoin.jonasschnelli.ch",
        "seed.btc.petertodd.org",
        "seed.bitcoin.sprovoost.nl",
    ],
    user_agent: "/kestrel:0.1.0/",
    segwit: true,
};

/// Bitcoin testnet3.
pub const BTC_TEST: Network = Network {
    name: "btctest",
    magic: 0x0b11_0907,
    default_port: 18333,
    seeds: &[
        "testnet-seed.bitcoin.jonasschnelli.ch",
        "seed.tbtc.petertodd.org",
        "seed.testnet.bitcoin.sprovoost.nl",
        "testnet-seed.bluematt.me",
    ],
    user_agent: "/kestrel:0.1.0/",
    segwit: true,
};

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
