//! Error types for peer management.
//!
//! Two layers of errors exist here:
//!
//! - [`PeerError`] - the reasons the manager terminates an individual peer.
//!   These are diagnostics, not failures of the manager itself: the peer task
//!   is told to exit with one of these, and the supervisor reports it back in
//!   the death notification.
//! - [`NetError`] - errors surfaced by the crate's public API and by peer
//!   connector implementations (I/O, closed channels, panics).

use thiserror::Error;

/// Reason a peer connection is terminated by the manager.
///
/// Sent to the peer task via its mailbox (`PeerMessage::Kill`); the task
/// returns the error and the supervisor delivers it to the manager as part
/// of the `PeerDied` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Remote did not advertise the `NODE_NETWORK` service bit.
    #[error("peer does not serve the network")]
    NotNetworkPeer,

    /// Remote echoed one of our own version nonces; we dialed ourselves.
    #[error("peer is myself")]
    PeerIsMyself,

    /// A handshake message arrived for a peer that is not (or no longer)
    /// in the online registry.
    #[error("peer not registered")]
    UnknownPeer,

    /// A ping stayed unanswered past the idle window.
    #[error("peer ping timeout")]
    PeerTimeout,

    /// The connection outlived its jittered lifetime budget.
    #[error("peer connection expired")]
    PeerTooOld,
}

/// Errors that can occur during peer-manager operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// The manager has been shut down; its mailbox no longer accepts messages.
    #[error("peer manager is shut down")]
    ManagerClosed,

    /// A peer was terminated with a diagnostic.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// Low-level I/O error from a peer connector.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error (e.g. a panicked child task).
    #[error("internal error: {0}")]
    Internal(String),
}
