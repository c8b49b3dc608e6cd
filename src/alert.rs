//! The typed event stream the engine publishes to its user.
//!
//! Everything below the session supervisor surfaces as an alert, never as an
//! unwinding error across task boundaries: peer churn, verified pieces,
//! storage trouble, completion. Alerts are broadcast, so any number of
//! subscribers may listen, each with its own bounded queue; a slow subscriber
//! loses the oldest alerts rather than stalling the engine.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::{PieceIndex, Sha1Hash};

pub use crate::torrent::stats::{PieceStats, TorrentStats, TorrentStatus};

/// The capacity of a subscriber's alert queue.
pub(crate) const ALERT_QUEUE_LEN: usize = 1024;

/// An event of interest to the engine's user.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Alert {
    /// The torrent was registered with the engine.
    TorrentAdded { info_hash: Sha1Hash },
    /// A magnet torrent obtained and verified its metainfo from the swarm.
    MetadataAcquired { info_hash: Sha1Hash },
    /// A piece arrived in full and passed its hash check.
    PieceVerified {
        info_hash: Sha1Hash,
        index: PieceIndex,
    },
    /// A piece arrived in full but failed its hash check; it will be
    /// re-downloaded.
    PieceFailed {
        info_hash: Sha1Hash,
        index: PieceIndex,
    },
    /// All wanted pieces are downloaded and verified.
    TorrentCompleted { info_hash: Sha1Hash },
    PeerConnected {
        info_hash: Sha1Hash,
        addr: SocketAddr,
    },
    PeerDisconnected {
        info_hash: Sha1Hash,
        addr: SocketAddr,
    },
    TorrentPaused { info_hash: Sha1Hash },
    TorrentResumed { info_hash: Sha1Hash },
    TorrentRemoved { info_hash: Sha1Hash },
    /// The torrent hit an unrecoverable error and needs operator attention.
    /// The reason is also preserved in the torrent's checkpoint.
    TorrentError {
        info_hash: Sha1Hash,
        reason: String,
    },
    CheckpointSaved { info_hash: Sha1Hash },
    /// Periodic per-torrent statistics snapshot.
    Stats {
        info_hash: Sha1Hash,
        stats: TorrentStats,
    },
    /// The engine shut down; no further alerts follow.
    Shutdown,
}

pub(crate) type AlertSender = broadcast::Sender<Alert>;

/// The subscriber half of the alert channel.
pub struct AlertStream {
    rx: broadcast::Receiver<Alert>,
}

impl AlertStream {
    pub(crate) fn new(rx: broadcast::Receiver<Alert>) -> Self {
        Self { rx }
    }

    /// Waits for the next alert. Returns `None` once the engine has shut
    /// down and the backlog is drained.
    pub async fn next(&mut self) -> Option<Alert> {
        loop {
            match self.rx.recv().await {
                Ok(alert) => return Some(alert),
                // we only care about the alerts still in the queue
                Err(broadcast::RecvError::Lagged(skipped)) => {
                    log::warn!("alert subscriber lagged by {}", skipped);
                }
                Err(broadcast::RecvError::Closed) => return None,
            }
        }
    }
}
