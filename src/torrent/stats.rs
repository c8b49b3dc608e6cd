//! The public statistics snapshot of a torrent.

use std::fmt;

/// The lifecycle status of a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentStatus {
    /// Registered but not yet started.
    Queued,
    /// A magnet torrent still downloading its metainfo from the swarm.
    FetchingMetadata,
    /// Re-hashing data already on disk to rebuild the verified set.
    Checking,
    Downloading,
    /// All wanted pieces verified; only serving.
    Seeding,
    /// The download finished and the torrent has since been paused.
    Completed,
    /// Peer I/O stopped, state retained.
    Paused,
    /// Unrecoverable error; needs operator intervention. The reason is in
    /// [`TorrentStats::error`] and the checkpoint.
    Error,
}

impl Default for TorrentStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = match self {
            Self::Queued => "queued",
            Self::FetchingMetadata => "fetching metadata",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        f.write_str(status)
    }
}

/// Piece counters of a torrent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PieceStats {
    pub total: usize,
    /// Downloaded and hash verified.
    pub verified: usize,
    /// Hash check failures, all time.
    pub failed: usize,
    /// Pieces with at least one block in flight or staged.
    pub pending: usize,
}

/// A point-in-time snapshot of a torrent's state, the payload of
/// [`crate::alert::Alert::Stats`] and of status queries.
#[derive(Clone, Debug, Default)]
pub struct TorrentStats {
    pub status: TorrentStatus,
    pub pieces: PieceStats,
    /// Payload bytes received that were accepted (piece payloads).
    pub downloaded_payload: u64,
    /// Payload bytes served to peers.
    pub uploaded_payload: u64,
    /// Payload bytes received that had to be discarded.
    pub wasted_payload: u64,
    /// Smoothed payload receive rate, bytes per second.
    pub download_rate: u64,
    /// Smoothed payload send rate, bytes per second.
    pub upload_rate: u64,
    pub connected_peer_count: usize,
    /// Known but unconnected peer candidates.
    pub available_peer_count: usize,
    /// Swarm seeder count, as last reported by a tracker.
    pub seeder_count: Option<usize>,
    /// Swarm leecher count, as last reported by a tracker.
    pub leecher_count: Option<usize>,
    /// Blocks staged in the disk write buffer.
    pub disk_queue_depth: usize,
    /// Pieces queued for hashing.
    pub hash_queue_depth: usize,
    /// The diagnostic reason when `status` is [`TorrentStatus::Error`] (or
    /// a recoverable pause).
    pub error: Option<String>,
}
