//! This module defines types used to configure the engine and its parts.
//!
//! The configuration is frozen: it is handed to [`crate::engine::spawn`] once
//! and never mutated. Per-torrent overrides are applied when a torrent is
//! added; changing the configuration of a running engine means tearing it down
//! and recreating it.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{PeerId, PieceSelection};

/// The default riptide client id.
pub const RIPTIDE_CLIENT_ID: &PeerId = b"-rp0100-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default riptide client id, [`RIPTIDE_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        Self {
            engine: EngineConf::new(&download_dir),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// The address on which the engine listens for inbound peer connections.
    /// If not set, inbound connections are not accepted.
    pub listen_addr: Option<SocketAddr>,

    /// The directory in which per-torrent checkpoints and the DHT routing
    /// table are persisted.
    pub state_dir: PathBuf,

    /// The total number of connected peers across all torrents the engine
    /// allows.
    pub max_global_peer_count: usize,

    /// Global download rate limit, in bytes per second. `None` means
    /// unlimited.
    pub download_rate_limit: Option<u64>,

    /// Global upload rate limit, in bytes per second. `None` means unlimited.
    pub upload_rate_limit: Option<u64>,

    /// Whether to run the DHT node. Private torrents never use the DHT even
    /// when this is on.
    pub enable_dht: bool,

    /// Well known nodes used to bootstrap the DHT routing table when no
    /// persisted table exists.
    pub dht_bootstrap_nodes: Vec<String>,
}

impl EngineConf {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: *RIPTIDE_CLIENT_ID,
            listen_addr: None,
            state_dir: state_dir.into(),
            max_global_peer_count: 500,
            download_rate_limit: None,
            upload_rate_limit: None,
            enable_dht: true,
            dht_bootstrap_nodes: vec![
                "router.bittorrent.com:6881".into(),
                "dht.transmissionbt.com:6881".into(),
                "router.utorrent.com:6881".into(),
            ],
        }
    }
}

/// The preallocation strategy used when a torrent's files are created on disk.
///
/// The choice affects fragmentation and resume semantics only, never
/// correctness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prealloc {
    /// Files grow lazily as pieces are written.
    None,
    /// Files are created at their full length with sparse semantics.
    Sparse,
    /// The full length is reserved up front.
    Full,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many failed announce attempts in a row, a tracker is given
    /// up on (until the tier rotates back to it).
    pub tracker_error_threshold: usize,

    /// The piece selection strategy used by default.
    pub piece_selection: PieceSelection,

    /// The upper bound on the number of outstanding block requests kept
    /// pipelined to a single peer. The actual queue size adapts to the link's
    /// bandwidth-delay product below this cap.
    pub pipeline_depth: usize,

    /// How long an outstanding block request may go unanswered before it is
    /// cancelled and handed back to the scheduler.
    pub request_timeout: Duration,

    /// A connection on which no message arrives for this long is probed with
    /// a keep-alive and then dropped.
    pub peer_idle_timeout: Duration,

    /// The deadline for the full handshake exchange.
    pub handshake_timeout: Duration,

    /// The number of unchoke slots, including the optimistic one.
    pub upload_slots: usize,

    /// The remaining-piece count at or below which the endgame starts. The
    /// effective threshold is the maximum of this and 2% of the piece count.
    pub endgame_threshold: usize,

    /// In endgame, the number of peers a single block may be outstanding to.
    pub endgame_duplicates: usize,

    /// How torrent files are preallocated on disk.
    pub prealloc: Prealloc,

    /// The byte budget of the piece read cache used while seeding.
    pub read_cache_budget: u64,

    /// How often a dirty checkpoint is flushed to disk.
    pub checkpoint_interval: Duration,

    /// Checkpoints of completed torrents older than this are removed by the
    /// cleanup pass.
    pub checkpoint_retention: Duration,

    /// Whether to exchange peers with BEP 11 capable peers. Forced off for
    /// private torrents.
    pub enable_pex: bool,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            piece_selection: PieceSelection::default(),
            pipeline_depth: 50,
            request_timeout: Duration::from_secs(20),
            peer_idle_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(30),
            upload_slots: 4,
            endgame_threshold: 20,
            endgame_duplicates: 3,
            prealloc: Prealloc::Sparse,
            read_cache_budget: 64 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(30),
            checkpoint_retention: Duration::from_secs(30 * 24 * 60 * 60),
            enable_pex: true,
        }
    }
}
