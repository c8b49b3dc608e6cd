//! The per-torrent task: owns the torrent's lifecycle and wires the peers,
//! the scheduler state, discovery, and the disk task together.
//!
//! The task is the only writer of the torrent's lifecycle status. Peer
//! sessions share scheduler state through [`TorrentContext`] and report
//! events on the torrent channel; the disk task reports on the torrent's
//! disk alert channel; discovery feeds the candidate pool. One select loop
//! consumes all of it.

mod choke;
pub(crate) mod pool;
pub(crate) mod stats;

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures::{select, stream::Fuse, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, Mutex, RwLock,
    },
    task, time,
};

use crate::{
    alert::{Alert, AlertSender},
    checkpoint::{unix_now, Checkpoint, CheckpointStore},
    conf::TorrentConf,
    dht::DhtHandle,
    disk::{
        DiskHandle, DiskStats, PieceCompletion, StorageError, TorrentAlert,
        TorrentAlertReceiver, WriteError,
    },
    download::PieceDownload,
    error::*,
    magnet::MagnetUri,
    metainfo::Metainfo,
    peer::{
        self,
        codec::Handshake,
        ext::PexMsg,
        metadata::download_metadata,
        PeerSession, SessionInfo,
    },
    piece_picker::{PiecePicker, PiecePriority},
    rate_limit::RateLimiter,
    storage_info::StorageInfo,
    tracker::{AnnounceParams, AnnounceResponse, Event, ScrapeResponse, Tier},
    BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};
use choke::{ChokeCandidate, Choker};
use pool::CandidatePool;
pub use stats::{PieceStats, TorrentStats, TorrentStatus};

/// How often the choker recomputes the unchoke set.
const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// How often pex deltas are sent to connected peers.
const PEX_INTERVAL: Duration = Duration::from_secs(60);

/// A torrent with no peer progress for this long asks discovery for help
/// ahead of schedule.
const STARVATION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// How often the DHT is asked for fresh peers while more are wanted.
const DHT_LOOKUP_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// How often swarm statistics are scraped from the tracker (BEP 48).
const SCRAPE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How many metadata fetch sessions a magnet torrent runs concurrently.
const METADATA_FETCH_CONCURRENCY: usize = 5;

/// The deadline of one metadata fetch attempt.
const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Hash-failure contributions after which a peer is banned.
const BADNESS_BAN_THRESHOLD: u32 = 3;

/// Shared state of a torrent, accessible by all its peer sessions.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    /// Storage geometry of the torrent. Immutable.
    pub storage: StorageInfo,
    /// The piece picker, the single source of truth of availability and
    /// selection. All mutation happens under this one lock.
    pub piece_picker: RwLock<PiecePicker>,
    /// The shared block ledgers of the pieces currently being downloaded.
    pub downloads: RwLock<HashMap<PieceIndex, Arc<RwLock<PieceDownload>>>>,
    /// Set while the torrent is in endgame: outstanding blocks may be
    /// requested from multiple peers.
    pub in_endgame: AtomicBool,
    /// The channel on which sessions (and discovery tasks) report to the
    /// torrent.
    pub torrent_tx: UnboundedSender<TorrentMsg>,
    pub disk: DiskHandle,
    /// The engine wide rate limiter.
    pub global_limiter: Arc<RateLimiter>,
    /// The torrent's own rate limiter (unlimited unless overridden).
    pub rate_limiter: Arc<RateLimiter>,
    pub conf: TorrentConf,
    /// The TCP port we accept peers on, if any.
    pub listen_port: Option<u16>,
    /// The UDP port of our DHT node, announced to peers in `Port` messages.
    pub dht_port: Option<u16>,
    /// BEP 27: true disables DHT and pex for this torrent.
    pub is_private: bool,
}

/// Events that flow into the torrent task.
pub(crate) enum TorrentMsg {
    /// A session completed its handshake.
    PeerConnected { addr: SocketAddr, id: PeerId },
    /// A session exited (its resources are already released).
    PeerDisconnected { addr: SocketAddr },
    /// The per-second state report of a session.
    PeerState { addr: SocketAddr, info: SessionInfo },
    /// An endgame race was won; the losers should cancel.
    BlockCancellations {
        block: BlockInfo,
        peers: Vec<SocketAddr>,
    },
    /// A pex delta arrived from a peer.
    Pex {
        from: SocketAddr,
        added: Vec<SocketAddr>,
        dropped: Vec<SocketAddr>,
    },
    /// A peer announced its DHT node's UDP port.
    DhtPort { ip: IpAddr, port: u16 },
    /// An announce task finished.
    AnnounceComplete(Box<std::result::Result<AnnounceResponse, ()>>),
    /// A scrape task finished.
    ScrapeComplete(Option<ScrapeResponse>),
    /// A metadata fetch attempt finished.
    MetadataFetched {
        addr: SocketAddr,
        info: Option<Vec<u8>>,
    },
}

/// Commands the engine sends to a torrent.
pub(crate) enum TorrentCmd {
    Pause,
    Resume,
    Remove { delete_files: bool },
    SetRateLimits {
        down: Option<u64>,
        up: Option<u64>,
    },
    Status {
        reply: oneshot::Sender<TorrentStats>,
    },
    /// An accepted connection whose handshake matched our info-hash.
    InboundPeer {
        socket: TcpStream,
        handshake: Handshake,
        read_buf: BytesMut,
    },
    /// Engine shutdown: checkpoint and stop.
    Shutdown,
}

/// What the torrent was created from.
pub(crate) enum TorrentKind {
    Full(Box<Metainfo>),
    Magnet(Box<MagnetUri>),
}

/// Everything a torrent task needs at construction.
pub(crate) struct TorrentParams {
    pub id: TorrentId,
    pub kind: TorrentKind,
    /// The re-ingest reference stored in checkpoints.
    pub source: Option<String>,
    pub conf: TorrentConf,
    pub client_id: PeerId,
    pub listen_port: Option<u16>,
    pub disk: DiskHandle,
    pub checkpoint_store: CheckpointStore,
    pub global_limiter: Arc<RateLimiter>,
    pub global_peer_count: Arc<AtomicUsize>,
    pub max_global_peer_count: usize,
    pub dht: Option<DhtHandle>,
    pub alert_chan: AlertSender,
}

struct PeerHandle {
    chan: peer::Sender,
    info: SessionInfo,
    /// Set once the handshake completed.
    connected: bool,
}

/// The exit reason of the torrent loop.
enum Exit {
    Shutdown,
    Removed { delete_files: bool },
}

pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    kind: Option<TorrentKind>,
    source: Option<String>,
    conf: TorrentConf,
    client_id: PeerId,
    listen_port: Option<u16>,
    disk: DiskHandle,
    checkpoint_store: CheckpointStore,
    global_limiter: Arc<RateLimiter>,
    rate_limiter: Arc<RateLimiter>,
    global_peer_count: Arc<AtomicUsize>,
    max_global_peer_count: usize,
    dht: Option<DhtHandle>,
    alert_chan: AlertSender,

    status: TorrentStatus,
    error: Option<String>,
    ctx: Option<Arc<TorrentContext>>,
    disk_stats: Option<Arc<DiskStats>>,

    torrent_tx: UnboundedSender<TorrentMsg>,
    msg_port: Option<UnboundedReceiver<TorrentMsg>>,
    cmd_port: Option<UnboundedReceiver<TorrentCmd>>,

    peers: HashMap<SocketAddr, PeerHandle>,
    pool: CandidatePool,
    banned: HashSet<SocketAddr>,
    badness: HashMap<SocketAddr, u32>,

    trackers: Arc<Mutex<Vec<Tier>>>,
    announce_in_flight: bool,
    next_announce: Instant,
    announce_interval: Duration,
    announce_fail_count: u32,
    pending_event: Option<Event>,
    seeder_count: Option<usize>,
    leecher_count: Option<usize>,

    dht_peers_tx: UnboundedSender<Vec<SocketAddr>>,
    next_dht_lookup: Instant,
    next_scrape: Instant,
    scrape_in_flight: bool,

    choker: Choker,
    unchoked: HashSet<SocketAddr>,
    next_choke: Instant,

    next_pex: Instant,
    last_pex_swarm: HashSet<SocketAddr>,

    /// Files the user selected; `None` means everything.
    selected_files: Option<Vec<usize>>,

    /// Transfer totals of sessions that have since disconnected, plus the
    /// baseline restored from a checkpoint.
    accumulated_downloaded: u64,
    accumulated_uploaded: u64,
    accumulated_wasted: u64,

    pieces_failed: usize,
    checkpoint_dirty: bool,
    next_checkpoint: Instant,
    last_progress: Instant,

    /// Magnet metadata fetches in flight.
    metadata_fetches: HashSet<SocketAddr>,
}

impl Torrent {
    /// Creates the torrent task state and its command channel.
    pub fn new(
        params: TorrentParams,
        selected_files: Option<Vec<usize>>,
    ) -> (Self, UnboundedSender<TorrentCmd>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (torrent_tx, msg_port) = mpsc::unbounded_channel();
        let (dht_peers_tx, _placeholder) = mpsc::unbounded_channel();
        // the real receiver is created in start; this sender is replaced
        drop(_placeholder);

        let info_hash = match &params.kind {
            TorrentKind::Full(metainfo) => metainfo.info_hash,
            TorrentKind::Magnet(magnet) => magnet.info_hash,
        };
        let now = Instant::now();
        let trackers = match &params.kind {
            TorrentKind::Full(metainfo) => metainfo
                .trackers
                .iter()
                .map(|tier| Tier::from_urls(tier))
                .collect(),
            // each magnet tracker forms its own tier
            TorrentKind::Magnet(magnet) => magnet
                .trackers
                .iter()
                .map(|url| Tier::from_urls(std::slice::from_ref(url)))
                .collect(),
        };

        let torrent = Self {
            id: params.id,
            info_hash,
            kind: Some(params.kind),
            source: params.source,
            client_id: params.client_id,
            listen_port: params.listen_port,
            disk: params.disk,
            checkpoint_store: params.checkpoint_store,
            global_limiter: params.global_limiter,
            rate_limiter: Arc::new(RateLimiter::new(None, None)),
            global_peer_count: params.global_peer_count,
            max_global_peer_count: params.max_global_peer_count,
            dht: params.dht,
            alert_chan: params.alert_chan,
            status: TorrentStatus::Queued,
            error: None,
            ctx: None,
            disk_stats: None,
            torrent_tx,
            msg_port: Some(msg_port),
            cmd_port: Some(cmd_port),
            peers: HashMap::new(),
            pool: CandidatePool::new(2048),
            banned: HashSet::new(),
            badness: HashMap::new(),
            trackers: Arc::new(Mutex::new(trackers)),
            announce_in_flight: false,
            next_announce: now,
            announce_interval: params.conf.announce_interval,
            announce_fail_count: 0,
            pending_event: Some(Event::Started),
            seeder_count: None,
            leecher_count: None,
            dht_peers_tx,
            next_dht_lookup: now,
            next_scrape: now + SCRAPE_INTERVAL,
            scrape_in_flight: false,
            choker: Choker::new(params.conf.upload_slots),
            unchoked: HashSet::new(),
            next_choke: now,
            next_pex: now + PEX_INTERVAL,
            last_pex_swarm: HashSet::new(),
            selected_files,
            accumulated_downloaded: 0,
            accumulated_uploaded: 0,
            accumulated_wasted: 0,
            pieces_failed: 0,
            checkpoint_dirty: false,
            next_checkpoint: now + params.conf.checkpoint_interval,
            last_progress: now,
            metadata_fetches: HashSet::new(),
            conf: params.conf,
        };
        (torrent, cmd_chan)
    }

    /// Runs the torrent to completion of its lifecycle.
    pub async fn start(mut self) -> Result<()> {
        log::info!(
            "starting torrent {} ({})",
            self.id,
            hex::encode(self.info_hash)
        );
        let mut cmd_port =
            self.cmd_port.take().expect("torrent started twice").fuse();
        let mut msg_port =
            self.msg_port.take().expect("torrent started twice").fuse();
        let (dht_peers_tx, dht_peers_rx) = mpsc::unbounded_channel();
        self.dht_peers_tx = dht_peers_tx;
        let mut dht_peers = dht_peers_rx.fuse();

        let checkpoint = self.load_checkpoint().await;
        if let Some(checkpoint) = &checkpoint {
            self.accumulated_downloaded = checkpoint.downloaded;
            self.accumulated_uploaded = checkpoint.uploaded;
        }

        // magnets must fetch the metainfo from the swarm first
        let metainfo = match self.kind.take().expect("torrent has no source")
        {
            TorrentKind::Full(metainfo) => *metainfo,
            TorrentKind::Magnet(magnet) => {
                self.set_status(TorrentStatus::FetchingMetadata);
                match self
                    .fetch_metadata_phase(
                        *magnet,
                        &mut cmd_port,
                        &mut msg_port,
                        &mut dht_peers,
                    )
                    .await?
                {
                    Some(metainfo) => {
                        self.send_alert(Alert::MetadataAcquired {
                            info_hash: self.info_hash,
                        });
                        metainfo
                    }
                    // removed or shut down while fetching
                    None => return Ok(()),
                }
            }
        };

        // disk allocation
        let storage =
            StorageInfo::new(&metainfo, self.conf.download_dir.clone());
        let allocation = match self
            .disk
            .allocate_new_torrent(
                self.id,
                self.info_hash,
                storage.clone(),
                metainfo.piece_hashes.clone(),
                self.conf.prealloc,
                self.conf.read_cache_budget,
            )?
            .await?
        {
            Ok(allocation) => allocation,
            Err(e) => {
                log::error!("torrent {} allocation failed: {}", self.id, e);
                self.fail(format!("disk allocation failed: {}", e));
                return Ok(());
            }
        };
        self.disk_stats = Some(allocation.stats);
        let mut disk_port = allocation.alert_port.fuse();

        // scheduler state
        let mut picker = PiecePicker::new(
            storage.piece_count,
            self.conf.piece_selection,
        );
        self.apply_file_selection(&storage, &mut picker);
        let ctx = Arc::new(TorrentContext {
            id: self.id,
            info_hash: self.info_hash,
            client_id: self.client_id,
            storage,
            piece_picker: RwLock::new(picker),
            downloads: RwLock::new(HashMap::new()),
            in_endgame: AtomicBool::new(false),
            torrent_tx: self.torrent_tx.clone(),
            disk: self.disk.clone(),
            global_limiter: Arc::clone(&self.global_limiter),
            rate_limiter: Arc::clone(&self.rate_limiter),
            conf: self.conf.clone(),
            listen_port: self.listen_port,
            dht_port: if metainfo.private {
                None
            } else {
                self.dht.as_ref().map(|dht| dht.port)
            },
            is_private: metainfo.private,
        });
        self.ctx = Some(Arc::clone(&ctx));

        // re-verify what a checkpoint claims before trusting it
        if let Some(checkpoint) = checkpoint {
            if checkpoint.pieces.any()
                && checkpoint.pieces.len() == ctx.storage.piece_count
            {
                self.set_status(TorrentStatus::Checking);
                self.disk.check_torrent(self.id, checkpoint.pieces)?;
                if !self
                    .wait_for_check(&mut cmd_port, &mut disk_port, &ctx)
                    .await?
                {
                    return Ok(());
                }
            }
        }

        let complete =
            ctx.piece_picker.read().await.is_complete();
        self.set_status(if complete {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        });
        self.update_endgame(&ctx).await;

        // main loop
        let mut tick_timer = time::interval(Duration::from_secs(1)).fuse();
        let exit = loop {
            select! {
                cmd = cmd_port.select_next_some() => {
                    if let Some(exit) = self.handle_cmd(cmd).await? {
                        break exit;
                    }
                }
                msg = msg_port.select_next_some() => {
                    self.handle_msg(msg).await?;
                }
                peers = dht_peers.select_next_some() => {
                    self.add_candidates(peers);
                }
                alert = disk_port.select_next_some() => {
                    self.handle_disk_alert(alert).await?;
                }
                _ = tick_timer.select_next_some() => {
                    self.tick().await?;
                }
            }
        };

        self.shutdown(exit).await;
        Ok(())
    }

    /// The magnet phase: discover peers and fetch the metainfo over
    /// ut_metadata. Returns `None` if the torrent was removed or shut down
    /// while fetching.
    async fn fetch_metadata_phase(
        &mut self,
        magnet: MagnetUri,
        cmd_port: &mut Fuse<UnboundedReceiver<TorrentCmd>>,
        msg_port: &mut Fuse<UnboundedReceiver<TorrentMsg>>,
        dht_peers: &mut Fuse<UnboundedReceiver<Vec<SocketAddr>>>,
    ) -> Result<Option<Metainfo>> {
        self.add_candidates(magnet.peers.clone());
        let selected =
            if magnet.selected_files.is_empty() {
                None
            } else {
                Some(magnet.selected_files.clone())
            };
        if self.selected_files.is_none() {
            self.selected_files = selected;
        }

        let mut tick_timer = time::interval(Duration::from_secs(1)).fuse();
        loop {
            select! {
                cmd = cmd_port.select_next_some() => {
                    match cmd {
                        TorrentCmd::Remove { delete_files: _ } => {
                            self.send_alert(Alert::TorrentRemoved {
                                info_hash: self.info_hash,
                            });
                            return Ok(None);
                        }
                        TorrentCmd::Shutdown => return Ok(None),
                        TorrentCmd::Pause => {
                            if self.status != TorrentStatus::Paused {
                                self.set_status(TorrentStatus::Paused);
                                self.send_alert(Alert::TorrentPaused {
                                    info_hash: self.info_hash,
                                });
                            }
                        }
                        TorrentCmd::Resume => {
                            if self.status == TorrentStatus::Paused {
                                self.set_status(
                                    TorrentStatus::FetchingMetadata,
                                );
                                self.send_alert(Alert::TorrentResumed {
                                    info_hash: self.info_hash,
                                });
                            }
                        }
                        cmd => {
                            // status queries and limit changes work in this
                            // phase too
                            if self.handle_cmd(cmd).await?.is_some() {
                                return Ok(None);
                            }
                        }
                    }
                }
                msg = msg_port.select_next_some() => {
                    if let TorrentMsg::MetadataFetched { addr, info } = msg {
                        self.metadata_fetches.remove(&addr);
                        if let Some(info) = info {
                            match Metainfo::from_info_bytes(
                                &info,
                                self.info_hash,
                            ) {
                                Ok(mut metainfo) => {
                                    metainfo.trackers = magnet
                                        .trackers
                                        .iter()
                                        .map(|url| vec![url.clone()])
                                        .collect();
                                    return Ok(Some(metainfo));
                                }
                                Err(e) => {
                                    log::warn!(
                                        "peer {} served bad metadata: {}",
                                        addr,
                                        e
                                    );
                                    self.banned.insert(addr);
                                }
                            }
                        } else {
                            self.pool.on_failure(&addr);
                        }
                    } else {
                        self.handle_msg(msg).await?;
                    }
                }
                peers = dht_peers.select_next_some() => {
                    self.add_candidates(peers);
                }
                _ = tick_timer.select_next_some() => {
                    if self.status == TorrentStatus::FetchingMetadata {
                        self.drive_discovery().await;
                        self.spawn_metadata_fetches();
                    }
                }
            }
        }
    }

    /// Dials metadata fetchers at pool candidates, up to the concurrency
    /// cap.
    fn spawn_metadata_fetches(&mut self) {
        let free = METADATA_FETCH_CONCURRENCY
            .saturating_sub(self.metadata_fetches.len());
        if free == 0 {
            return;
        }
        for addr in self.pool.take(free) {
            if self.banned.contains(&addr)
                || self.metadata_fetches.contains(&addr)
            {
                continue;
            }
            self.metadata_fetches.insert(addr);
            let info_hash = self.info_hash;
            let client_id = self.client_id;
            let torrent_tx = self.torrent_tx.clone();
            task::spawn(async move {
                let result = download_metadata(
                    addr,
                    info_hash,
                    client_id,
                    METADATA_FETCH_TIMEOUT,
                )
                .await;
                let info = match result {
                    Ok(info) => Some(info),
                    Err(e) => {
                        log::debug!(
                            "metadata fetch from {} failed: {}",
                            addr,
                            e
                        );
                        None
                    }
                };
                let _ = torrent_tx
                    .send(TorrentMsg::MetadataFetched { addr, info });
            });
        }
    }

    /// Waits for the disk's re-hash of checkpoint-claimed pieces, applying
    /// the verified subset to the picker. Returns false if the torrent was
    /// removed or shut down while checking.
    async fn wait_for_check(
        &mut self,
        cmd_port: &mut Fuse<UnboundedReceiver<TorrentCmd>>,
        disk_port: &mut Fuse<TorrentAlertReceiver>,
        ctx: &Arc<TorrentContext>,
    ) -> Result<bool> {
        loop {
            select! {
                cmd = cmd_port.select_next_some() => {
                    match cmd {
                        TorrentCmd::Remove { delete_files } => {
                            let _ = self
                                .disk
                                .remove_torrent(self.id, delete_files);
                            self.send_alert(Alert::TorrentRemoved {
                                info_hash: self.info_hash,
                            });
                            return Ok(false);
                        }
                        TorrentCmd::Shutdown => return Ok(false),
                        cmd => {
                            if self.handle_cmd(cmd).await?.is_some() {
                                return Ok(false);
                            }
                        }
                    }
                }
                alert = disk_port.select_next_some() => {
                    if let TorrentAlert::CheckCompletion(result) = alert {
                        match result {
                            Ok(verified) => {
                                let mut picker =
                                    ctx.piece_picker.write().await;
                                for (index, ok) in
                                    verified.iter().enumerate()
                                {
                                    if *ok {
                                        picker.received_piece(index);
                                    }
                                }
                                log::info!(
                                    "torrent {} check done: {}/{} pieces \
                                     verified",
                                    self.id,
                                    verified.count_ones(),
                                    verified.len()
                                );
                                return Ok(true);
                            }
                            Err(e) => {
                                // a checkpoint that fails re-verification is
                                // discarded; the torrent restarts from zero
                                log::warn!(
                                    "torrent {} check failed: {}",
                                    self.id,
                                    e
                                );
                                return Ok(true);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Maps the file selection to per-piece priorities and first/last piece
    /// boosts.
    fn apply_file_selection(
        &self,
        storage: &StorageInfo,
        picker: &mut PiecePicker,
    ) {
        let selected: Option<HashSet<usize>> = self
            .selected_files
            .as_ref()
            .map(|files| files.iter().copied().collect());

        if let Some(selected) = &selected {
            for index in 0..storage.piece_count {
                // a piece is wanted if any of its bytes belong to a selected
                // file; straddling pieces must be downloaded whole as the
                // hash covers all their bytes
                let wanted = storage
                    .files_intersecting_piece(index)
                    .map(|files| files.into_iter().any(|f| selected.contains(&f)))
                    .unwrap_or(false);
                if !wanted {
                    picker.set_priority(index, PiecePriority::DoNotDownload);
                }
            }
        }

        // boost the first and last piece of each wanted file, which helps
        // media players sniff container formats early
        for (file_index, file) in storage.files.iter().enumerate() {
            if let Some(selected) = &selected {
                if !selected.contains(&file_index) {
                    continue;
                }
            }
            let piece_len = storage.piece_len as u64;
            let first = (file.torrent_offset / piece_len) as usize;
            let last =
                ((file.torrent_end_offset() - 1) / piece_len) as usize;
            picker.boost_piece(first);
            picker.boost_piece(last.min(storage.piece_count - 1));
        }
    }

    /// Handles an engine command. Returns the exit reason if the command
    /// ends the torrent.
    async fn handle_cmd(&mut self, cmd: TorrentCmd) -> Result<Option<Exit>> {
        match cmd {
            TorrentCmd::Pause => {
                if !matches!(
                    self.status,
                    TorrentStatus::Paused
                        | TorrentStatus::Completed
                        | TorrentStatus::Error
                ) {
                    log::info!("pausing torrent {}", self.id);
                    let complete = self.is_complete().await;
                    self.disconnect_all_peers();
                    self.pending_event = Some(Event::Stopped);
                    self.spawn_announce().await;
                    self.set_status(if complete {
                        TorrentStatus::Completed
                    } else {
                        TorrentStatus::Paused
                    });
                    self.send_alert(Alert::TorrentPaused {
                        info_hash: self.info_hash,
                    });
                    self.save_checkpoint().await;
                }
            }
            TorrentCmd::Resume => {
                if matches!(
                    self.status,
                    TorrentStatus::Paused | TorrentStatus::Completed
                ) {
                    log::info!("resuming torrent {}", self.id);
                    let complete = self.is_complete().await;
                    self.set_status(if complete {
                        TorrentStatus::Seeding
                    } else {
                        TorrentStatus::Downloading
                    });
                    self.pending_event = Some(Event::Started);
                    self.next_announce = Instant::now();
                    self.next_dht_lookup = Instant::now();
                    self.send_alert(Alert::TorrentResumed {
                        info_hash: self.info_hash,
                    });
                }
            }
            TorrentCmd::Remove { delete_files } => {
                return Ok(Some(Exit::Removed { delete_files }));
            }
            TorrentCmd::SetRateLimits { down, up } => {
                self.rate_limiter.set_rates(down, up);
            }
            TorrentCmd::Status { reply } => {
                let _ = reply.send(self.stats().await);
            }
            TorrentCmd::InboundPeer {
                socket,
                handshake,
                read_buf,
            } => {
                self.accept_peer(socket, handshake, read_buf);
            }
            TorrentCmd::Shutdown => {
                return Ok(Some(Exit::Shutdown));
            }
        }
        Ok(None)
    }

    /// Handles an event from a session or a discovery task.
    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<()> {
        match msg {
            TorrentMsg::PeerConnected { addr, id } => {
                log::debug!(
                    "peer {} ({}) joined torrent {}",
                    addr,
                    String::from_utf8_lossy(&id),
                    self.id
                );
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.connected = true;
                }
                self.pool.on_connected(&addr);
                self.last_progress = Instant::now();
                self.send_alert(Alert::PeerConnected {
                    info_hash: self.info_hash,
                    addr,
                });
            }
            TorrentMsg::PeerDisconnected { addr } => {
                if let Some(handle) = self.peers.remove(&addr) {
                    self.accumulated_downloaded +=
                        handle.info.downloaded_payload;
                    self.accumulated_uploaded +=
                        handle.info.uploaded_payload;
                    self.accumulated_wasted += handle.info.wasted;
                    if handle.connected {
                        self.pool.on_disconnected(&addr);
                    } else {
                        self.pool.on_failure(&addr);
                    }
                    self.global_peer_count
                        .fetch_sub(1, Ordering::Relaxed);
                    self.unchoked.remove(&addr);
                    self.send_alert(Alert::PeerDisconnected {
                        info_hash: self.info_hash,
                        addr,
                    });
                }
            }
            TorrentMsg::PeerState { addr, info } => {
                if info.downloaded_payload
                    > self
                        .peers
                        .get(&addr)
                        .map(|handle| handle.info.downloaded_payload)
                        .unwrap_or(0)
                {
                    self.last_progress = Instant::now();
                }
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.info = info;
                }
            }
            TorrentMsg::BlockCancellations { block, peers } => {
                for addr in peers {
                    if let Some(handle) = self.peers.get(&addr) {
                        let _ = handle
                            .chan
                            .send(peer::Command::CancelBlock { block });
                    }
                }
            }
            TorrentMsg::Pex {
                from,
                added,
                dropped,
            } => {
                log::debug!(
                    "pex from {}: {} added, {} dropped",
                    from,
                    added.len(),
                    dropped.len()
                );
                self.add_candidates(added);
                for addr in dropped {
                    // only unconnected candidates are dropped on hearsay
                    if !self.peers.contains_key(&addr) {
                        self.pool.remove(&addr);
                    }
                }
            }
            TorrentMsg::DhtPort { ip, port } => {
                if let Some(dht) = &self.dht {
                    if !self.is_private() {
                        dht.add_node(SocketAddr::new(ip, port));
                    }
                }
            }
            TorrentMsg::AnnounceComplete(result) => {
                self.announce_in_flight = false;
                match *result {
                    Ok(response) => {
                        self.announce_fail_count = 0;
                        if let Some(interval) = response.interval {
                            self.announce_interval =
                                interval.max(Duration::from_secs(30));
                        }
                        self.next_announce =
                            Instant::now() + self.announce_interval;
                        self.seeder_count = response.seeder_count;
                        self.leecher_count = response.leecher_count;
                        if let Some(warning) = response.warning_message {
                            log::warn!(
                                "tracker warning for torrent {}: {}",
                                self.id,
                                warning
                            );
                        }
                        log::info!(
                            "announce for torrent {} returned {} peers",
                            self.id,
                            response.peers.len()
                        );
                        self.add_candidates(response.peers);
                    }
                    Err(()) => {
                        // exponential backoff capped at the regular interval
                        self.announce_fail_count += 1;
                        let backoff = Duration::from_secs(30)
                            .checked_mul(
                                1u32.checked_shl(
                                    self.announce_fail_count.min(16),
                                )
                                .unwrap_or(u32::MAX),
                            )
                            .unwrap_or(self.announce_interval)
                            .min(self.announce_interval);
                        self.next_announce = Instant::now() + backoff;
                    }
                }
            }
            TorrentMsg::ScrapeComplete(response) => {
                self.scrape_in_flight = false;
                if let Some(scrape) = response {
                    self.seeder_count = Some(scrape.complete as usize);
                    self.leecher_count = Some(scrape.incomplete as usize);
                    log::debug!(
                        "torrent {} scrape: {} seeders, {} leechers, {} \
                         downloads",
                        self.id,
                        scrape.complete,
                        scrape.incomplete,
                        scrape.downloaded
                    );
                }
            }
            TorrentMsg::MetadataFetched { addr, .. } => {
                // late result after the magnet phase ended
                self.metadata_fetches.remove(&addr);
            }
        }
        Ok(())
    }

    /// Handles an event from the disk task.
    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<()> {
        match alert {
            TorrentAlert::PieceCompletion(Ok(PieceCompletion {
                index,
                is_valid,
            })) => {
                if is_valid {
                    self.on_piece_verified(index).await?;
                } else {
                    self.on_piece_failed(index).await;
                }
            }
            TorrentAlert::PieceCompletion(Err(e)) => {
                log::warn!("torrent {} write failed: {}", self.id, e);
                if let WriteError::Storage(e) = e {
                    self.on_storage_error(e).await;
                }
            }
            TorrentAlert::CheckCompletion(_) => {
                // only expected during the checking phase
                log::warn!("unexpected check completion alert");
            }
            TorrentAlert::CheckpointSaved(Ok(())) => {
                self.send_alert(Alert::CheckpointSaved {
                    info_hash: self.info_hash,
                });
            }
            TorrentAlert::CheckpointSaved(Err(e)) => {
                log::warn!(
                    "torrent {} checkpoint save failed: {}",
                    self.id,
                    e
                );
            }
            TorrentAlert::ReadFailed { block, error } => {
                log::warn!(
                    "torrent {} failed to serve {}: {}",
                    self.id,
                    block,
                    error
                );
            }
        }
        Ok(())
    }

    /// A piece passed its hash check and is on disk.
    async fn on_piece_verified(&mut self, index: PieceIndex) -> Result<()> {
        let ctx = match &self.ctx {
            Some(ctx) => Arc::clone(ctx),
            None => return Ok(()),
        };
        ctx.piece_picker.write().await.received_piece(index);
        ctx.downloads.write().await.remove(&index);
        self.checkpoint_dirty = true;
        self.last_progress = Instant::now();

        // everyone learns we have the piece; sessions also cancel their own
        // leftover endgame requests for it
        for handle in self.peers.values() {
            let _ = handle
                .chan
                .send(peer::Command::PieceCompleted { index });
        }
        self.send_alert(Alert::PieceVerified {
            info_hash: self.info_hash,
            index,
        });

        self.update_endgame(&ctx).await;
        if ctx.piece_picker.read().await.is_complete()
            && self.status == TorrentStatus::Downloading
        {
            log::info!("torrent {} complete", self.id);
            self.set_status(TorrentStatus::Seeding);
            self.pending_event = Some(Event::Completed);
            self.spawn_announce().await;
            if let (Some(dht), Some(port)) = (&self.dht, self.listen_port) {
                if !self.is_private() {
                    dht.announce(self.info_hash, port);
                }
            }
            self.send_alert(Alert::TorrentCompleted {
                info_hash: self.info_hash,
            });
            self.save_checkpoint().await;
        }
        Ok(())
    }

    /// A piece failed its hash check: reset it and penalize everyone who
    /// contributed blocks.
    async fn on_piece_failed(&mut self, index: PieceIndex) {
        let ctx = match &self.ctx {
            Some(ctx) => Arc::clone(ctx),
            None => return,
        };
        self.pieces_failed += 1;

        let contributors = match ctx.downloads.write().await.remove(&index)
        {
            Some(download) => download.read().await.contributors(),
            None => Vec::new(),
        };
        ctx.piece_picker.write().await.reset_piece(index);

        log::warn!(
            "torrent {} piece {} failed hash check ({} contributors)",
            self.id,
            index,
            contributors.len()
        );
        for addr in contributors {
            let badness = self.badness.entry(addr).or_insert(0);
            *badness += 1;
            if *badness >= BADNESS_BAN_THRESHOLD {
                log::warn!("banning peer {} for repeated bad data", addr);
                self.banned.insert(addr);
                self.pool.remove(&addr);
                if let Some(handle) = self.peers.get(&addr) {
                    let _ = handle.chan.send(peer::Command::Shutdown);
                }
            }
        }
        self.send_alert(Alert::PieceFailed {
            info_hash: self.info_hash,
            index,
        });
        // the reset piece may take the torrent back out of endgame
        self.update_endgame(&ctx).await;
    }

    /// Storage failures pause the torrent (disk full may be fixed by the
    /// operator) or error it outright.
    async fn on_storage_error(&mut self, e: StorageError) {
        let reason = e.to_string();
        if e.is_recoverable() {
            log::error!(
                "torrent {} paused by storage error: {}",
                self.id,
                reason
            );
            self.disconnect_all_peers();
            self.error = Some(reason);
            self.set_status(TorrentStatus::Paused);
            self.send_alert(Alert::TorrentPaused {
                info_hash: self.info_hash,
            });
        } else {
            self.fail(reason);
        }
        self.save_checkpoint().await;
    }

    /// Puts the torrent into the terminal error state.
    fn fail(&mut self, reason: String) {
        log::error!("torrent {} failed: {}", self.id, reason);
        self.disconnect_all_peers();
        self.error = Some(reason.clone());
        self.set_status(TorrentStatus::Error);
        self.send_alert(Alert::TorrentError {
            info_hash: self.info_hash,
            reason,
        });
    }

    /// The once-a-second housekeeping of the torrent.
    async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let active = matches!(
            self.status,
            TorrentStatus::Downloading | TorrentStatus::Seeding
        );

        if active {
            self.drive_discovery().await;
            self.connect_candidates();

            if now >= self.next_choke {
                self.next_choke = now + CHOKE_INTERVAL;
                self.run_choker();
            }
            if now >= self.next_pex && !self.is_private() {
                self.next_pex = now + PEX_INTERVAL;
                self.send_pex();
            }

            // a starved torrent re-announces ahead of schedule
            if self.status == TorrentStatus::Downloading
                && self.last_progress.elapsed() > STARVATION_TIMEOUT
            {
                log::info!(
                    "torrent {} is starved, re-announcing",
                    self.id
                );
                self.last_progress = now;
                self.next_announce = now;
                self.next_dht_lookup = now;
            }
        }

        if self.checkpoint_dirty && now >= self.next_checkpoint {
            self.next_checkpoint = now + self.conf.checkpoint_interval;
            self.save_checkpoint().await;
        }

        self.send_alert(Alert::Stats {
            info_hash: self.info_hash,
            stats: self.stats().await,
        });
        Ok(())
    }

    /// Fires tracker announces and DHT lookups when they are due.
    async fn drive_discovery(&mut self) {
        let now = Instant::now();
        let want_peers = self.peers.len()
            < self.conf.max_connected_peer_count
            || self.pending_event.is_some();

        if want_peers && now >= self.next_announce {
            self.spawn_announce().await;
        }
        if want_peers && !self.is_private() && now >= self.next_dht_lookup {
            self.next_dht_lookup = now + DHT_LOOKUP_INTERVAL;
            if let Some(dht) = &self.dht {
                dht.get_peers(self.info_hash, self.dht_peers_tx.clone());
            }
        }
        if now >= self.next_scrape {
            self.next_scrape = now + SCRAPE_INTERVAL;
            self.spawn_scrape().await;
        }
    }

    /// Spawns a read-only swarm statistics query against the primary
    /// tracker.
    async fn spawn_scrape(&mut self) {
        if self.scrape_in_flight || self.trackers.lock().await.is_empty() {
            return;
        }
        self.scrape_in_flight = true;
        let info_hash = self.info_hash;
        let trackers = Arc::clone(&self.trackers);
        let torrent_tx = self.torrent_tx.clone();
        task::spawn(async move {
            let mut trackers = trackers.lock().await;
            let response = match trackers
                .iter_mut()
                .flat_map(|tier| tier.trackers.iter_mut())
                .next()
            {
                Some(tracker) => match tracker.scrape(info_hash).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        log::debug!("scrape failed: {}", e);
                        None
                    }
                },
                None => None,
            };
            let _ = torrent_tx.send(TorrentMsg::ScrapeComplete(response));
        });
    }

    /// Spawns one announce round over the tracker tiers.
    async fn spawn_announce(&mut self) {
        if self.announce_in_flight {
            return;
        }
        if self.trackers.lock().await.is_empty() {
            return;
        }
        self.announce_in_flight = true;
        self.next_announce = Instant::now() + self.announce_interval;

        let left = self.bytes_left().await;
        let params = AnnounceParams {
            info_hash: self.info_hash,
            peer_id: self.client_id,
            port: self.listen_port.unwrap_or(0),
            downloaded: self.total_downloaded(),
            uploaded: self.total_uploaded(),
            left,
            event: self.pending_event.take(),
            peer_count: Some(self.conf.min_requested_peer_count.max(30)),
        };
        let trackers = Arc::clone(&self.trackers);
        let torrent_tx = self.torrent_tx.clone();
        task::spawn(async move {
            let mut trackers = trackers.lock().await;
            let mut result = Err(());
            for tier in trackers.iter_mut() {
                match tier.announce(&params).await {
                    Ok(response) => {
                        result = Ok(response);
                        break;
                    }
                    Err(e) => {
                        log::warn!("tier announce failed: {}", e);
                    }
                }
            }
            let _ = torrent_tx
                .send(TorrentMsg::AnnounceComplete(Box::new(result)));
        });
    }

    /// Feeds discovered endpoints into the candidate pool.
    fn add_candidates(&mut self, addrs: Vec<SocketAddr>) {
        let banned = &self.banned;
        self.pool.insert_all(
            addrs.into_iter().filter(|addr| !banned.contains(addr)),
        );
    }

    /// Dials pool candidates until the torrent's connection slots are full.
    fn connect_candidates(&mut self) {
        let ctx = match &self.ctx {
            Some(ctx) => Arc::clone(ctx),
            None => return,
        };
        let global_free = self
            .max_global_peer_count
            .saturating_sub(self.global_peer_count.load(Ordering::Relaxed));
        let free = self
            .conf
            .max_connected_peer_count
            .saturating_sub(self.peers.len())
            .min(global_free);
        if free == 0 {
            return;
        }
        for addr in self.pool.take(free) {
            if self.peers.contains_key(&addr) || self.banned.contains(&addr)
            {
                continue;
            }
            log::debug!("torrent {} dialing peer {}", self.id, addr);
            let (mut session, chan) =
                PeerSession::new(Arc::clone(&ctx), addr);
            self.peers.insert(
                addr,
                PeerHandle {
                    chan,
                    info: SessionInfo::default(),
                    connected: false,
                },
            );
            self.global_peer_count.fetch_add(1, Ordering::Relaxed);
            task::spawn(async move {
                if let Err(e) = session.start_outbound().await {
                    log::debug!("peer {} session ended: {}", addr, e);
                }
            });
        }
    }

    /// Takes over an inbound connection routed to us by the engine's accept
    /// loop.
    fn accept_peer(
        &mut self,
        socket: TcpStream,
        handshake: Handshake,
        read_buf: BytesMut,
    ) {
        let ctx = match &self.ctx {
            Some(ctx) => ctx,
            // inbound peers for a torrent still fetching metadata are not
            // handled; they will be re-discovered later
            None => return,
        };
        if !matches!(
            self.status,
            TorrentStatus::Downloading | TorrentStatus::Seeding
        ) {
            return;
        }
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if self.peers.contains_key(&addr)
            || self.banned.contains(&addr)
            || self.peers.len() >= self.conf.max_connected_peer_count
        {
            return;
        }
        let (mut session, chan) = PeerSession::new(Arc::clone(ctx), addr);
        self.peers.insert(
            addr,
            PeerHandle {
                chan,
                info: SessionInfo::default(),
                connected: false,
            },
        );
        self.global_peer_count.fetch_add(1, Ordering::Relaxed);
        task::spawn(async move {
            if let Err(e) =
                session.start_inbound(socket, handshake, read_buf).await
            {
                log::debug!("inbound peer {} session ended: {}", addr, e);
            }
        });
    }

    /// One choke round: rank peers and apply the slot changes.
    fn run_choker(&mut self) {
        let seeding = self.status == TorrentStatus::Seeding;
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter(|(_, handle)| handle.connected)
            .map(|(addr, handle)| ChokeCandidate {
                addr: *addr,
                rate: if seeding {
                    handle.info.upload_rate
                } else {
                    handle.info.download_rate
                },
                is_interested: handle.info.is_peer_interested,
                is_snubbed: handle.info.is_snubbed,
            })
            .collect();

        let decisions = self.choker.run(&candidates, &self.unchoked);
        for addr in decisions.choke {
            self.unchoked.remove(&addr);
            if let Some(handle) = self.peers.get(&addr) {
                let _ = handle.chan.send(peer::Command::Choke);
            }
        }
        for addr in decisions.unchoke {
            self.unchoked.insert(addr);
            if let Some(handle) = self.peers.get(&addr) {
                let _ = handle.chan.send(peer::Command::Unchoke);
            }
        }
    }

    /// Sends the swarm membership delta to every pex-capable peer.
    fn send_pex(&mut self) {
        let current: HashSet<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, handle)| handle.connected)
            .map(|(addr, _)| *addr)
            .collect();
        let added: Vec<SocketAddr> =
            current.difference(&self.last_pex_swarm).copied().collect();
        let dropped: Vec<SocketAddr> =
            self.last_pex_swarm.difference(&current).copied().collect();
        if added.is_empty() && dropped.is_empty() {
            return;
        }
        self.last_pex_swarm = current;
        let msg = PexMsg { added, dropped };
        for handle in self.peers.values() {
            let _ = handle.chan.send(peer::Command::SendPex(msg.clone()));
        }
    }

    /// Re-evaluates the endgame trigger: on when the remaining wanted
    /// pieces drop below the threshold.
    async fn update_endgame(&self, ctx: &Arc<TorrentContext>) {
        let remaining =
            ctx.piece_picker.read().await.wanted_remaining_count();
        let threshold = self
            .conf
            .endgame_threshold
            .max(ctx.storage.piece_count / 50);
        let endgame = remaining > 0 && remaining <= threshold;
        if endgame != ctx.in_endgame.load(Ordering::Relaxed) {
            log::info!(
                "torrent {} endgame: {} ({} pieces remaining)",
                self.id,
                endgame,
                remaining
            );
            ctx.in_endgame.store(endgame, Ordering::Relaxed);
        }
    }

    fn disconnect_all_peers(&mut self) {
        for handle in self.peers.values() {
            let _ = handle.chan.send(peer::Command::Shutdown);
        }
        self.unchoked.clear();
        // the sessions will report back with PeerDisconnected, which settles
        // the stats accumulators
    }

    fn is_private(&self) -> bool {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.is_private)
            .unwrap_or(false)
    }

    async fn is_complete(&self) -> bool {
        match &self.ctx {
            Some(ctx) => ctx.piece_picker.read().await.is_complete(),
            None => false,
        }
    }

    fn total_downloaded(&self) -> u64 {
        self.accumulated_downloaded
            + self
                .peers
                .values()
                .map(|handle| handle.info.downloaded_payload)
                .sum::<u64>()
    }

    fn total_uploaded(&self) -> u64 {
        self.accumulated_uploaded
            + self
                .peers
                .values()
                .map(|handle| handle.info.uploaded_payload)
                .sum::<u64>()
    }

    async fn bytes_left(&self) -> u64 {
        match &self.ctx {
            Some(ctx) => {
                let picker = ctx.piece_picker.read().await;
                let mut left = 0;
                for index in 0..ctx.storage.piece_count {
                    if !picker.own_pieces()[index] {
                        left += ctx
                            .storage
                            .piece_len(index)
                            .unwrap_or_default()
                            as u64;
                    }
                }
                left
            }
            None => 0,
        }
    }

    /// Builds the public stats snapshot.
    async fn stats(&self) -> TorrentStats {
        let pieces = match &self.ctx {
            Some(ctx) => {
                let picker = ctx.piece_picker.read().await;
                PieceStats {
                    total: picker.piece_count(),
                    verified: picker.own_pieces().count_ones(),
                    failed: self.pieces_failed,
                    pending: ctx.downloads.read().await.len(),
                }
            }
            None => PieceStats::default(),
        };

        TorrentStats {
            status: self.status,
            pieces,
            downloaded_payload: self.total_downloaded(),
            uploaded_payload: self.total_uploaded(),
            wasted_payload: self.accumulated_wasted
                + self
                    .peers
                    .values()
                    .map(|handle| handle.info.wasted)
                    .sum::<u64>(),
            download_rate: self
                .peers
                .values()
                .map(|handle| handle.info.download_rate)
                .sum(),
            upload_rate: self
                .peers
                .values()
                .map(|handle| handle.info.upload_rate)
                .sum(),
            connected_peer_count: self
                .peers
                .values()
                .filter(|handle| handle.connected)
                .count(),
            available_peer_count: self.pool.len(),
            seeder_count: self.seeder_count,
            leecher_count: self.leecher_count,
            disk_queue_depth: self
                .disk_stats
                .as_ref()
                .map(|stats| stats.write_queue())
                .unwrap_or(0),
            hash_queue_depth: self
                .disk_stats
                .as_ref()
                .map(|stats| stats.hash_queue())
                .unwrap_or(0),
            error: self.error.clone(),
        }
    }

    fn set_status(&mut self, status: TorrentStatus) {
        if self.status != status {
            log::info!(
                "torrent {} status: {} -> {}",
                self.id,
                self.status,
                status
            );
            self.status = status;
            self.checkpoint_dirty = true;
        }
    }

    fn send_alert(&self, alert: Alert) {
        // broadcast send fails only when nobody subscribed, which is fine
        let _ = self.alert_chan.send(alert);
    }

    async fn load_checkpoint(&self) -> Option<Checkpoint> {
        let store = self.checkpoint_store.clone();
        let info_hash = self.info_hash;
        task::spawn_blocking(move || store.load(&info_hash))
            .await
            .expect("checkpoint load task panicked")
            .unwrap_or_else(|e| {
                log::warn!(
                    "failed to load checkpoint for {}: {}",
                    hex::encode(info_hash),
                    e
                );
                None
            })
    }

    /// Snapshots the torrent's progress to the checkpoint store (via the
    /// disk task, which serializes checkpoint writes).
    async fn save_checkpoint(&mut self) {
        let pieces = match &self.ctx {
            Some(ctx) => {
                ctx.piece_picker.read().await.own_pieces().clone()
            }
            // nothing worth recording before the storage exists
            None => return,
        };
        self.checkpoint_dirty = false;
        let checkpoint = Checkpoint {
            info_hash: self.info_hash,
            source: self.source.clone(),
            pieces,
            downloaded: self.total_downloaded(),
            uploaded: self.total_uploaded(),
            timestamp: unix_now(),
        };
        if let Err(e) = self.disk.save_checkpoint(self.id, checkpoint) {
            log::warn!(
                "failed to queue checkpoint for torrent {}: {}",
                self.id,
                e
            );
        }
    }

    /// Tears the torrent down.
    async fn shutdown(&mut self, exit: Exit) {
        log::info!("torrent {} shutting down", self.id);
        self.disconnect_all_peers();
        self.pending_event = Some(Event::Stopped);
        self.spawn_announce().await;

        match exit {
            Exit::Removed { delete_files } => {
                let _ = self.disk.remove_torrent(self.id, delete_files);
                self.send_alert(Alert::TorrentRemoved {
                    info_hash: self.info_hash,
                });
            }
            Exit::Shutdown => {
                self.save_checkpoint().await;
            }
        }
    }
}
