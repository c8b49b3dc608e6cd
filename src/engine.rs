//! The engine: the top level task that owns every torrent, the disk task,
//! the DHT node, and the peer listener.
//!
//! This is the public face of the crate. Commands go in through
//! [`EngineHandle`]; everything that happens afterwards comes back on the
//! broadcast alert stream. Command validation (torrent parsing, magnet
//! parsing) happens synchronously in the handle, so a caller holding an
//! info-hash knows the input was well formed.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, oneshot},
    task, time,
};
use tokio_util::codec::Framed;

use crate::{
    alert::{Alert, AlertSender, AlertStream, ALERT_QUEUE_LEN},
    checkpoint::{CheckpointFormat, CheckpointStore},
    conf::{Conf, TorrentConf},
    dht, disk,
    error::*,
    magnet::MagnetUri,
    metainfo::Metainfo,
    peer::codec::{Handshake, HandshakeCodec},
    piece_picker::PieceSelection,
    rate_limit::RateLimiter,
    torrent::{
        Torrent, TorrentCmd, TorrentKind, TorrentStats,
    },
    Sha1Hash, TorrentId,
};

/// Where a torrent comes from.
#[derive(Clone, Debug)]
pub enum TorrentSource {
    /// A `.torrent` file on disk.
    TorrentFile(PathBuf),
    /// The raw content of a `.torrent` file.
    TorrentBytes(Vec<u8>),
    /// A magnet link; the metainfo is fetched from the swarm.
    Magnet(String),
}

/// The per-add options of a torrent.
#[derive(Clone, Debug, Default)]
pub struct TorrentParams {
    /// Overrides of the engine's default torrent configuration.
    pub conf: Option<TorrentConf>,
    /// Overrides the configured piece selection strategy.
    pub piece_selection: Option<PieceSelection>,
    /// Restricts the download to these file indices (BEP 53 semantics).
    /// Pieces straddling a selected and an unselected file are still
    /// downloaded whole.
    pub selected_files: Option<Vec<usize>>,
}

/// Spawns the engine and returns its handle and join handle. Must be called
/// within an async runtime.
pub fn spawn(conf: Conf) -> Result<(EngineHandle, task::JoinHandle<Result<()>>)> {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let (alert_chan, _) = broadcast::channel(ALERT_QUEUE_LEN);

    let engine =
        Engine::new(conf, cmd_chan.clone(), cmd_port, alert_chan.clone());
    let join_handle = task::spawn(engine.run());

    Ok((
        EngineHandle {
            cmd_chan,
            alert_chan,
        },
        join_handle,
    ))
}

/// The handle through which the engine is controlled.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_chan: mpsc::UnboundedSender<Command>,
    alert_chan: AlertSender,
}

impl EngineHandle {
    /// Registers a torrent and starts (or resumes) it. Idempotent on the
    /// info-hash: adding a torrent that is already in the engine resumes it.
    ///
    /// Parse and validation failures are reported synchronously and leave
    /// the engine untouched.
    pub fn add_torrent(
        &self,
        source: TorrentSource,
        params: TorrentParams,
    ) -> Result<Sha1Hash> {
        let (kind, source_ref) = match source {
            TorrentSource::TorrentFile(path) => {
                let buf = std::fs::read(&path)?;
                let metainfo = Metainfo::from_bytes(&buf)?;
                (
                    TorrentKind::Full(Box::new(metainfo)),
                    Some(path.display().to_string()),
                )
            }
            TorrentSource::TorrentBytes(buf) => {
                let metainfo = Metainfo::from_bytes(&buf)?;
                (TorrentKind::Full(Box::new(metainfo)), None)
            }
            TorrentSource::Magnet(uri) => {
                let magnet = MagnetUri::parse(&uri)?;
                (TorrentKind::Magnet(Box::new(magnet)), Some(uri))
            }
        };
        let info_hash = match &kind {
            TorrentKind::Full(metainfo) => metainfo.info_hash,
            TorrentKind::Magnet(magnet) => magnet.info_hash,
        };
        if let Some(selected) = &params.selected_files {
            if let TorrentKind::Full(metainfo) = &kind {
                if selected
                    .iter()
                    .any(|file| *file >= metainfo.files.len())
                {
                    return Err(Error::InvalidConfig {
                        reason: "selected file index out of range".into(),
                    });
                }
            }
        }

        self.cmd_chan.send(Command::AddTorrent {
            kind,
            source: source_ref,
            params,
        })?;
        Ok(info_hash)
    }

    /// Stops a torrent's peer I/O, preserving its state and snapshotting a
    /// checkpoint.
    pub fn pause(&self, info_hash: Sha1Hash) -> Result<()> {
        self.cmd_chan.send(Command::Pause { info_hash })?;
        Ok(())
    }

    pub fn resume(&self, info_hash: Sha1Hash) -> Result<()> {
        self.cmd_chan.send(Command::Resume { info_hash })?;
        Ok(())
    }

    /// Removes a torrent, optionally deleting its files. Its checkpoint is
    /// removed either way.
    pub fn remove(
        &self,
        info_hash: Sha1Hash,
        delete_files: bool,
    ) -> Result<()> {
        self.cmd_chan.send(Command::Remove {
            info_hash,
            delete_files,
        })?;
        Ok(())
    }

    /// Overrides the torrent's rate limits. `None` lifts a limit.
    pub fn set_rate_limits(
        &self,
        info_hash: Sha1Hash,
        down: Option<u64>,
        up: Option<u64>,
    ) -> Result<()> {
        self.cmd_chan.send(Command::SetRateLimits {
            info_hash,
            down,
            up,
        })?;
        Ok(())
    }

    /// A one-shot snapshot of a torrent's state.
    pub async fn get_status(
        &self,
        info_hash: Sha1Hash,
    ) -> Result<TorrentStats> {
        let (reply, reply_port) = oneshot::channel();
        self.cmd_chan.send(Command::GetStatus { info_hash, reply })?;
        reply_port.await.map_err(|_| Error::TorrentNotFound)
    }

    /// Subscribes to the engine's event stream. Every subscriber sees every
    /// alert from the point of subscription on.
    pub fn subscribe(&self) -> AlertStream {
        AlertStream::new(self.alert_chan.subscribe())
    }

    /// Shuts the engine down: every torrent checkpoints and announces its
    /// departure.
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown)?;
        Ok(())
    }
}

enum Command {
    AddTorrent {
        kind: TorrentKind,
        source: Option<String>,
        params: TorrentParams,
    },
    Pause {
        info_hash: Sha1Hash,
    },
    Resume {
        info_hash: Sha1Hash,
    },
    Remove {
        info_hash: Sha1Hash,
        delete_files: bool,
    },
    SetRateLimits {
        info_hash: Sha1Hash,
        down: Option<u64>,
        up: Option<u64>,
    },
    GetStatus {
        info_hash: Sha1Hash,
        reply: oneshot::Sender<TorrentStats>,
    },
    /// An accepted connection with its already-decoded handshake.
    InboundPeer {
        socket: TcpStream,
        handshake: Handshake,
        read_buf: BytesMut,
    },
    Shutdown,
}

struct TorrentEntry {
    id: TorrentId,
    cmd_chan: mpsc::UnboundedSender<TorrentCmd>,
    join_handle: task::JoinHandle<Result<()>>,
}

struct Engine {
    conf: Conf,
    /// Our own command sender, cloned into helper tasks (the accept loop)
    /// so they can inject commands.
    cmd_chan: mpsc::UnboundedSender<Command>,
    cmd_port: mpsc::UnboundedReceiver<Command>,
    alert_chan: AlertSender,
    torrents: HashMap<Sha1Hash, TorrentEntry>,
    next_torrent_id: TorrentId,
}

impl Engine {
    fn new(
        conf: Conf,
        cmd_chan: mpsc::UnboundedSender<Command>,
        cmd_port: mpsc::UnboundedReceiver<Command>,
        alert_chan: AlertSender,
    ) -> Self {
        Self {
            conf,
            cmd_chan,
            cmd_port,
            alert_chan,
            torrents: HashMap::new(),
            next_torrent_id: 0,
        }
    }

    async fn run(mut self) -> Result<()> {
        log::info!("starting engine");
        let checkpoint_store = CheckpointStore::new(
            &self.conf.engine.state_dir,
            CheckpointFormat::Binary,
        );
        let (disk_join, disk) = disk::spawn(checkpoint_store.clone());
        // drop checkpoints of long-gone torrents
        let _ = disk
            .cleanup_checkpoints(self.conf.torrent.checkpoint_retention);

        // the listener accepts inbound peers and routes them here by
        // info-hash
        let listen_port = match self.conf.engine.listen_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr).await?;
                let port = listener.local_addr()?.port();
                log::info!("listening for peers on port {}", port);
                let cmd_chan = self.engine_chan();
                task::spawn(async move {
                    accept_loop(&mut listener, cmd_chan).await;
                });
                Some(port)
            }
            None => None,
        };

        let (dht_join, dht) = if self.conf.engine.enable_dht {
            let (join, handle) = dht::spawn(
                self.conf.engine.state_dir.clone(),
                self.conf.engine.dht_bootstrap_nodes.clone(),
            )
            .await?;
            (Some(join), Some(handle))
        } else {
            (None, None)
        };

        let global_limiter = Arc::new(RateLimiter::new(
            self.conf.engine.download_rate_limit,
            self.conf.engine.upload_rate_limit,
        ));
        let global_peer_count = Arc::new(AtomicUsize::new(0));

        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::AddTorrent {
                    kind,
                    source,
                    params,
                } => {
                    let info_hash = match &kind {
                        TorrentKind::Full(metainfo) => metainfo.info_hash,
                        TorrentKind::Magnet(magnet) => magnet.info_hash,
                    };
                    if let Some(entry) = self.torrents.get(&info_hash) {
                        // idempotent add: resume the existing torrent
                        log::info!(
                            "torrent {} already added, resuming",
                            hex::encode(info_hash)
                        );
                        let _ = entry.cmd_chan.send(TorrentCmd::Resume);
                        continue;
                    }

                    let id = self.next_torrent_id;
                    self.next_torrent_id += 1;

                    let mut conf = params
                        .conf
                        .clone()
                        .unwrap_or_else(|| self.conf.torrent.clone());
                    if let Some(selection) = params.piece_selection {
                        conf.piece_selection = selection;
                    }

                    let (torrent, cmd_chan) = Torrent::new(
                        crate::torrent::TorrentParams {
                            id,
                            kind,
                            source,
                            conf,
                            client_id: self.conf.engine.client_id,
                            listen_port,
                            disk: disk.clone(),
                            checkpoint_store: checkpoint_store.clone(),
                            global_limiter: Arc::clone(&global_limiter),
                            global_peer_count: Arc::clone(
                                &global_peer_count,
                            ),
                            max_global_peer_count: self
                                .conf
                                .engine
                                .max_global_peer_count,
                            dht: dht.clone(),
                            alert_chan: self.alert_chan.clone(),
                        },
                        params.selected_files,
                    );
                    let join_handle = task::spawn(torrent.start());
                    self.torrents.insert(
                        info_hash,
                        TorrentEntry {
                            id,
                            cmd_chan,
                            join_handle,
                        },
                    );
                    log::info!(
                        "added torrent {} ({})",
                        id,
                        hex::encode(info_hash)
                    );
                    let _ = self
                        .alert_chan
                        .send(Alert::TorrentAdded { info_hash });
                }
                Command::Pause { info_hash } => {
                    self.forward(&info_hash, TorrentCmd::Pause);
                }
                Command::Resume { info_hash } => {
                    self.forward(&info_hash, TorrentCmd::Resume);
                }
                Command::Remove {
                    info_hash,
                    delete_files,
                } => {
                    if let Some(entry) = self.torrents.remove(&info_hash) {
                        let _ = entry
                            .cmd_chan
                            .send(TorrentCmd::Remove { delete_files });
                        log::info!(
                            "removed torrent {} ({})",
                            entry.id,
                            hex::encode(info_hash)
                        );
                    } else {
                        log::warn!(
                            "remove: unknown torrent {}",
                            hex::encode(info_hash)
                        );
                    }
                }
                Command::SetRateLimits {
                    info_hash,
                    down,
                    up,
                } => {
                    self.forward(
                        &info_hash,
                        TorrentCmd::SetRateLimits { down, up },
                    );
                }
                Command::GetStatus { info_hash, reply } => {
                    // forwarding the caller's reply channel straight to the
                    // torrent; dropping it signals "not found"
                    self.forward(&info_hash, TorrentCmd::Status { reply });
                }
                Command::InboundPeer {
                    socket,
                    handshake,
                    read_buf,
                } => {
                    // a handshake for an info-hash we don't serve is
                    // dropped without a reply
                    if let Some(entry) =
                        self.torrents.get(&handshake.info_hash)
                    {
                        let _ = entry.cmd_chan.send(TorrentCmd::InboundPeer {
                            socket,
                            handshake,
                            read_buf,
                        });
                    } else {
                        log::debug!(
                            "inbound peer for unknown torrent {}",
                            hex::encode(handshake.info_hash)
                        );
                    }
                }
                Command::Shutdown => {
                    log::info!("shutting down engine");
                    for entry in self.torrents.values() {
                        let _ = entry.cmd_chan.send(TorrentCmd::Shutdown);
                    }
                    for (_, entry) in self.torrents.drain() {
                        if let Err(e) = entry.join_handle.await {
                            log::warn!(
                                "torrent {} task panicked: {}",
                                entry.id,
                                e
                            );
                        }
                    }
                    if let Some(dht) = &dht {
                        dht.shutdown();
                    }
                    if let Some(dht_join) = dht_join {
                        let _ = dht_join.await;
                    }
                    let _ = disk.shutdown();
                    let _ = disk_join.await;
                    let _ = self.alert_chan.send(Alert::Shutdown);
                    break;
                }
            }
        }
        log::info!("engine stopped");
        Ok(())
    }

    fn forward(&self, info_hash: &Sha1Hash, cmd: TorrentCmd) {
        match self.torrents.get(info_hash) {
            Some(entry) => {
                let _ = entry.cmd_chan.send(cmd);
            }
            None => log::warn!(
                "command for unknown torrent {}",
                hex::encode(info_hash)
            ),
        }
    }

    /// A sender that lets spawned helpers (the accept loop) inject commands.
    fn engine_chan(&self) -> mpsc::UnboundedSender<Command> {
        self.cmd_chan.clone()
    }
}

/// Accepts inbound connections, reads their handshake (we must know the
/// info-hash to route them), and hands them to the engine.
async fn accept_loop(
    listener: &mut TcpListener,
    cmd_chan: mpsc::UnboundedSender<Command>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                log::debug!("inbound connection from {}", addr);
                let cmd_chan = cmd_chan.clone();
                task::spawn(async move {
                    if let Err(e) =
                        read_inbound_handshake(socket, cmd_chan).await
                    {
                        log::debug!(
                            "inbound peer {} handshake failed: {}",
                            addr,
                            e
                        );
                    }
                });
            }
            Err(e) => {
                log::warn!("accept failed: {}", e);
                time::delay_for(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Reads the remote's handshake off a fresh inbound connection, with a
/// deadline, and forwards the connection to the engine for routing.
async fn read_inbound_handshake(
    socket: TcpStream,
    cmd_chan: mpsc::UnboundedSender<Command>,
) -> Result<()> {
    let mut socket = Framed::new(socket, HandshakeCodec);
    let handshake = time::timeout(Duration::from_secs(30), socket.next())
        .await
        .map_err(|_| Error::Channel)?
        .ok_or(Error::Channel)?
        .map_err(Error::Io)?;

    let parts = socket.into_parts();
    cmd_chan.send(Command::InboundPeer {
        socket: parts.io,
        handshake,
        read_buf: parts.read_buf,
    })?;
    Ok(())
}
