//! A peer session: one task per connected peer, owning the socket and the
//! per-peer protocol state machine.
//!
//! Sessions share the torrent's scheduler state through [`TorrentContext`]:
//! the piece picker and the per-piece download ledgers live behind torrent
//! wide locks, so the in-flight invariants hold across all sessions. A
//! session communicates upwards (to the torrent task) via messages and
//! receives commands (choke decisions, piece completions, endgame cancels,
//! disk read results) on its own channel.

pub(crate) mod codec;
mod error;
pub(crate) mod ext;
pub(crate) mod metadata;
mod state;

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use bytes::BytesMut;
use futures::{
    select,
    stream::{Fuse, SplitSink},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    download::{PieceDownload, ReceivedBlock},
    torrent::{TorrentContext, TorrentMsg},
    Bitfield, BlockInfo, PeerId, PieceIndex, BLOCK_LEN,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};
pub(crate) use error::PeerError;
use error::Result;
use ext::{ExtHandshake, MetadataMsg, PexMsg};
use state::{ConnState, SessionState};

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// The channel on which the torrent (and the disk task) can send a command
/// to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// A block read has completed and can be served to the peer.
    Block { info: BlockInfo, data: Vec<u8> },
    /// A piece was downloaded and verified: announce it with a have message
    /// and cancel our own outstanding duplicate requests for it.
    PieceCompleted { index: PieceIndex },
    /// Another session won an endgame race; cancel our copy of the request.
    CancelBlock { block: BlockInfo },
    /// The choker granted the peer an unchoke slot.
    Unchoke,
    /// The choker revoked the peer's unchoke slot.
    Choke,
    /// Send the peer a periodic peer exchange delta.
    SendPex(PexMsg),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    pub id: PeerId,
    /// All pieces peer has, kept in sync with the piece picker's
    /// availability counters.
    pub pieces: Bitfield,
    /// Features both sides support (the and of the reserved bits).
    pub supports_fast: bool,
    pub supports_extensions: bool,
    pub supports_dht: bool,
    /// The peer's extended handshake, once received.
    pub ext_handshake: Option<ExtHandshake>,
}

pub(crate) struct PeerSession {
    /// Shared state of the torrent this session belongs to.
    ctx: Arc<TorrentContext>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// Our own command sender, cloned into disk read requests so results
    /// come straight back to this session.
    cmd_chan: Sender,
    /// Session related state.
    state: SessionState,
    /// Information about the peer, set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// Our pending block requests that we sent to peer, with the time each
    /// was sent for timeout detection. If we receive a block that is not in
    /// this map, it counts as waste.
    outgoing_requests: HashMap<BlockInfo, Instant>,
    /// The peer's pending block requests to us.
    incoming_requests: HashSet<BlockInfo>,
    /// Pieces the peer lets us request even while it is choking us (BEP 6).
    allowed_fast: HashSet<PieceIndex>,
    /// The last time we accepted a pex message from this peer; incoming pex
    /// is rate limited to one message per 30 seconds.
    last_pex_time: Option<Instant>,
}

/// Incoming pex messages more frequent than this are dropped.
const PEX_RECV_INTERVAL: time::Duration = time::Duration::from_secs(30);

/// A keep-alive is sent if nothing else was sent for this long.
const KEEP_ALIVE_INTERVAL: time::Duration = time::Duration::from_secs(60);

impl PeerSession {
    /// Creates a new session with the peer at the given address, to be
    /// started with [`Self::start_outbound`] or [`Self::start_inbound`].
    pub fn new(
        ctx: Arc<TorrentContext>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                addr,
                cmd_port: cmd_port.fuse(),
                cmd_chan: cmd_chan.clone(),
                state: SessionState::default(),
                peer_info: None,
                outgoing_requests: HashMap::new(),
                incoming_requests: HashSet::new(),
                allowed_fast: HashSet::new(),
                last_pex_time: None,
            },
            cmd_chan,
        )
    }

    /// Connects to the peer and runs the session until disconnection. All
    /// outstanding requests are released back to the shared ledger on exit,
    /// whatever the exit reason.
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("connecting to peer {}", self.addr);
        self.state.conn_state = ConnState::Connecting;

        let result = self.connect_and_run().await;
        self.cleanup().await;
        result
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        let socket = time::timeout(
            self.ctx.conf.handshake_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;
        log::info!("connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state.conn_state = ConnState::Handshaking;
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        self.state.counters.up.protocol.add(handshake.len());
        socket.send(handshake).await?;

        let peer_handshake = time::timeout(
            self.ctx.conf.handshake_timeout,
            socket.next(),
        )
        .await
        .map_err(|_| PeerError::Timeout)?
        .ok_or(PeerError::NoHandshake)??;
        self.check_handshake(&peer_handshake)?;

        let socket = self.into_peer_codec(socket);
        self.run(socket).await
    }

    /// Runs an accepted session: the remote's handshake was already read by
    /// the engine's accept loop (it had to route the connection by
    /// info-hash), so we only send ours and proceed.
    pub async fn start_inbound(
        &mut self,
        socket: TcpStream,
        peer_handshake: Handshake,
        read_buf: BytesMut,
    ) -> Result<()> {
        log::info!("accepted connection from peer {}", self.addr);
        self.state.conn_state = ConnState::Handshaking;

        let result = self
            .accept_and_run(socket, peer_handshake, read_buf)
            .await;
        self.cleanup().await;
        result
    }

    async fn accept_and_run(
        &mut self,
        socket: TcpStream,
        peer_handshake: Handshake,
        read_buf: BytesMut,
    ) -> Result<()> {
        self.check_handshake(&peer_handshake)?;

        let mut parts = FramedParts::new(socket, HandshakeCodec);
        parts.read_buf = read_buf;
        let mut socket = Framed::from_parts(parts);

        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        self.state.counters.up.protocol.add(handshake.len());
        socket.send(handshake).await?;

        let socket = self.into_peer_codec(socket);
        self.run(socket).await
    }

    /// Validates the peer's handshake and records its identity and features.
    fn check_handshake(&mut self, peer_handshake: &Handshake) -> Result<()> {
        self.state
            .counters
            .down
            .protocol
            .add(peer_handshake.len());

        if peer_handshake.info_hash != self.ctx.info_hash {
            log::info!("peer {} handshake invalid info hash", self.addr);
            return Err(PeerError::InvalidInfoHash);
        }
        if peer_handshake.peer_id == self.ctx.client_id {
            log::info!("peer {} is ourselves", self.addr);
            return Err(PeerError::SelfConnection);
        }

        let ours = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        self.peer_info = Some(PeerInfo {
            id: peer_handshake.peer_id,
            pieces: Bitfield::repeat(false, self.ctx.storage.piece_count),
            supports_fast: ours.supports_fast()
                && peer_handshake.supports_fast(),
            supports_extensions: ours.supports_extensions()
                && peer_handshake.supports_extensions(),
            supports_dht: ours.supports_dht()
                && peer_handshake.supports_dht(),
            ext_handshake: None,
        });
        let _ = self.ctx.torrent_tx.send(TorrentMsg::PeerConnected {
            addr: self.addr,
            id: peer_handshake.peer_id,
        });
        Ok(())
    }

    /// Switches the connection to the peer message codec, keeping whatever
    /// bytes the peer may have sent right after its handshake.
    fn into_peer_codec(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Framed<TcpStream, PeerCodec> {
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Framed::from_parts(new_parts)
    }

    /// Runs the session after the handshakes: announces our initial state,
    /// then drives the main message loop.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        self.state.connect_time = Some(Instant::now());
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        self.state.conn_state = ConnState::AvailabilityExchange;
        self.send_initial_state(&mut sink).await?;

        let mut tick_timer =
            time::interval(time::Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => {
                            // the peer closed the connection
                            log::info!("peer {} disconnected", self.addr);
                            return Ok(());
                        }
                    };
                    self.state.last_incoming_msg_time = Some(Instant::now());
                    self.state
                        .counters
                        .down
                        .protocol
                        .add(msg.protocol_len());

                    if self.state.conn_state
                        == ConnState::AvailabilityExchange
                    {
                        self.handle_initial_availability(&mut sink, msg)
                            .await?;
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match self.handle_cmd(&mut sink, cmd).await {
                        Err(PeerError::Shutdown) => {
                            log::info!(
                                "shutting down peer {} session",
                                self.addr
                            );
                            return Ok(());
                        }
                        result => result?,
                    }
                }
                _ = tick_timer.select_next_some() => {
                    self.tick(&mut sink).await?;
                }
            }
        }
    }

    /// Sends our initial piece availability, the extended handshake, and the
    /// DHT port, depending on the negotiated features.
    async fn send_initial_state(
        &mut self,
        sink: &mut MessageSink,
    ) -> Result<()> {
        let own_pieces =
            self.ctx.piece_picker.read().await.own_pieces().clone();
        let (fast, extensions, dht) = match &self.peer_info {
            Some(info) => (
                info.supports_fast,
                info.supports_extensions,
                info.supports_dht,
            ),
            None => return Err(PeerError::NoHandshake),
        };

        if fast && own_pieces.all() {
            self.send_msg(sink, Message::HaveAll).await?;
        } else if fast && own_pieces.not_any() {
            self.send_msg(sink, Message::HaveNone).await?;
        } else if own_pieces.any() {
            self.send_msg(sink, Message::Bitfield(own_pieces)).await?;
        }

        if extensions {
            let handshake =
                ExtHandshake::ours(self.ctx.listen_port, None);
            self.send_msg(
                sink,
                Message::Extended {
                    id: ext::EXT_HANDSHAKE_ID,
                    payload: handshake.encode(),
                },
            )
            .await?;
        }

        if dht {
            if let Some(port) = self.ctx.dht_port {
                self.send_msg(sink, Message::Port(port)).await?;
            }
        }
        Ok(())
    }

    /// Handles the first message after the handshake, which may announce the
    /// peer's initial piece availability. The standard allows a bitfield, the
    /// fast extension's have-all/have-none, or nothing at all (meaning the
    /// peer has no pieces yet), in which case the message is processed
    /// normally.
    async fn handle_initial_availability(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        debug_assert_eq!(
            self.state.conn_state,
            ConnState::AvailabilityExchange
        );
        let piece_count = self.ctx.storage.piece_count;
        let supports_fast = self
            .peer_info
            .as_ref()
            .map(|info| info.supports_fast)
            .unwrap_or_default();

        let pieces = match &msg {
            Message::Bitfield(bitfield) => {
                // The bitfield raw data that is sent over the wire may be
                // longer than the logical pieces it represents, if the number
                // of pieces in torrent is not a multiple of 8. Slice off the
                // overhang.
                let mut bitfield = bitfield.clone();
                if bitfield.len() < piece_count {
                    return Err(PeerError::InvalidMessage);
                }
                bitfield.resize(piece_count, false);
                Some(bitfield)
            }
            Message::HaveAll if supports_fast => {
                Some(Bitfield::repeat(true, piece_count))
            }
            Message::HaveNone if supports_fast => {
                Some(Bitfield::repeat(false, piece_count))
            }
            Message::HaveAll | Message::HaveNone => {
                // fast extension messages from a peer that didn't negotiate
                // the fast extension
                return Err(PeerError::InvalidMessage);
            }
            _ => None,
        };

        self.state.conn_state = ConnState::Connected;
        log::info!(
            "peer {} session state: {:?}",
            self.addr,
            self.state.conn_state
        );

        match pieces {
            Some(pieces) => {
                self.register_peer_pieces(sink, pieces).await?;
            }
            None => {
                // no availability announcement: the peer has no pieces; the
                // message itself is an ordinary one
                self.handle_msg(sink, msg).await?;
            }
        }
        Ok(())
    }

    /// Registers the peer's announced pieces with the picker and sends
    /// interested if the peer has anything we want.
    async fn register_peer_pieces(
        &mut self,
        sink: &mut MessageSink,
        pieces: Bitfield,
    ) -> Result<()> {
        log::info!(
            "peer {} has {}/{} pieces",
            self.addr,
            pieces.count_ones(),
            pieces.len()
        );
        let is_interested = self
            .ctx
            .piece_picker
            .write()
            .await
            .register_peer_pieces(&pieces);
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = pieces;
        }
        self.update_interest(sink, is_interested).await?;
        self.make_requests(sink).await
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        log::debug!(
            "received message from peer {}: {:?}",
            self.addr,
            msg.id()
        );
        match msg {
            Message::Bitfield(_) => {
                log::warn!(
                    "peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(PeerError::UnexpectedBitfield);
            }
            Message::KeepAlive => {
                log::trace!("peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.state.is_choked {
                    log::info!("peer {} choked us", self.addr);
                    self.state.is_choked = true;
                    // the peer may or may not serve what it already has
                    // queued; release everything so other sessions can pick
                    // the blocks up (a late block is still accepted)
                    self.free_outgoing_requests().await;
                }
            }
            Message::Unchoke => {
                if self.state.is_choked {
                    log::info!("peer {} unchoked us", self.addr);
                    self.state.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.state.is_peer_interested {
                    log::info!("peer {} is interested", self.addr);
                    self.state.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.state.is_peer_interested {
                    log::info!("peer {} is not interested", self.addr);
                    self.state.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.handle_have(sink, piece_index).await?;
            }
            Message::Request(block) => {
                self.handle_request(sink, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block(block_info, data).await?;
                // a retired request frees pipeline capacity
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                self.incoming_requests.remove(&block);
            }
            Message::Port(port) => {
                let _ = self.ctx.torrent_tx.send(TorrentMsg::DhtPort {
                    ip: self.addr.ip(),
                    port,
                });
            }
            Message::Suggest { piece_index } => {
                log::debug!(
                    "peer {} suggests piece {}",
                    self.addr,
                    piece_index
                );
            }
            Message::HaveAll | Message::HaveNone => {
                // only valid as the initial availability announcement
                return Err(PeerError::InvalidMessage);
            }
            Message::Reject(block) => {
                if self.outgoing_requests.remove(&block).is_some() {
                    self.free_block(&block).await;
                }
            }
            Message::AllowedFast { piece_index } => {
                if piece_index < self.ctx.storage.piece_count {
                    self.allowed_fast.insert(piece_index);
                }
            }
            Message::Extended { id, payload } => {
                self.handle_extended(sink, id, payload).await?;
            }
        }
        Ok(())
    }

    async fn handle_have(
        &mut self,
        sink: &mut MessageSink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        if piece_index >= self.ctx.storage.piece_count {
            log::warn!(
                "peer {} sent have with invalid piece {}",
                self.addr,
                piece_index
            );
            return Err(PeerError::InvalidMessage);
        }
        let already_has = match &self.peer_info {
            Some(info) => info.pieces[piece_index],
            None => return Err(PeerError::NoHandshake),
        };
        if already_has {
            return Ok(());
        }
        if let Some(info) = &mut self.peer_info {
            info.pieces.set(piece_index, true);
        }
        let is_interested = self
            .ctx
            .piece_picker
            .write()
            .await
            .register_have(piece_index);
        if is_interested && !self.state.is_interested {
            self.update_interest(sink, true).await?;
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Handles a peer's block request: validated, then handed to the disk
    /// task, whose read result comes back as a command.
    async fn handle_request(
        &mut self,
        sink: &mut MessageSink,
        block: BlockInfo,
    ) -> Result<()> {
        log::debug!("peer {} requested {}", self.addr, block);
        let supports_fast = self
            .peer_info
            .as_ref()
            .map(|info| info.supports_fast)
            .unwrap_or_default();

        // geometry first: an out of bounds request is a protocol violation
        let piece_len = self
            .ctx
            .storage
            .piece_len(block.piece_index)
            .map_err(|_| PeerError::InvalidMessage)?;
        let in_bounds = block
            .offset
            .checked_add(block.len)
            .map(|end| end <= piece_len)
            .unwrap_or(false);
        if block.len == 0 || block.len > BLOCK_LEN || !in_bounds {
            return Err(PeerError::InvalidMessage);
        }

        // requests while choked and requests for unverified pieces are
        // declined, with a reject if the fast extension is up
        let have_piece =
            self.ctx.piece_picker.read().await.own_pieces()[block.piece_index];
        if self.state.is_peer_choked || !have_piece {
            log::debug!(
                "declining request from peer {} (choked: {})",
                self.addr,
                self.state.is_peer_choked
            );
            if supports_fast {
                self.send_msg(sink, Message::Reject(block)).await?;
            }
            return Ok(());
        }

        if self.incoming_requests.contains(&block) {
            log::warn!("peer {} sent duplicate request", self.addr);
            return Ok(());
        }
        self.incoming_requests.insert(block);
        self.ctx
            .disk
            .read_block(self.ctx.id, block, self.cmd_chan.clone())
            .map_err(|_| PeerError::Channel)?;
        Ok(())
    }

    /// Verifies block validity, pays the download rate-limit cost, registers
    /// the block with the shared ledger, and hands it to the disk task.
    async fn handle_block(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!("received block from peer {}: {}", self.addr, block_info);

        let request_time =
            match self.outgoing_requests.remove(&block_info) {
                Some(sent_at) => sent_at,
                None => {
                    // either never requested or already cancelled; the bytes
                    // are wasted either way
                    log::debug!(
                        "peer {} sent block we didn't expect: {}",
                        self.addr,
                        block_info
                    );
                    self.state.counters.waste.add(block_info.len as u64);
                    return Ok(());
                }
            };

        // the download cost is paid before the block is accepted into the
        // engine; an over-limit session parks here and backpressures the
        // socket
        self.ctx
            .global_limiter
            .acquire_down(block_info.len as u64)
            .await;
        self.ctx
            .rate_limiter
            .acquire_down(block_info.len as u64)
            .await;

        self.state.last_incoming_block_time = Some(Instant::now());
        self.state.update_request_timings(
            request_time.elapsed(),
            self.ctx.conf.pipeline_depth,
        );

        let download = self
            .ctx
            .downloads
            .read()
            .await
            .get(&block_info.piece_index)
            .cloned();
        let download = match download {
            Some(download) => download,
            None => {
                // the piece may have completed via other peers and left the
                // ledger while this copy was in flight
                self.state.counters.waste.add(block_info.len as u64);
                return Ok(());
            }
        };

        match download
            .write()
            .await
            .received_block(&block_info, self.addr)
        {
            ReceivedBlock::Accepted { cancel } => {
                self.state
                    .counters
                    .down
                    .payload
                    .add(block_info.len as u64);
                if !cancel.is_empty() {
                    let _ = self.ctx.torrent_tx.send(
                        TorrentMsg::BlockCancellations {
                            block: block_info,
                            peers: cancel,
                        },
                    );
                }
                self.ctx
                    .disk
                    .write_block(self.ctx.id, block_info, data)
                    .map_err(|_| PeerError::Channel)?;
            }
            ReceivedBlock::Duplicate => {
                log::debug!(
                    "block {} already received (endgame race)",
                    block_info
                );
                self.state.counters.waste.add(block_info.len as u64);
            }
            ReceivedBlock::Invalid => {
                return Err(PeerError::InvalidMessage);
            }
        }
        Ok(())
    }

    /// Handles a BEP 10 extended message.
    async fn handle_extended(
        &mut self,
        sink: &mut MessageSink,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        let supports_extensions = self
            .peer_info
            .as_ref()
            .map(|info| info.supports_extensions)
            .unwrap_or_default();
        if !supports_extensions {
            return Err(PeerError::InvalidMessage);
        }

        match id {
            ext::EXT_HANDSHAKE_ID => {
                let handshake = ExtHandshake::decode(&payload)
                    .map_err(|_| PeerError::InvalidMessage)?;
                log::debug!(
                    "peer {} extensions: {:?}",
                    self.addr,
                    handshake
                );
                if let Some(info) = &mut self.peer_info {
                    info.ext_handshake = Some(handshake);
                }
            }
            ext::OUR_METADATA_ID => {
                let msg = MetadataMsg::decode(&payload)
                    .map_err(|_| PeerError::InvalidMessage)?;
                if let MetadataMsg::Request { piece } = msg {
                    // we don't retain the raw info dictionary, so metadata
                    // requests are rejected
                    let peer_metadata_id = self
                        .peer_info
                        .as_ref()
                        .and_then(|info| info.ext_handshake.as_ref())
                        .and_then(|handshake| handshake.metadata_id);
                    if let Some(peer_metadata_id) = peer_metadata_id {
                        self.send_msg(
                            sink,
                            Message::Extended {
                                id: peer_metadata_id,
                                payload: MetadataMsg::Reject { piece }
                                    .encode(),
                            },
                        )
                        .await?;
                    }
                }
            }
            ext::OUR_PEX_ID => {
                if self.ctx.is_private {
                    // BEP 27: a private torrent ignores received pex and
                    // never re-announces it
                    return Ok(());
                }
                if let Some(last) = self.last_pex_time {
                    if last.elapsed() < PEX_RECV_INTERVAL {
                        log::debug!(
                            "peer {} sends pex too frequently",
                            self.addr
                        );
                        return Ok(());
                    }
                }
                self.last_pex_time = Some(Instant::now());
                let msg = PexMsg::decode(&payload)
                    .map_err(|_| PeerError::InvalidMessage)?;
                let _ = self.ctx.torrent_tx.send(TorrentMsg::Pex {
                    from: self.addr,
                    added: msg.added,
                    dropped: msg.dropped,
                });
            }
            // unknown extended ids are ignored silently
            _ => {}
        }
        Ok(())
    }

    /// Executes a command sent by the torrent or the disk task.
    async fn handle_cmd(
        &mut self,
        sink: &mut MessageSink,
        cmd: Command,
    ) -> Result<()> {
        match cmd {
            Command::Block { info, data } => {
                self.send_block(sink, info, data).await?;
            }
            Command::PieceCompleted { index } => {
                self.handle_piece_completed(sink, index).await?;
            }
            Command::CancelBlock { block } => {
                if self.outgoing_requests.remove(&block).is_some() {
                    self.send_msg(sink, Message::Cancel(block)).await?;
                }
            }
            Command::Unchoke => {
                if self.state.is_peer_choked {
                    self.state.is_peer_choked = false;
                    self.send_msg(sink, Message::Unchoke).await?;
                }
            }
            Command::Choke => {
                if !self.state.is_peer_choked {
                    self.state.is_peer_choked = true;
                    // whatever the peer had queued won't be served
                    self.incoming_requests.clear();
                    self.send_msg(sink, Message::Choke).await?;
                }
            }
            Command::SendPex(pex) => {
                let peer_pex_id = self
                    .peer_info
                    .as_ref()
                    .and_then(|info| info.ext_handshake.as_ref())
                    .and_then(|handshake| handshake.pex_id);
                if let Some(id) = peer_pex_id {
                    self.send_msg(
                        sink,
                        Message::Extended {
                            id,
                            payload: pex.encode(),
                        },
                    )
                    .await?;
                }
            }
            Command::Shutdown => {
                return Err(PeerError::Shutdown);
            }
        }
        Ok(())
    }

    /// Serves a block read from disk, paying the upload rate-limit cost
    /// before the frame goes out.
    async fn send_block(
        &mut self,
        sink: &mut MessageSink,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        if !self.incoming_requests.remove(&info) {
            // cancelled while the read was in flight
            log::debug!("block {} read but request cancelled", info);
            return Ok(());
        }
        self.ctx.global_limiter.acquire_up(info.len as u64).await;
        self.ctx.rate_limiter.acquire_up(info.len as u64).await;

        self.state.counters.up.payload.add(info.len as u64);
        self.send_msg(
            sink,
            Message::Block {
                piece_index: info.piece_index,
                offset: info.offset,
                data,
            },
        )
        .await
    }

    /// Reacts to a piece our torrent verified: announce it, drop our own
    /// now-pointless duplicate requests for it, and re-evaluate interest.
    async fn handle_piece_completed(
        &mut self,
        sink: &mut MessageSink,
        index: PieceIndex,
    ) -> Result<()> {
        let peer_has_piece = match &self.peer_info {
            Some(info) => info.pieces[index],
            None => return Ok(()),
        };
        if !peer_has_piece {
            self.send_msg(sink, Message::Have { piece_index: index })
                .await?;
        }

        // endgame: this session may still have requests out for the piece
        let stale: Vec<BlockInfo> = self
            .outgoing_requests
            .keys()
            .filter(|block| block.piece_index == index)
            .copied()
            .collect();
        for block in stale {
            self.outgoing_requests.remove(&block);
            self.send_msg(sink, Message::Cancel(block)).await?;
        }

        // seeding the last piece may end our interest in this peer
        if self.state.is_interested {
            let still_interested = match &self.peer_info {
                Some(info) => self
                    .ctx
                    .piece_picker
                    .read()
                    .await
                    .interested_in(&info.pieces),
                None => false,
            };
            if !still_interested {
                self.update_interest(sink, false).await?;
            }
        }
        Ok(())
    }

    /// Fills the session's request pipeline up to its adaptive target.
    ///
    /// Ongoing piece downloads are continued before new pieces are started,
    /// which keeps the number of partial pieces low. While the peer chokes
    /// us, only allowed-fast pieces may be requested.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.state.conn_state != ConnState::Connected
            || !self.state.is_interested
        {
            return Ok(());
        }

        let peer_pieces = match &self.peer_info {
            Some(info) => info.pieces.clone(),
            None => return Ok(()),
        };
        let target = self.state.target_request_queue_len;
        if self.outgoing_requests.len() >= target {
            return Ok(());
        }
        let mut capacity = target - self.outgoing_requests.len();
        let in_endgame = self.ctx.in_endgame.load(Ordering::Relaxed);
        let max_duplicates = self.ctx.conf.endgame_duplicates;
        let mut blocks = Vec::with_capacity(capacity);

        if self.state.is_choked {
            // BEP 6: allowed-fast pieces may be requested while choked
            let allowed: Vec<PieceIndex> =
                self.allowed_fast.iter().copied().collect();
            for index in allowed {
                if capacity == 0 {
                    break;
                }
                if !peer_pieces[index] {
                    continue;
                }
                capacity -= self
                    .pick_from_piece(
                        index,
                        capacity,
                        &mut blocks,
                        in_endgame,
                        max_duplicates,
                    )
                    .await;
            }
        } else {
            // continue the downloads already in progress
            let downloads: Vec<(PieceIndex, Arc<RwLock<PieceDownload>>)> =
                self.ctx
                    .downloads
                    .read()
                    .await
                    .iter()
                    .map(|(index, download)| (*index, Arc::clone(download)))
                    .collect();
            for (index, download) in downloads {
                if capacity == 0 {
                    break;
                }
                if !peer_pieces[index] {
                    continue;
                }
                let picked_from = blocks.len();
                download.write().await.pick_blocks(
                    capacity,
                    self.addr,
                    &mut blocks,
                    in_endgame,
                    max_duplicates,
                );
                capacity -= blocks.len() - picked_from;
            }

            // then start new piece downloads
            while capacity > 0 {
                let index = match self
                    .ctx
                    .piece_picker
                    .write()
                    .await
                    .pick_piece(&peer_pieces)
                {
                    Some(index) => index,
                    None => break,
                };
                log::debug!(
                    "session {} starting piece {} download",
                    self.addr,
                    index
                );
                let piece_len = match self.ctx.storage.piece_len(index) {
                    Ok(len) => len,
                    Err(_) => break,
                };
                let mut download = PieceDownload::new(index, piece_len);
                let picked_from = blocks.len();
                download.pick_blocks(
                    capacity,
                    self.addr,
                    &mut blocks,
                    in_endgame,
                    max_duplicates,
                );
                capacity -= blocks.len() - picked_from;
                self.ctx
                    .downloads
                    .write()
                    .await
                    .insert(index, Arc::new(RwLock::new(download)));
            }
        }

        if blocks.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        if self.outgoing_requests.is_empty() {
            self.state.last_outgoing_request_time = Some(now);
        }
        for block in blocks {
            self.outgoing_requests.insert(block, now);
            self.send_msg(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    /// Picks blocks of one specific piece (the allowed-fast path), creating
    /// the shared download ledger for it if the piece is still assignable.
    async fn pick_from_piece(
        &mut self,
        index: PieceIndex,
        capacity: usize,
        blocks: &mut Vec<BlockInfo>,
        in_endgame: bool,
        max_duplicates: usize,
    ) -> usize {
        let picked_from = blocks.len();
        let existing = self.ctx.downloads.read().await.get(&index).cloned();
        match existing {
            Some(download) => {
                download.write().await.pick_blocks(
                    capacity,
                    self.addr,
                    blocks,
                    in_endgame,
                    max_duplicates,
                );
            }
            None => {
                if !self.ctx.piece_picker.write().await.pick_specific(index) {
                    return 0;
                }
                let piece_len = match self.ctx.storage.piece_len(index) {
                    Ok(len) => len,
                    Err(_) => return 0,
                };
                let mut download = PieceDownload::new(index, piece_len);
                download.pick_blocks(
                    capacity,
                    self.addr,
                    blocks,
                    in_endgame,
                    max_duplicates,
                );
                self.ctx
                    .downloads
                    .write()
                    .await
                    .insert(index, Arc::new(RwLock::new(download)));
            }
        }
        blocks.len() - picked_from
    }

    /// The per-second bookkeeping: counter rounds, request timeouts,
    /// keep-alives, idle detection, and the stats report to the torrent.
    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        self.state.tick();

        // cancel requests that have been out for too long and give the
        // blocks back to the scheduler
        let request_timeout = self.ctx.conf.request_timeout;
        let timed_out: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(_, sent_at)| sent_at.elapsed() > request_timeout)
            .map(|(block, _)| *block)
            .collect();
        for block in timed_out {
            log::debug!(
                "request {} to peer {} timed out",
                block,
                self.addr
            );
            self.outgoing_requests.remove(&block);
            self.free_block(&block).await;
            self.send_msg(sink, Message::Cancel(block)).await?;
        }

        // a peer that sends us nothing at all for too long is dead weight
        if let Some(last_incoming) = self.state.last_incoming_msg_time {
            let idle = last_incoming.elapsed();
            if idle > self.ctx.conf.peer_idle_timeout {
                log::info!("peer {} timed out", self.addr);
                return Err(PeerError::Timeout);
            }
        }

        // keep the connection alive from our side; a session that never sent
        // anything yet counts as idle since connecting
        let since_outgoing = self
            .state
            .last_outgoing_msg_time
            .or(self.state.connect_time)
            .map(|last| last.elapsed())
            .unwrap_or_default();
        if since_outgoing > KEEP_ALIVE_INTERVAL {
            self.send_msg(sink, Message::KeepAlive).await?;
        }

        // top the pipeline back up (timeouts may have freed capacity)
        self.make_requests(sink).await?;

        let info = SessionInfo {
            download_rate: self.state.counters.down.payload.avg_rate(),
            upload_rate: self.state.counters.up.payload.avg_rate(),
            downloaded_payload: self.state.counters.down.payload.total(),
            uploaded_payload: self.state.counters.up.payload.total(),
            wasted: self.state.counters.waste.total(),
            is_peer_interested: self.state.is_peer_interested,
            is_peer_choked: self.state.is_peer_choked,
            is_interested: self.state.is_interested,
            is_choked: self.state.is_choked,
            is_snubbed: self.state.is_snubbed(),
        };
        let _ = self
            .ctx
            .torrent_tx
            .send(TorrentMsg::PeerState {
                addr: self.addr,
                info,
            });
        Ok(())
    }

    /// Announces or retracts our interest in the peer.
    async fn update_interest(
        &mut self,
        sink: &mut MessageSink,
        is_interested: bool,
    ) -> Result<()> {
        if !self.state.is_interested && is_interested {
            self.state.is_interested = true;
            log::info!("interested in peer {}", self.addr);
            self.send_msg(sink, Message::Interested).await?;
        } else if self.state.is_interested && !is_interested {
            self.state.is_interested = false;
            log::info!("no longer interested in peer {}", self.addr);
            self.send_msg(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    async fn send_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        self.state.counters.up.protocol.add(msg.protocol_len());
        self.state.last_outgoing_msg_time = Some(Instant::now());
        sink.send(msg).await?;
        Ok(())
    }

    /// Returns a single outstanding block to the shared ledger.
    async fn free_block(&self, block: &BlockInfo) {
        let download =
            self.ctx.downloads.read().await.get(&block.piece_index).cloned();
        if let Some(download) = download {
            download.write().await.free_block(block, self.addr);
        }
    }

    /// Returns every outstanding block to the shared ledger.
    async fn free_outgoing_requests(&mut self) {
        self.outgoing_requests.clear();
        let downloads = self.ctx.downloads.read().await;
        for download in downloads.values() {
            download.write().await.release_peer_blocks(self.addr);
        }
    }

    /// Releases everything the session holds. Runs on every exit path, so a
    /// dying session can never strand in-flight blocks or availability
    /// counts.
    async fn cleanup(&mut self) {
        self.state.conn_state = ConnState::Disconnecting;
        self.free_outgoing_requests().await;
        self.incoming_requests.clear();

        if let Some(peer_info) = &self.peer_info {
            log::info!(
                "peer {} ({}) disconnected",
                self.addr,
                String::from_utf8_lossy(&peer_info.id)
            );
            if peer_info.pieces.any() {
                self.ctx
                    .piece_picker
                    .write()
                    .await
                    .unregister_peer_pieces(&peer_info.pieces);
            }
        }
        let _ = self
            .ctx
            .torrent_tx
            .send(TorrentMsg::PeerDisconnected { addr: self.addr });
        self.state.conn_state = ConnState::Disconnected;
    }
}

/// The per-second state snapshot a session reports to its torrent, the input
/// of the choker and of the torrent's aggregated stats.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SessionInfo {
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded_payload: u64,
    pub uploaded_payload: u64,
    pub wasted: u64,
    pub is_peer_interested: bool,
    pub is_peer_choked: bool,
    pub is_interested: bool,
    pub is_choked: bool,
    pub is_snubbed: bool,
}
