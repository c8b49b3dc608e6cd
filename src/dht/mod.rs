//! The mainline DHT node (BEP 5): trackerless peer discovery over Kademlia.
//!
//! One DHT node serves every torrent in the engine. It is an actor: a single
//! task owns the UDP socket, the routing table, the peer store, and the
//! iterative lookups in progress; the rest of the engine talks to it through
//! [`DhtHandle`]. Lookup results stream back on the channel the requester
//! provided.

mod krpc;
mod routing;

use std::{
    collections::{HashMap, HashSet},
    net::{SocketAddr, SocketAddrV4},
    path::PathBuf,
    time::{Duration, Instant},
};

use futures::{select, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{
    net::{
        udp::{RecvHalf, SendHalf},
        UdpSocket,
    },
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task, time,
};

use crate::{error::*, Sha1Hash};
use krpc::{CompactNode, Message, QueryKind, Response};
use routing::{Node, NodeId, RoutingTable, K};

/// The concurrency of an iterative lookup.
const ALPHA: usize = 3;

/// An outstanding query is given up after this long.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Announced peers are served for this long (the BEP suggests ~30 minutes).
const PEER_TTL: Duration = Duration::from_secs(30 * 60);

/// The write token secret rotates at this cadence; tokens from the previous
/// secret are still accepted.
const SECRET_ROTATION: Duration = Duration::from_secs(5 * 60);

/// How often a random-target lookup refreshes the routing table.
const REFRESH_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// How often the routing table is persisted.
const TABLE_SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The file the routing table is persisted to, under the engine state dir.
const TABLE_FILE: &str = "dht.nodes";

/// Spawns the DHT node task. The returned handle carries the UDP port the
/// node listens on, which peer sessions announce in `Port` messages.
pub(crate) async fn spawn(
    state_dir: PathBuf,
    bootstrap_nodes: Vec<String>,
) -> Result<(task::JoinHandle<Result<()>>, DhtHandle)> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let port = socket.local_addr()?.port();
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

    let dht = Dht::new(state_dir, bootstrap_nodes);
    log::info!("DHT node {:?} listening on UDP port {}", dht.own_id(), port);
    let join_handle = task::spawn(dht.run(socket, cmd_port));
    Ok((join_handle, DhtHandle { cmd_chan, port }))
}

/// The handle through which torrents use the DHT.
#[derive(Clone)]
pub(crate) struct DhtHandle {
    cmd_chan: UnboundedSender<Command>,
    /// The UDP port of the node, announced to peers via `Port` messages.
    pub port: u16,
}

impl DhtHandle {
    /// Starts an iterative `get_peers` lookup; discovered endpoints arrive
    /// on the given channel, one batch per responding node.
    pub fn get_peers(
        &self,
        info_hash: Sha1Hash,
        sink: UnboundedSender<Vec<SocketAddr>>,
    ) {
        let _ = self.cmd_chan.send(Command::GetPeers { info_hash, sink });
    }

    /// Announces that we serve the torrent on the given TCP port: the
    /// closest nodes to the info-hash are told to remember us.
    pub fn announce(&self, info_hash: Sha1Hash, port: u16) {
        let _ = self.cmd_chan.send(Command::Announce { info_hash, port });
    }

    /// Feeds a node learned out of band (e.g. a peer's `Port` message).
    pub fn add_node(&self, addr: SocketAddr) {
        let _ = self.cmd_chan.send(Command::AddNode { addr });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_chan.send(Command::Shutdown);
    }
}

enum Command {
    GetPeers {
        info_hash: Sha1Hash,
        sink: UnboundedSender<Vec<SocketAddr>>,
    },
    Announce {
        info_hash: Sha1Hash,
        port: u16,
    },
    AddNode {
        addr: SocketAddr,
    },
    Shutdown,
}

/// Why a query is outstanding, which decides what its response feeds.
enum QueryPurpose {
    /// Table maintenance: pings and bootstrap/refresh find_nodes.
    Maintenance,
    /// Part of an iterative lookup.
    Lookup { lookup_id: u64 },
}

struct PendingQuery {
    node_id: Option<NodeId>,
    addr: SocketAddrV4,
    sent_at: Instant,
    purpose: QueryPurpose,
}

/// An iterative get_peers lookup converging on the nodes closest to the
/// target.
struct Lookup {
    target: NodeId,
    /// Set when the lookup should finish with announce_peer to the closest
    /// responders.
    announce_port: Option<u16>,
    /// Where found peers are streamed; `None` for pure announce lookups.
    sink: Option<UnboundedSender<Vec<SocketAddr>>>,
    /// Candidate nodes, kept sorted by distance to the target.
    candidates: Vec<CompactNode>,
    queried: HashSet<SocketAddrV4>,
    inflight: usize,
    /// Nodes that responded, with their write tokens.
    responders: Vec<(CompactNode, Vec<u8>)>,
}

struct Dht {
    table: RoutingTable,
    pending: HashMap<Vec<u8>, PendingQuery>,
    next_tid: u16,
    lookups: HashMap<u64, Lookup>,
    next_lookup_id: u64,
    /// The peers announced to us, per info-hash.
    stored_peers: HashMap<Sha1Hash, HashMap<SocketAddr, Instant>>,
    token_secret: [u8; 8],
    prev_token_secret: [u8; 8],
    last_secret_rotation: Instant,
    last_refresh: Instant,
    last_table_save: Instant,
    state_dir: PathBuf,
    bootstrap_nodes: Vec<String>,
}

impl Dht {
    fn new(state_dir: PathBuf, bootstrap_nodes: Vec<String>) -> Self {
        let own_id = NodeId::random();
        let secret: [u8; 8] = rand::random();
        Self {
            table: RoutingTable::new(own_id),
            pending: HashMap::new(),
            next_tid: rand::random(),
            lookups: HashMap::new(),
            next_lookup_id: 0,
            stored_peers: HashMap::new(),
            token_secret: secret,
            prev_token_secret: secret,
            last_secret_rotation: Instant::now(),
            last_refresh: Instant::now(),
            last_table_save: Instant::now(),
            state_dir,
            bootstrap_nodes,
        }
    }

    fn own_id(&self) -> NodeId {
        self.table.own_id()
    }

    async fn run(
        mut self,
        socket: UdpSocket,
        cmd_port: UnboundedReceiver<Command>,
    ) -> Result<()> {
        self.load_table();

        // the receive half lives in its own task forwarding datagrams here,
        // so the main loop only ever selects over channels
        let (recv_half, mut send_half) = socket.split();
        let (datagram_chan, datagram_port) = mpsc::unbounded_channel();
        task::spawn(recv_loop(recv_half, datagram_chan));

        self.bootstrap(&mut send_half).await;

        let mut datagram_port = datagram_port.fuse();
        let mut cmd_port = cmd_port.fuse();
        let mut tick_timer =
            time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                datagram = datagram_port.select_next_some() => {
                    let (buf, from) = datagram;
                    // the mainline DHT speaks IPv4
                    if let SocketAddr::V4(from) = from {
                        self.handle_datagram(&buf, from, &mut send_half)
                            .await;
                    }
                }
                cmd = cmd_port.select_next_some() => {
                    match cmd {
                        Command::GetPeers { info_hash, sink } => {
                            self.start_lookup(
                                info_hash,
                                Some(sink),
                                None,
                                &mut send_half,
                            )
                            .await;
                        }
                        Command::Announce { info_hash, port } => {
                            self.start_lookup(
                                info_hash,
                                None,
                                Some(port),
                                &mut send_half,
                            )
                            .await;
                        }
                        Command::AddNode { addr } => {
                            if let SocketAddr::V4(addr) = addr {
                                self.send_query(
                                    &mut send_half,
                                    addr,
                                    None,
                                    QueryKind::Ping,
                                    QueryPurpose::Maintenance,
                                )
                                .await;
                            }
                        }
                        Command::Shutdown => {
                            log::info!("shutting down DHT node");
                            break;
                        }
                    }
                }
                _ = tick_timer.select_next_some() => {
                    self.tick(&mut send_half).await;
                }
            }
        }

        self.save_table().await;
        Ok(())
    }

    /// Seeds the routing table from the configured bootstrap nodes.
    async fn bootstrap(&mut self, socket: &mut SendHalf) {
        if !self.table.is_empty() {
            return;
        }
        let own_id = self.own_id();
        for host in self.bootstrap_nodes.clone() {
            let addrs = match tokio::net::lookup_host(host.as_str()).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    log::warn!(
                        "failed to resolve DHT bootstrap node {}: {}",
                        host,
                        e
                    );
                    continue;
                }
            };
            for addr in addrs {
                if let SocketAddr::V4(addr) = addr {
                    self.send_query(
                        socket,
                        addr,
                        None,
                        QueryKind::FindNode { target: own_id },
                        QueryPurpose::Maintenance,
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddrV4,
        socket: &mut SendHalf,
    ) {
        let msg = match krpc::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("undecodeable datagram from {}: {}", from, e);
                return;
            }
        };
        match msg {
            Message::Query { t, id, kind } => {
                // a query is proof of life too
                self.table.insert(Node::new(id, from));
                self.handle_query(&t, id, kind, from, socket).await;
            }
            Message::Response { t, response } => {
                let pending = match self.pending.remove(&t) {
                    Some(pending) if pending.addr == from => pending,
                    // unsolicited or spoofed; drop
                    _ => return,
                };
                self.table.node_responded(response.id, from);
                if let QueryPurpose::Lookup { lookup_id } = pending.purpose {
                    self.lookup_response(lookup_id, response, from, socket)
                        .await;
                }
            }
            Message::Error { t, code, message } => {
                log::debug!(
                    "DHT error {} from {}: {}",
                    code,
                    from,
                    message
                );
                if let Some(pending) = self.pending.remove(&t) {
                    if let Some(node_id) = pending.node_id {
                        self.table.node_failed(&node_id);
                    }
                    if let QueryPurpose::Lookup { lookup_id } =
                        pending.purpose
                    {
                        self.lookup_failure(lookup_id, socket).await;
                    }
                }
            }
        }
    }

    /// Answers an incoming query.
    async fn handle_query(
        &mut self,
        t: &[u8],
        _from_id: NodeId,
        kind: Option<QueryKind>,
        from: SocketAddrV4,
        socket: &mut SendHalf,
    ) {
        let own_id = self.own_id();
        let reply = match kind {
            None => {
                krpc::encode_error(
                    t,
                    krpc::ERROR_METHOD_UNKNOWN,
                    "Method Unknown",
                )
            }
            Some(QueryKind::Ping) => krpc::encode_response(
                t,
                &Response {
                    id: own_id,
                    ..Response::default()
                },
            ),
            Some(QueryKind::FindNode { target }) => krpc::encode_response(
                t,
                &Response {
                    id: own_id,
                    nodes: self.closest_compact(&target),
                    ..Response::default()
                },
            ),
            Some(QueryKind::GetPeers { info_hash }) => {
                let values: Vec<SocketAddr> = self
                    .stored_peers
                    .get(&info_hash)
                    .map(|peers| peers.keys().copied().take(50).collect())
                    .unwrap_or_default();
                krpc::encode_response(
                    t,
                    &Response {
                        id: own_id,
                        // closer nodes help even when we have values
                        nodes: self
                            .closest_compact(&NodeId::from_info_hash(
                                &info_hash,
                            )),
                        values,
                        token: Some(self.make_token(&from)),
                    },
                )
            }
            Some(QueryKind::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            }) => {
                if !self.check_token(&from, &token) {
                    krpc::encode_error(
                        t,
                        krpc::ERROR_PROTOCOL,
                        "Invalid token",
                    )
                } else {
                    let peer_port =
                        if implied_port { from.port() } else { port };
                    let peer = SocketAddr::V4(SocketAddrV4::new(
                        *from.ip(),
                        peer_port,
                    ));
                    log::debug!(
                        "storing peer {} for {}",
                        peer,
                        hex::encode(info_hash)
                    );
                    self.stored_peers
                        .entry(info_hash)
                        .or_default()
                        .insert(peer, Instant::now());
                    krpc::encode_response(
                        t,
                        &Response {
                            id: own_id,
                            ..Response::default()
                        },
                    )
                }
            }
        };
        send_datagram(socket, &reply, from).await;
    }

    /// Kicks off an iterative lookup for the nodes closest to the target.
    async fn start_lookup(
        &mut self,
        info_hash: Sha1Hash,
        sink: Option<UnboundedSender<Vec<SocketAddr>>>,
        announce_port: Option<u16>,
        socket: &mut SendHalf,
    ) {
        let target = NodeId::from_info_hash(&info_hash);
        let candidates: Vec<CompactNode> = self
            .table
            .closest(&target, 2 * K)
            .into_iter()
            .map(|node| CompactNode {
                id: node.id,
                addr: node.addr,
            })
            .collect();

        let lookup_id = self.next_lookup_id;
        self.next_lookup_id += 1;
        self.lookups.insert(
            lookup_id,
            Lookup {
                target,
                announce_port,
                sink,
                candidates,
                queried: HashSet::new(),
                inflight: 0,
                responders: Vec::new(),
            },
        );
        log::debug!(
            "starting DHT lookup {} for {}",
            lookup_id,
            hex::encode(info_hash)
        );
        self.advance_lookup(lookup_id, socket).await;
    }

    /// Sends the next round of queries, or finishes the lookup when it has
    /// converged.
    async fn advance_lookup(&mut self, lookup_id: u64, socket: &mut SendHalf) {
        let (target, to_query) = {
            let lookup = match self.lookups.get_mut(&lookup_id) {
                Some(lookup) => lookup,
                None => return,
            };
            let mut to_query = Vec::new();
            // keep α queries in flight, walking candidates closest first
            for candidate in lookup.candidates.iter() {
                if lookup.inflight + to_query.len() >= ALPHA {
                    break;
                }
                if lookup.queried.contains(&candidate.addr) {
                    continue;
                }
                to_query.push(*candidate);
            }
            for candidate in &to_query {
                lookup.queried.insert(candidate.addr);
            }
            lookup.inflight += to_query.len();
            (lookup.target, to_query)
        };

        for candidate in &to_query {
            self.send_query(
                socket,
                candidate.addr,
                Some(candidate.id),
                QueryKind::GetPeers {
                    info_hash: target.0,
                },
                QueryPurpose::Lookup { lookup_id },
            )
            .await;
        }

        let done = self
            .lookups
            .get(&lookup_id)
            .map(|lookup| lookup.inflight == 0)
            .unwrap_or(false);
        if done {
            self.finish_lookup(lookup_id, socket).await;
        }
    }

    async fn lookup_response(
        &mut self,
        lookup_id: u64,
        response: Response,
        from: SocketAddrV4,
        socket: &mut SendHalf,
    ) {
        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
            lookup.inflight = lookup.inflight.saturating_sub(1);

            if !response.values.is_empty() {
                log::debug!(
                    "DHT lookup {} got {} peers from {}",
                    lookup_id,
                    response.values.len(),
                    from
                );
                if let Some(sink) = &lookup.sink {
                    let _ = sink.send(response.values.clone());
                }
            }
            if let Some(token) = response.token {
                lookup.responders.push((
                    CompactNode {
                        id: response.id,
                        addr: from,
                    },
                    token,
                ));
            }

            // merge newly learned nodes into the candidate list, keeping it
            // sorted by distance and bounded
            let target = lookup.target;
            for node in response.nodes {
                if lookup
                    .candidates
                    .iter()
                    .any(|existing| existing.addr == node.addr)
                {
                    continue;
                }
                lookup.candidates.push(node);
            }
            lookup
                .candidates
                .sort_by_key(|node| node.id.distance(&target));
            lookup.candidates.truncate(4 * K);
        }
        self.advance_lookup(lookup_id, socket).await;
    }

    async fn lookup_failure(&mut self, lookup_id: u64, socket: &mut SendHalf) {
        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
            lookup.inflight = lookup.inflight.saturating_sub(1);
        }
        self.advance_lookup(lookup_id, socket).await;
    }

    /// Completes a lookup: flush the sink and, for announces, tell the
    /// closest responders that we serve the torrent.
    async fn finish_lookup(&mut self, lookup_id: u64, socket: &mut SendHalf) {
        let mut lookup = match self.lookups.remove(&lookup_id) {
            Some(lookup) => lookup,
            None => return,
        };
        log::debug!(
            "DHT lookup {} finished ({} responders)",
            lookup_id,
            lookup.responders.len()
        );

        if let Some(port) = lookup.announce_port {
            let target = lookup.target;
            lookup
                .responders
                .sort_by_key(|(node, _)| node.id.distance(&target));
            for (node, token) in lookup.responders.into_iter().take(K) {
                self.send_query(
                    socket,
                    node.addr,
                    Some(node.id),
                    QueryKind::AnnouncePeer {
                        info_hash: target.0,
                        port,
                        token,
                        implied_port: false,
                    },
                    QueryPurpose::Maintenance,
                )
                .await;
            }
        }
        // dropping the sink signals the requester that the lookup is over
    }

    /// The per-second housekeeping: query timeouts, secret rotation, peer
    /// store pruning, table refresh and persistence.
    async fn tick(&mut self, socket: &mut SendHalf) {
        // time out unanswered queries
        let now = Instant::now();
        let timed_out: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, pending)| {
                now.duration_since(pending.sent_at) > QUERY_TIMEOUT
            })
            .map(|(t, _)| t.clone())
            .collect();
        for t in timed_out {
            if let Some(pending) = self.pending.remove(&t) {
                if let Some(node_id) = pending.node_id {
                    self.table.node_failed(&node_id);
                }
                if let QueryPurpose::Lookup { lookup_id } = pending.purpose {
                    self.lookup_failure(lookup_id, socket).await;
                }
            }
        }

        if self.last_secret_rotation.elapsed() > SECRET_ROTATION {
            self.prev_token_secret = self.token_secret;
            self.token_secret = rand::random();
            self.last_secret_rotation = Instant::now();
        }

        // forget peers that stopped refreshing their announce
        for peers in self.stored_peers.values_mut() {
            peers.retain(|_, stored_at| stored_at.elapsed() < PEER_TTL);
        }
        self.stored_peers.retain(|_, peers| !peers.is_empty());

        if self.last_refresh.elapsed() > REFRESH_INTERVAL {
            self.last_refresh = Instant::now();
            if self.table.is_empty() {
                self.bootstrap(socket).await;
            } else {
                // a random target keeps distant buckets fresh
                self.start_lookup(NodeId::random().0, None, None, socket)
                    .await;
            }
        }

        if self.last_table_save.elapsed() > TABLE_SAVE_INTERVAL {
            self.last_table_save = Instant::now();
            self.save_table().await;
        }
    }

    async fn send_query(
        &mut self,
        socket: &mut SendHalf,
        addr: SocketAddrV4,
        node_id: Option<NodeId>,
        kind: QueryKind,
        purpose: QueryPurpose,
    ) {
        let t = self.next_tid.to_be_bytes().to_vec();
        self.next_tid = self.next_tid.wrapping_add(1);
        let datagram = krpc::encode_query(&t, self.own_id(), &kind);
        self.pending.insert(
            t,
            PendingQuery {
                node_id,
                addr,
                sent_at: Instant::now(),
                purpose,
            },
        );
        send_datagram(socket, &datagram, addr).await;
    }

    fn closest_compact(&self, target: &NodeId) -> Vec<CompactNode> {
        self.table
            .closest(target, K)
            .into_iter()
            .map(|node| CompactNode {
                id: node.id,
                addr: node.addr,
            })
            .collect()
    }

    /// A write token proves to us that the announcing node owns its IP: it
    /// is a keyed hash over the address, valid across one secret rotation.
    fn make_token(&self, addr: &SocketAddrV4) -> Vec<u8> {
        token_for(&self.token_secret, addr)
    }

    fn check_token(&self, addr: &SocketAddrV4, token: &[u8]) -> bool {
        token == token_for(&self.token_secret, addr).as_slice()
            || token == token_for(&self.prev_token_secret, addr).as_slice()
    }

    fn table_path(&self) -> PathBuf {
        self.state_dir.join(TABLE_FILE)
    }

    /// Loads the persisted routing table, if there is one.
    fn load_table(&mut self) {
        let buf = match std::fs::read(self.table_path()) {
            Ok(buf) => buf,
            Err(_) => return,
        };
        let nodes = krpc::parse_compact_nodes(&buf);
        log::info!("loaded {} persisted DHT nodes", nodes.len());
        for node in nodes {
            self.table.insert(Node::new(node.id, node.addr));
        }
    }

    /// Persists the routing table as packed compact node entries.
    async fn save_table(&self) {
        let mut buf = Vec::with_capacity(self.table.len() * 26);
        for node in self.table.nodes() {
            buf.extend_from_slice(&node.id.0);
            buf.extend_from_slice(&node.addr.ip().octets());
            buf.extend_from_slice(&node.addr.port().to_be_bytes());
        }
        let path = self.table_path();
        let result = task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&path, &buf)
        })
        .await
        .expect("DHT table save task panicked");
        if let Err(e) = result {
            log::warn!("failed to persist DHT routing table: {}", e);
        }
    }
}

fn token_for(secret: &[u8; 8], addr: &SocketAddrV4) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(addr.ip().octets());
    hasher.finalize()[..8].to_vec()
}

/// Forwards received datagrams to the DHT actor until the socket or the
/// actor goes away.
async fn recv_loop(
    mut socket: RecvHalf,
    datagram_chan: UnboundedSender<(Vec<u8>, SocketAddr)>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if datagram_chan.send((buf[..len].to_vec(), from)).is_err() {
                    // the actor shut down
                    return;
                }
            }
            Err(e) => {
                log::warn!("DHT socket error: {}", e);
            }
        }
    }
}

async fn send_datagram(socket: &mut SendHalf, buf: &[u8], addr: SocketAddrV4) {
    let addr = SocketAddr::V4(addr);
    if let Err(e) = socket.send_to(buf, &addr).await {
        // UDP sends fail transiently; the query timeout handles the rest
        log::debug!("failed to send datagram to {}: {}", addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validation_across_rotation() {
        let mut dht = Dht::new(std::env::temp_dir(), Vec::new());
        let addr: SocketAddrV4 = "10.0.0.1:6881".parse().unwrap();
        let other: SocketAddrV4 = "10.0.0.2:6881".parse().unwrap();

        let token = dht.make_token(&addr);
        assert!(dht.check_token(&addr, &token));
        // a token is bound to the address it was issued for
        assert!(!dht.check_token(&other, &token));

        // one rotation later the token is still good
        dht.prev_token_secret = dht.token_secret;
        dht.token_secret = rand::random();
        assert!(dht.check_token(&addr, &token));

        // two rotations later it is not
        dht.prev_token_secret = dht.token_secret;
        dht.token_secret = rand::random();
        assert!(!dht.check_token(&addr, &token));
    }

    #[test]
    fn test_lookup_bookkeeping() {
        let mut dht = Dht::new(std::env::temp_dir(), Vec::new());
        // no candidates: the lookup would finish immediately once started;
        // here we only check id assignment
        dht.lookups.insert(
            7,
            Lookup {
                target: NodeId([1; 20]),
                announce_port: None,
                sink: None,
                candidates: Vec::new(),
                queried: HashSet::new(),
                inflight: 0,
                responders: Vec::new(),
            },
        );
        assert!(dht.lookups.contains_key(&7));
    }
}
