//! The UDP tracker client (BEP 15).
//!
//! The protocol is a two step exchange over a connectionless socket: a
//! connect request yields a 64 bit connection id (valid for two minutes),
//! which then authorizes announce and scrape requests. All layouts are fixed
//! big endian records; transaction ids must be echoed back. Lost datagrams
//! are handled with capped exponential retransmission.

use std::{
    convert::TryInto,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use rand::random;
use tokio::{net::UdpSocket, time};
use url::Url;

use super::{
    parse_compact_v4, AnnounceParams, AnnounceResponse, Result,
    ScrapeResponse, TrackerError,
};
use crate::Sha1Hash;

const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// How long a connection id stays valid (BEP 15 mandates two minutes).
const CONNECTION_ID_TTL: Duration = Duration::from_secs(115);

/// Retransmission schedule: capped exponential backoff, roughly 15 seconds
/// at the longest.
const RETRY_TIMEOUTS: [Duration; 4] = [
    Duration::from_secs(3),
    Duration::from_secs(6),
    Duration::from_secs(12),
    Duration::from_secs(15),
];

pub(crate) struct UdpTracker {
    url: Url,
    /// `host:port` of the tracker, resolved per exchange.
    tracker_addr: String,
    /// The cached connection id and when it was obtained.
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    pub fn new(url: Url) -> Result<Self> {
        let host = url.host_str().ok_or(TrackerError::UnsupportedUrl)?;
        let port = url.port().ok_or(TrackerError::UnsupportedUrl)?;
        let tracker_addr = format!("{}:{}", host, port);
        Ok(Self {
            url,
            tracker_addr,
            connection: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        let mut socket = self.open_socket().await?;
        let connection_id = self.connection_id(&mut socket).await?;

        let transaction_id: u32 = random();
        let mut req = BytesMut::with_capacity(98);
        req.put_u64(connection_id);
        req.put_u32(ACTION_ANNOUNCE);
        req.put_u32(transaction_id);
        req.put_slice(&params.info_hash);
        req.put_slice(&params.peer_id);
        req.put_u64(params.downloaded);
        req.put_u64(params.left);
        req.put_u64(params.uploaded);
        req.put_u32(params.event.map(|e| e.udp_value()).unwrap_or(0));
        // our IP: 0 means "use the packet source"
        req.put_u32(0);
        // a random key identifying this client across IP changes
        req.put_u32(random());
        req.put_i32(
            params
                .peer_count
                .map(|count| count as i32)
                .unwrap_or(-1),
        );
        req.put_u16(params.port);

        let resp = exchange(&mut socket, &req, transaction_id).await?;
        let mut resp = &resp[..];
        if resp.len() < 20 {
            return Err(TrackerError::Parse("short announce response".into()));
        }
        let action = resp.get_u32();
        // transaction id already checked by exchange
        resp.advance(4);
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::Parse("unexpected action".into()));
        }
        let interval = resp.get_u32();
        let leechers = resp.get_u32();
        let seeders = resp.get_u32();
        let peers = parse_compact_v4(resp);

        Ok(AnnounceResponse {
            interval: Some(Duration::from_secs(interval as u64)),
            min_interval: None,
            warning_message: None,
            seeder_count: Some(seeders as usize),
            leecher_count: Some(leechers as usize),
            peers,
        })
    }

    pub async fn scrape(
        &mut self,
        info_hash: Sha1Hash,
    ) -> Result<ScrapeResponse> {
        let mut socket = self.open_socket().await?;
        let connection_id = self.connection_id(&mut socket).await?;

        let transaction_id: u32 = random();
        let mut req = BytesMut::with_capacity(36);
        req.put_u64(connection_id);
        req.put_u32(ACTION_SCRAPE);
        req.put_u32(transaction_id);
        req.put_slice(&info_hash);

        let resp = exchange(&mut socket, &req, transaction_id).await?;
        let mut resp = &resp[..];
        if resp.len() < 20 {
            return Err(TrackerError::Parse("short scrape response".into()));
        }
        let action = resp.get_u32();
        resp.advance(4);
        if action != ACTION_SCRAPE {
            return Err(TrackerError::Parse("unexpected action".into()));
        }
        Ok(ScrapeResponse {
            complete: resp.get_u32(),
            downloaded: resp.get_u32(),
            incomplete: resp.get_u32(),
        })
    }

    async fn open_socket(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.tracker_addr).await?;
        Ok(socket)
    }

    /// Returns a valid connection id, performing the connect exchange when
    /// the cached one expired.
    async fn connection_id(&mut self, socket: &mut UdpSocket) -> Result<u64> {
        if let Some((id, obtained_at)) = self.connection {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = random();
        let mut req = BytesMut::with_capacity(16);
        req.put_u64(PROTOCOL_MAGIC);
        req.put_u32(ACTION_CONNECT);
        req.put_u32(transaction_id);

        let resp = exchange(socket, &req, transaction_id).await?;
        let mut resp = &resp[..];
        if resp.len() < 16 {
            return Err(TrackerError::Parse("short connect response".into()));
        }
        let action = resp.get_u32();
        resp.advance(4);
        if action != ACTION_CONNECT {
            return Err(TrackerError::Parse("unexpected action".into()));
        }
        let connection_id = resp.get_u64();
        self.connection = Some((connection_id, Instant::now()));
        log::debug!("connected to UDP tracker {}", self.url);
        Ok(connection_id)
    }
}

/// Sends the request and waits for the matching response, retransmitting on
/// timeout. Responses with a foreign transaction id are dropped; an error
/// action surfaces the tracker's message.
async fn exchange(
    socket: &mut UdpSocket,
    req: &[u8],
    transaction_id: u32,
) -> Result<Vec<u8>> {
    let mut buf = vec![0; 1500];
    for timeout in RETRY_TIMEOUTS.iter() {
        socket.send(req).await?;
        let deadline = Instant::now() + *timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let len = match time::timeout(remaining, socket.recv(&mut buf))
                .await
            {
                Ok(len) => len?,
                // retransmit with the next backoff step
                Err(_) => break,
            };
            if len < 8 {
                continue;
            }
            let action =
                u32::from_be_bytes(buf[0..4].try_into().unwrap());
            let tid = u32::from_be_bytes(buf[4..8].try_into().unwrap());
            if tid != transaction_id {
                // stale or spoofed datagram
                continue;
            }
            if action == ACTION_ERROR {
                let message =
                    String::from_utf8_lossy(&buf[8..len]).to_string();
                return Err(TrackerError::Failure(message));
            }
            return Ok(buf[..len].to_vec());
        }
    }
    Err(TrackerError::Timeout)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tracker::Event;

    /// A loopback mock tracker that speaks just enough BEP 15 for the
    /// tests: answers a connect and a single announce.
    async fn run_mock_tracker(mut socket: UdpSocket) {
        let mut buf = vec![0; 1500];
        let connection_id: u64 = 0xdead_beef_cafe_f00d;

        // connect exchange
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        assert!(len >= 16);
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        assert_eq!(magic, PROTOCOL_MAGIC);
        let tid = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_CONNECT);
        resp.put_u32(tid);
        resp.put_u64(connection_id);
        socket.send_to(&resp, &peer).await.unwrap();

        // announce exchange
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 98);
        let conn = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        assert_eq!(conn, connection_id);
        let action = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        assert_eq!(action, ACTION_ANNOUNCE);
        let tid = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_ANNOUNCE);
        resp.put_u32(tid);
        resp.put_u32(1800); // interval
        resp.put_u32(3); // leechers
        resp.put_u32(5); // seeders
        resp.put_slice(&[10, 0, 0, 1, 0x1a, 0xe1]); // 10.0.0.1:6881
        socket.send_to(&resp, &peer).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_announce() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(run_mock_tracker(server));

        let url = Url::parse(&format!(
            "udp://127.0.0.1:{}",
            server_addr.port()
        ))
        .unwrap();
        let mut tracker = UdpTracker::new(url).unwrap();
        let resp = tracker
            .announce(&AnnounceParams {
                info_hash: [0xab; 20],
                peer_id: *b"-rp0100-000000000000",
                port: 6881,
                downloaded: 100,
                uploaded: 50,
                left: 1000,
                event: Some(Event::Started),
                peer_count: None,
            })
            .await
            .unwrap();

        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.seeder_count, Some(5));
        assert_eq!(resp.leecher_count, Some(3));
        assert_eq!(resp.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
        // the connection id is cached for the next exchange
        assert!(tracker.connection.is_some());
    }

    #[test]
    fn test_rejects_urls_without_port() {
        assert!(
            UdpTracker::new(Url::parse("udp://tracker.example").unwrap())
                .is_err()
        );
    }
}
