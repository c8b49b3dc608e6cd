//! Tracker clients: HTTP (BEP 3) and UDP (BEP 15) announces and scrapes,
//! organized into tiers (BEP 12).

mod http;
mod udp;

use std::{fmt, io, net::SocketAddr, time::Duration};

use url::Url;

use crate::{PeerId, Sha1Hash};
pub(crate) use http::HttpTracker;
pub(crate) use udp::UdpTracker;

/// The event reported to the tracker with an announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// The torrent has just started (or resumed).
    Started,
    /// All wanted pieces finished downloading.
    Completed,
    /// The torrent is being shut down or paused.
    Stopped,
}

impl Event {
    fn http_value(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    /// The event encoding of the UDP protocol (BEP 15).
    fn udp_value(self) -> u32 {
        match self {
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// The parameters of an announce.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which we accept peer connections, if we listen at all.
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    /// How many peers we'd like (`numwant`).
    pub peer_count: Option<usize>,
}

/// What the tracker told us in response to an announce.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnnounceResponse {
    /// How long to wait before announcing again.
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub warning_message: Option<String>,
    /// The number of seeders in the swarm.
    pub seeder_count: Option<usize>,
    /// The number of leechers in the swarm.
    pub leecher_count: Option<usize>,
    pub peers: Vec<SocketAddr>,
}

/// Per-torrent swarm statistics from a scrape (BEP 48).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ScrapeResponse {
    /// Seeders.
    pub complete: u32,
    /// Completed downloads, all time.
    pub downloaded: u32,
    /// Leechers.
    pub incomplete: u32,
}

#[derive(Debug)]
pub(crate) enum TrackerError {
    /// The URL's scheme is neither http(s) nor udp, or the URL lacks pieces
    /// the protocol needs (e.g. a port for UDP).
    UnsupportedUrl,
    /// The tracker responded with a failure reason.
    Failure(String),
    /// The response was not parseable.
    Parse(String),
    /// The exchange timed out (after the protocol's retries).
    Timeout,
    Http(reqwest::Error),
    Io(io::Error),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnsupportedUrl => write!(f, "unsupported tracker URL"),
            Self::Failure(reason) => {
                write!(f, "tracker failure: {}", reason)
            }
            Self::Parse(reason) => {
                write!(f, "unparseable tracker response: {}", reason)
            }
            Self::Timeout => write!(f, "tracker timed out"),
            Self::Http(e) => write!(f, "tracker HTTP error: {}", e),
            Self::Io(e) => write!(f, "tracker IO error: {}", e),
        }
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<io::Error> for TrackerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub(crate) type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// A single tracker endpoint, dispatching on the URL scheme.
pub(crate) enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn from_url(url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(HttpTracker::new(url))),
            "udp" => Ok(Self::Udp(UdpTracker::new(url)?)),
            _ => Err(TrackerError::UnsupportedUrl),
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Http(t) => t.url(),
            Self::Udp(t) => t.url(),
        }
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        match self {
            Self::Http(t) => t.announce(params).await,
            Self::Udp(t) => t.announce(params).await,
        }
    }

    pub async fn scrape(
        &mut self,
        info_hash: Sha1Hash,
    ) -> Result<ScrapeResponse> {
        match self {
            Self::Http(t) => t.scrape(info_hash).await,
            Self::Udp(t) => t.scrape(info_hash).await,
        }
    }
}

/// A tier of equivalent trackers (BEP 12): the current head is tried first
/// and a responding tracker is promoted to the head of its tier.
pub(crate) struct Tier {
    pub trackers: Vec<Tracker>,
}

impl Tier {
    /// Builds a tier from its URLs, silently skipping unusable ones.
    pub fn from_urls(urls: &[Url]) -> Self {
        Self {
            trackers: urls
                .iter()
                .cloned()
                .filter_map(|url| match Tracker::from_url(url.clone()) {
                    Ok(tracker) => Some(tracker),
                    Err(e) => {
                        log::warn!("skipping tracker {}: {}", url, e);
                        None
                    }
                })
                .collect(),
        }
    }

    /// Announces to the tier: each tracker is tried in order and the first
    /// one that responds is moved to the front.
    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        let mut last_error = TrackerError::UnsupportedUrl;
        for i in 0..self.trackers.len() {
            match self.trackers[i].announce(params).await {
                Ok(response) => {
                    if i > 0 {
                        // BEP 12: the responding tracker moves to the tier
                        // front
                        let tracker = self.trackers.remove(i);
                        self.trackers.insert(0, tracker);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    log::warn!(
                        "announce to {} failed: {}",
                        self.trackers[i].url(),
                        e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Parses the compact 6-byte IPv4 peer encoding of tracker responses.
pub(crate) fn parse_compact_v4(buf: &[u8]) -> Vec<SocketAddr> {
    crate::peer::ext::parse_compact_v4(buf)
}

/// Parses the compact 18-byte IPv6 peer encoding.
pub(crate) fn parse_compact_v6(buf: &[u8]) -> Vec<SocketAddr> {
    crate::peer::ext::parse_compact_v6(buf)
}
