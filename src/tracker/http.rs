//! The HTTP(S) tracker client (BEP 3, compact peers per BEP 23, scrape per
//! BEP 48).
//!
//! An announce is a GET whose binary parameters (info-hash, peer id) are
//! percent-encoded by hand: they are raw bytes, not UTF-8, so they must
//! bypass any string-level encoding. The response is a bencoded dictionary.

use std::time::Duration;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;
use url::Url;

use super::{
    parse_compact_v4, parse_compact_v6, AnnounceParams, AnnounceResponse,
    Result, ScrapeResponse, TrackerError,
};
use crate::Sha1Hash;

/// The deadline of a single tracker HTTP request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct HttpTracker {
    client: reqwest::Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("tracker HTTP client");
        Self { client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        // the query is assembled by hand as the info hash and peer id are
        // binary data that no typed query API encodes correctly
        let mut url = format!(
            "{url}{sep}info_hash={info_hash}&peer_id={peer_id}&port={port}\
             &downloaded={downloaded}&uploaded={uploaded}&left={left}\
             &compact=1",
            url = self.url,
            sep = if self.url.query().is_some() { '&' } else { '?' },
            info_hash =
                percent_encode(&params.info_hash, NON_ALPHANUMERIC),
            peer_id = percent_encode(&params.peer_id, NON_ALPHANUMERIC),
            port = params.port,
            downloaded = params.downloaded,
            uploaded = params.uploaded,
            left = params.left,
        );
        if let Some(peer_count) = params.peer_count {
            url += &format!("&numwant={}", peer_count);
        }
        if let Some(event) = params.event {
            url += &format!("&event={}", event.http_value());
        }

        log::debug!("sending announce to {}", self.url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let body = resp.bytes().await?;

        let resp: AnnounceResponseDto = serde_bencode::from_bytes(&body)
            .map_err(|e| TrackerError::Parse(e.to_string()))?;
        if let Some(reason) = resp.failure_reason {
            return Err(TrackerError::Failure(reason));
        }

        let mut peers = Vec::new();
        match resp.peers {
            Some(PeersDto::Compact(buf)) => {
                peers.extend(parse_compact_v4(&buf));
            }
            Some(PeersDto::List(list)) => {
                for peer in list {
                    if let Ok(addr) =
                        format!("{}:{}", peer.ip, peer.port).parse()
                    {
                        peers.push(addr);
                    }
                }
            }
            None => {}
        }
        if let Some(buf) = resp.peers6 {
            peers.extend(parse_compact_v6(&buf));
        }

        Ok(AnnounceResponse {
            interval: resp.interval.map(Duration::from_secs),
            min_interval: resp.min_interval.map(Duration::from_secs),
            warning_message: resp.warning_message,
            seeder_count: resp.complete.map(|c| c as usize),
            leecher_count: resp.incomplete.map(|c| c as usize),
            peers,
        })
    }

    /// Scrapes the swarm counters of the torrent. Only possible when the
    /// announce URL follows the `/announce` convention (BEP 48).
    pub async fn scrape(
        &mut self,
        info_hash: Sha1Hash,
    ) -> Result<ScrapeResponse> {
        let mut url = self.url.clone();
        {
            let path = url.path().to_string();
            let scrape_path = match path.rfind("announce") {
                Some(pos) if path[pos..].starts_with("announce") => {
                    format!(
                        "{}scrape{}",
                        &path[..pos],
                        &path[pos + "announce".len()..]
                    )
                }
                _ => return Err(TrackerError::UnsupportedUrl),
            };
            url.set_path(&scrape_path);
        }
        let url = format!(
            "{url}{sep}info_hash={info_hash}",
            url = url,
            sep = if url.query().is_some() { '&' } else { '?' },
            info_hash = percent_encode(&info_hash, NON_ALPHANUMERIC),
        );

        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let body = resp.bytes().await?;
        let resp: ScrapeResponseDto = serde_bencode::from_bytes(&body)
            .map_err(|e| TrackerError::Parse(e.to_string()))?;

        resp.files
            .into_iter()
            .find(|(hash, _)| hash.as_slice() == info_hash)
            .map(|(_, file)| ScrapeResponse {
                complete: file.complete,
                downloaded: file.downloaded,
                incomplete: file.incomplete,
            })
            .ok_or_else(|| {
                TrackerError::Parse("torrent not in scrape response".into())
            })
    }
}

#[derive(Debug, Deserialize)]
struct AnnounceResponseDto {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    complete: Option<u64>,
    incomplete: Option<u64>,
    #[serde(default)]
    peers: Option<PeersDto>,
    /// BEP 7: IPv6 peers come in their own compact field.
    #[serde(default)]
    peers6: Option<ByteBuf>,
}

/// Trackers send peers either as the compact byte string or as a list of
/// dictionaries.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeersDto {
    Compact(ByteBuf),
    List(Vec<PeerDto>),
}

#[derive(Debug, Deserialize)]
struct PeerDto {
    ip: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ScrapeResponseDto {
    files: std::collections::HashMap<ByteBuf, ScrapeFileDto>,
}

#[derive(Debug, Deserialize)]
struct ScrapeFileDto {
    #[serde(default)]
    complete: u32,
    #[serde(default)]
    downloaded: u32,
    #[serde(default)]
    incomplete: u32,
}

#[cfg(test)]
mod tests {
    use mockito::{mock, Matcher};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tracker::Event;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0xab; 20],
            peer_id: *b"-rp0100-000000000000",
            port: 6881,
            downloaded: 0,
            uploaded: 0,
            left: 150_000,
            event: Some(Event::Started),
            peer_count: Some(50),
        }
    }

    #[tokio::test]
    async fn test_announce_compact_peers() {
        // two compact peers: 10.0.0.1:6881 and 127.0.0.1:80
        let body = b"d8:completei5e10:incompletei3e8:intervali1800e5:peers\
                     12:\x0a\x00\x00\x01\x1a\xe1\x7f\x00\x00\x01\x00\x50e"
            .to_vec();
        let _m = mock("GET", "/announce")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("port".into(), "6881".into()),
                Matcher::UrlEncoded("compact".into(), "1".into()),
                Matcher::UrlEncoded("event".into(), "started".into()),
                Matcher::UrlEncoded("numwant".into(), "50".into()),
            ]))
            .with_body(body)
            .create();

        let url =
            Url::parse(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        let mut tracker = HttpTracker::new(url);
        let resp = tracker.announce(&params()).await.unwrap();

        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.seeder_count, Some(5));
        assert_eq!(resp.leecher_count, Some(3));
        assert_eq!(
            resp.peers,
            vec![
                "10.0.0.1:6881".parse().unwrap(),
                "127.0.0.1:80".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_announce_failure_reason() {
        let _m = mock("GET", "/announce")
            .match_query(Matcher::Any)
            .with_body(&b"d14:failure reason15:unregistered ihe"[..])
            .create();

        let url =
            Url::parse(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        let mut tracker = HttpTracker::new(url);
        match tracker.announce(&params()).await {
            Err(TrackerError::Failure(reason)) => {
                assert_eq!(reason, "unregistered ih");
            }
            other => panic!("expected failure, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_announce_dict_peers() {
        let body = b"d8:intervali60e5:peersld2:ip9:127.0.0.14:porti8080eeee"
            .to_vec();
        let _m = mock("GET", "/announce")
            .match_query(Matcher::Any)
            .with_body(body)
            .create();

        let url =
            Url::parse(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        let mut tracker = HttpTracker::new(url);
        let resp = tracker.announce(&params()).await.unwrap();
        assert_eq!(resp.peers, vec!["127.0.0.1:8080".parse().unwrap()]);
    }
}
