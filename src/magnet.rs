//! Magnet URI parsing (BEP 9, with the BEP 53 `so=` selection extension).
//!
//! A magnet only identifies the swarm: the full metainfo is fetched from
//! peers over ut_metadata after the first connections are up, at which point
//! the torrent is promoted via [`crate::metainfo::Metainfo::from_info_bytes`].

use std::net::SocketAddr;

use url::Url;

use crate::{error::*, Sha1Hash};

/// The parsed form of a magnet link: the info-hash plus whatever hints the
/// link carried.
#[derive(Clone, Debug)]
pub struct MagnetUri {
    pub info_hash: Sha1Hash,
    /// Display name (`dn`), if present.
    pub name: Option<String>,
    /// Tracker hints (`tr`), each forming its own tier.
    pub trackers: Vec<Url>,
    /// Direct peer address hints (`x.pe`).
    pub peers: Vec<SocketAddr>,
    /// BEP 53 `so=` file selection: indices of the only files to download.
    /// Empty means all files.
    pub selected_files: Vec<usize>,
}

impl MagnetUri {
    /// Parses a `magnet:?xt=urn:btih:...` URI.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input.trim())
            .map_err(|e| invalid(format!("not a URI: {}", e)))?;
        if url.scheme() != "magnet" {
            return Err(invalid("scheme is not magnet"));
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();
        let mut selected_files = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let urn = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| invalid("xt is not urn:btih"))?;
                    info_hash = Some(parse_info_hash(urn)?);
                }
                "dn" => name = Some(value.to_string()),
                "tr" => {
                    if let Ok(url) = Url::parse(&value) {
                        trackers.push(url);
                    }
                }
                "x.pe" => {
                    if let Ok(addr) = value.parse() {
                        peers.push(addr);
                    }
                }
                "so" => selected_files = parse_index_ranges(&value)?,
                // other keys (xl, ws, kt, ...) are not used by the engine
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash
                .ok_or_else(|| invalid("missing xt=urn:btih parameter"))?,
            name,
            trackers,
            peers,
            selected_files,
        })
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidMagnet {
        reason: reason.into(),
    }
}

/// The info-hash is either 40 hex digits or 32 base32 digits.
fn parse_info_hash(urn: &str) -> Result<Sha1Hash> {
    let mut hash = [0; 20];
    match urn.len() {
        40 => {
            let bytes = hex::decode(urn)
                .map_err(|_| invalid("invalid hex info-hash"))?;
            hash.copy_from_slice(&bytes);
        }
        32 => {
            let bytes = base32_decode(urn.as_bytes())
                .ok_or_else(|| invalid("invalid base32 info-hash"))?;
            hash.copy_from_slice(&bytes);
        }
        _ => return Err(invalid("info-hash must be 40 hex or 32 base32")),
    }
    Ok(hash)
}

/// RFC 4648 base32 without padding: exactly what 32 characters of a 20 byte
/// info-hash need. None of the crates in our tree cover this, so it's done by
/// hand.
fn base32_decode(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut acc: u64 = 0;
    let mut acc_bits = 0;
    for c in input {
        let val = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | val as u64;
        acc_bits += 5;
        if acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
        }
    }
    Some(out)
}

/// Parses a BEP 53 index list such as `0,2,4-7` into individual indices.
fn parse_index_ranges(input: &str) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    for part in input.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start
                    .parse()
                    .map_err(|_| invalid("invalid so= range start"))?;
                let end: usize = end
                    .parse()
                    .map_err(|_| invalid("invalid so= range end"))?;
                if start > end {
                    return Err(invalid("so= range is backwards"));
                }
                indices.extend(start..=end);
            }
            None => {
                indices.push(
                    part.parse().map_err(|_| invalid("invalid so= index"))?,
                );
            }
        }
    }
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const HEX_HASH: &str = "aabbccddeeff00112233445566778899aabbccdd";

    #[test]
    fn test_parse_minimal() {
        let magnet =
            MagnetUri::parse(&format!("magnet:?xt=urn:btih:{}", HEX_HASH))
                .unwrap();
        assert_eq!(hex::encode(magnet.info_hash), HEX_HASH);
        assert_eq!(magnet.name, None);
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=big.iso\
             &tr=http%3A%2F%2Ftracker.example%2Fannounce\
             &tr=udp%3A%2F%2Ftracker2.example%3A6969\
             &x.pe=10.0.0.1:6881&so=0,2,4-6",
            HEX_HASH
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.name.as_deref(), Some("big.iso"));
        assert_eq!(magnet.trackers.len(), 2);
        assert_eq!(magnet.trackers[1].scheme(), "udp");
        assert_eq!(magnet.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
        assert_eq!(magnet.selected_files, vec![0, 2, 4, 5, 6]);
    }

    #[test]
    fn test_parse_base32_hash() {
        // base32 of the 20 bytes 00 44 32 14 c7 42 54 b6 35 cf 84 65 3a 56
        // d7 c6 75 be 77 df
        let uri = "magnet:?xt=urn:btih:ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
        let magnet = MagnetUri::parse(uri).unwrap();
        assert_eq!(
            magnet.info_hash,
            [
                0x00, 0x44, 0x32, 0x14, 0xc7, 0x42, 0x54, 0xb6, 0x35, 0xcf,
                0x84, 0x65, 0x3a, 0x56, 0xd7, 0xc6, 0x75, 0xbe, 0x77, 0xdf
            ]
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(MagnetUri::parse("http://example.com").is_err());
        assert!(MagnetUri::parse("magnet:?dn=name-but-no-xt").is_err());
        assert!(
            MagnetUri::parse("magnet:?xt=urn:btih:tooshort").is_err()
        );
        assert!(MagnetUri::parse(&format!(
            "magnet:?xt=urn:btih:{}&so=5-2",
            HEX_HASH
        ))
        .is_err());
    }
}
