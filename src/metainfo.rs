//! Parsing of `.torrent` metainfo into the engine's immutable torrent model.
//!
//! The info-hash is computed over the verbatim byte slice the `info` value
//! occupies in the original input. Re-encoding the parsed dictionary is not an
//! option: any ordering or encoding quirk of the original encoder would shift
//! the digest and place us in the wrong swarm.

use std::path::{Component, PathBuf};

use sha1::{Digest, Sha1};
use url::Url;

use crate::{
    bencode::{self, Value},
    error::*,
    storage_info::FileInfo,
    Sha1Hash,
};

/// The parsed and validated metainfo of a torrent. Immutable after parse.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The torrent's display name. For single file torrents this is also the
    /// file name, for archives the name of the download directory.
    pub name: String,
    /// SHA-1 of the raw `info` dictionary, the identity of the swarm.
    pub info_hash: Sha1Hash,
    /// The concatenation of each piece's expected SHA-1 hash.
    pub piece_hashes: Vec<u8>,
    /// The nominal piece length. The last piece may be shorter.
    pub piece_len: u32,
    /// All files of the torrent, flattened into download order. Paths are
    /// relative; the storage layer anchors them in the download directory.
    /// Single file torrents have exactly one entry.
    pub files: Vec<FileInfo>,
    /// Tracker tiers (BEP 12). Within a tier, trackers are tried in order and
    /// the responding one is moved to the front.
    pub trackers: Vec<Vec<Url>>,
    /// BEP 19 web seed URLs. Parsed and kept for completeness; the engine
    /// does not download from web seeds.
    pub web_seeds: Vec<String>,
    /// If true, peers may only be discovered via the declared trackers
    /// (BEP 27): no DHT, no PEX.
    pub private: bool,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl Metainfo {
    /// Parses a `.torrent` file's content.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let value = bencode::decode(buf)?;
        let info = value
            .dict_get(b"info")
            .ok_or_else(|| invalid("no info dictionary"))?;

        // the hash is taken over the verbatim input slice of the info value
        let info_range = bencode::raw_value_range(buf, b"info")?
            .expect("info entry present but no raw range");
        let info_hash = sha1_of(&buf[info_range]);

        let (name, piece_len, piece_hashes, files, private) =
            parse_info(info)?;

        // announce-list tiers take precedence over the single announce url
        let mut trackers = Vec::new();
        if let Some(tier_list) = value.dict_get(b"announce-list") {
            for tier in tier_list.as_list().unwrap_or(&[]) {
                let urls: Vec<_> = tier
                    .as_list()
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(|url| url.as_str())
                    .filter_map(|url| Url::parse(url).ok())
                    .collect();
                if !urls.is_empty() {
                    trackers.push(urls);
                }
            }
        }
        if trackers.is_empty() {
            if let Some(announce) =
                value.dict_get(b"announce").and_then(Value::as_str)
            {
                if let Ok(url) = Url::parse(announce) {
                    trackers.push(vec![url]);
                }
            }
        }

        let mut web_seeds = Vec::new();
        match value.dict_get(b"url-list") {
            Some(Value::Bytes(_)) => {
                if let Some(url) =
                    value.dict_get(b"url-list").and_then(Value::as_str)
                {
                    web_seeds.push(url.to_string());
                }
            }
            Some(Value::List(urls)) => {
                web_seeds.extend(
                    urls.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string),
                );
            }
            _ => {}
        }

        Ok(Self {
            name,
            info_hash,
            piece_hashes,
            piece_len,
            files,
            trackers,
            web_seeds,
            private,
            comment: value
                .dict_get(b"comment")
                .and_then(Value::as_str)
                .map(str::to_string),
            created_by: value
                .dict_get(b"created by")
                .and_then(Value::as_str)
                .map(str::to_string),
            creation_date: value
                .dict_get(b"creation date")
                .and_then(Value::as_int),
        })
    }

    /// Builds a metainfo from a raw `info` dictionary received over
    /// ut_metadata (BEP 9), verifying it against the info-hash the magnet
    /// promised. Trackers, if any, come from the magnet and are attached by
    /// the caller.
    pub fn from_info_bytes(
        buf: &[u8],
        expected_info_hash: Sha1Hash,
    ) -> Result<Self> {
        let info_hash = sha1_of(buf);
        if info_hash != expected_info_hash {
            return Err(invalid("info dictionary does not match info-hash"));
        }
        let info = bencode::decode(buf)?;
        let (name, piece_len, piece_hashes, files, private) =
            parse_info(&info)?;
        Ok(Self {
            name,
            info_hash,
            piece_hashes,
            piece_len,
            files,
            trackers: Vec::new(),
            web_seeds: Vec::new(),
            private,
            comment: None,
            created_by: None,
            creation_date: None,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// The expected hash of the piece at the given index.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let pos = index.checked_mul(20)?;
        let slice = self.piece_hashes.get(pos..pos + 20)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// The sum of all file lengths.
    pub fn download_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// Whether the torrent is an archive of multiple files.
    pub fn is_archive(&self) -> bool {
        self.files.len() > 1
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidTorrent {
        reason: reason.into(),
    }
}

fn sha1_of(buf: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(buf);
    let mut hash = [0; 20];
    hash.copy_from_slice(&digest);
    hash
}

/// Extracts and validates the fields of the `info` dictionary, flattening
/// single and multi file mode into a uniform file table with computed torrent
/// offsets.
#[allow(clippy::type_complexity)]
fn parse_info(
    info: &Value,
) -> Result<(String, u32, Vec<u8>, Vec<FileInfo>, bool)> {
    let name = info
        .dict_get(b"name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| invalid("missing or empty name"))?
        .to_string();

    let piece_len = info
        .dict_get(b"piece length")
        .and_then(Value::as_int)
        .filter(|len| *len > 0 && *len <= u32::MAX as i64)
        .ok_or_else(|| invalid("piece length must be positive"))?
        as u32;

    let piece_hashes = info
        .dict_get(b"pieces")
        .and_then(Value::as_bytes)
        .ok_or_else(|| invalid("missing piece hashes"))?
        .to_vec();
    if piece_hashes.is_empty() || piece_hashes.len() % 20 != 0 {
        return Err(invalid("piece hash string must be a multiple of 20"));
    }

    let files = match (info.dict_get(b"length"), info.dict_get(b"files")) {
        (Some(len), None) => {
            let len = len
                .as_int()
                .filter(|len| *len > 0)
                .ok_or_else(|| invalid("file length must be positive"))?;
            vec![FileInfo {
                path: PathBuf::from(&name),
                len: len as u64,
                torrent_offset: 0,
            }]
        }
        (None, Some(file_list)) => {
            let file_list = file_list
                .as_list()
                .filter(|files| !files.is_empty())
                .ok_or_else(|| invalid("files must be a non-empty list"))?;
            let mut files = Vec::with_capacity(file_list.len());
            let mut torrent_offset = 0;
            for file in file_list {
                let len = file
                    .dict_get(b"length")
                    .and_then(Value::as_int)
                    .filter(|len| *len > 0)
                    .ok_or_else(|| invalid("file length must be positive"))?;
                let path = parse_file_path(file)?;
                files.push(FileInfo {
                    path,
                    len: len as u64,
                    torrent_offset,
                });
                torrent_offset += len as u64;
            }
            files
        }
        _ => {
            return Err(invalid(
                "info must have exactly one of length and files",
            ))
        }
    };

    // the hash list must cover the content: one hash per piece
    let download_len: u64 = files.iter().map(|f| f.len).sum();
    let piece_count = (download_len + piece_len as u64 - 1) / piece_len as u64;
    if piece_count != (piece_hashes.len() / 20) as u64 {
        return Err(invalid("piece hash count does not match content length"));
    }

    let private = info
        .dict_get(b"private")
        .and_then(Value::as_int)
        .map(|p| p == 1)
        .unwrap_or(false);

    Ok((name, piece_len, piece_hashes, files, private))
}

/// Parses a multi-file entry's `path` component list into a safe relative
/// path.
fn parse_file_path(file: &Value) -> Result<PathBuf> {
    let components = file
        .dict_get(b"path")
        .and_then(Value::as_list)
        .filter(|path| !path.is_empty())
        .ok_or_else(|| invalid("file path must be a non-empty list"))?;
    let mut path = PathBuf::new();
    for component in components {
        let component = component
            .as_str()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| invalid("file path component must be a string"))?;
        path.push(component);
    }
    // a torrent must never write outside its download directory
    if path.components().any(|c| {
        !matches!(c, Component::Normal(_))
    }) {
        return Err(invalid("file path must be relative without parent dirs"));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bencode::encode;

    fn bytes_key(key: &str) -> Vec<u8> {
        key.as_bytes().to_vec()
    }

    fn single_file_info(piece_hashes: &[u8]) -> Value {
        let mut info = BTreeMap::new();
        info.insert(bytes_key("length"), Value::Int(150_000));
        info.insert(bytes_key("name"), Value::from("data.bin"));
        info.insert(bytes_key("piece length"), Value::Int(65_536));
        info.insert(bytes_key("pieces"), Value::Bytes(piece_hashes.to_vec()));
        Value::Dict(info)
    }

    fn torrent_bytes(info: Value) -> Vec<u8> {
        let mut root = BTreeMap::new();
        root.insert(
            bytes_key("announce"),
            Value::from("http://tracker.example/announce"),
        );
        root.insert(bytes_key("info"), info);
        encode(&Value::Dict(root))
    }

    #[test]
    fn test_parse_single_file() {
        // 150000 bytes at 64 KiB pieces is 3 pieces
        let hashes = vec![0xab; 3 * 20];
        let buf = torrent_bytes(single_file_info(&hashes));
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        assert_eq!(metainfo.name, "data.bin");
        assert_eq!(metainfo.piece_len, 65_536);
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.download_len(), 150_000);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].path, PathBuf::from("data.bin"));
        assert_eq!(metainfo.files[0].torrent_offset, 0);
        assert!(!metainfo.is_archive());
        assert!(!metainfo.private);
        assert_eq!(metainfo.trackers.len(), 1);
    }

    #[test]
    fn test_parse_multi_file_offsets() {
        let mut info = BTreeMap::new();
        let files = vec![
            ("a.bin", 70_000_i64),
            ("b.bin", 50_000),
            ("c.bin", 30_000),
        ];
        let file_values: Vec<_> = files
            .iter()
            .map(|(name, len)| {
                let mut file = BTreeMap::new();
                file.insert(bytes_key("length"), Value::Int(*len));
                file.insert(
                    bytes_key("path"),
                    Value::List(vec![
                        Value::from("sub"),
                        Value::from(*name),
                    ]),
                );
                Value::Dict(file)
            })
            .collect();
        info.insert(bytes_key("files"), Value::List(file_values));
        info.insert(bytes_key("name"), Value::from("archive"));
        info.insert(bytes_key("piece length"), Value::Int(65_536));
        // 150000 bytes total, 3 pieces
        info.insert(bytes_key("pieces"), Value::Bytes(vec![0xcd; 3 * 20]));
        info.insert(bytes_key("private"), Value::Int(1));

        let metainfo =
            Metainfo::from_bytes(&torrent_bytes(Value::Dict(info))).unwrap();

        assert!(metainfo.is_archive());
        assert!(metainfo.private);
        assert_eq!(metainfo.files.len(), 3);
        assert_eq!(metainfo.files[0].torrent_offset, 0);
        assert_eq!(metainfo.files[1].torrent_offset, 70_000);
        assert_eq!(metainfo.files[2].torrent_offset, 120_000);
        assert_eq!(metainfo.files[1].path, PathBuf::from("sub/b.bin"));
    }

    #[test]
    fn test_info_hash_is_over_raw_slice() {
        let hashes = vec![0xab; 3 * 20];
        let buf = torrent_bytes(single_file_info(&hashes));

        // locate the info slice by hand and hash it
        let range =
            bencode::raw_value_range(&buf, b"info").unwrap().unwrap();
        let expected = sha1_of(&buf[range]);

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.info_hash, expected);

        // parsing twice yields the same hash
        let again = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(again.info_hash, metainfo.info_hash);
    }

    #[test]
    fn test_from_info_bytes_round_trip() {
        let info = single_file_info(&vec![0xab; 3 * 20]);
        let info_bytes = encode(&info);
        let info_hash = sha1_of(&info_bytes);

        let metainfo =
            Metainfo::from_info_bytes(&info_bytes, info_hash).unwrap();
        assert_eq!(metainfo.info_hash, info_hash);
        assert_eq!(metainfo.name, "data.bin");

        // a wrong expected hash must be rejected
        assert!(Metainfo::from_info_bytes(&info_bytes, [0; 20]).is_err());
    }

    #[test]
    fn test_invalid_piece_hash_length() {
        // 2 hashes for 3 pieces worth of content
        let buf = torrent_bytes(single_file_info(&vec![0xab; 2 * 20]));
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidTorrent { .. })
        ));
    }

    #[test]
    fn test_unsafe_file_path_rejected() {
        let mut file = BTreeMap::new();
        file.insert(bytes_key("length"), Value::Int(100));
        file.insert(
            bytes_key("path"),
            Value::List(vec![Value::from(".."), Value::from("evil")]),
        );
        let mut info = BTreeMap::new();
        info.insert(bytes_key("files"), Value::List(vec![Value::Dict(file)]));
        info.insert(bytes_key("name"), Value::from("archive"));
        info.insert(bytes_key("piece length"), Value::Int(65_536));
        info.insert(bytes_key("pieces"), Value::Bytes(vec![0xcd; 20]));

        assert!(matches!(
            Metainfo::from_bytes(&torrent_bytes(Value::Dict(info))),
            Err(Error::InvalidTorrent { .. })
        ));
    }
}
