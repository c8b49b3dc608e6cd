//! Persistent per-torrent progress records.
//!
//! A checkpoint snapshots the verified-pieces bitfield, the transfer
//! counters, and the source reference (torrent file path or magnet URI) so a
//! torrent can resume across restarts. Losing an unsaved, not yet verified
//! block is acceptable: it only causes a re-download. A checkpoint must never
//! claim a piece that doesn't hash correctly on disk, which is why resume
//! re-verifies claimed pieces before trusting them.
//!
//! Two round-trippable encodings exist: a human readable bencoded dictionary
//! and a compact binary layout. Files are written atomically
//! (write-to-temp, then rename), one file per info-hash.

use std::{
    convert::TryInto,
    fmt, fs, io,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    bencode::{self, DecodeError, Value},
    Bitfield, Sha1Hash,
};

/// The binary encoding magic, followed by a format version.
const MAGIC: &[u8; 4] = b"RPCP";
const VERSION: u16 = 1;
/// Flag bit reserved for a compressed payload. Never set by this version.
const FLAG_COMPRESSED: u8 = 0x01;

/// The two on-disk encodings of a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// A bencoded key-value dictionary, inspectable with any bencode tool.
    Bencode,
    /// The compact binary layout.
    Binary,
}

#[derive(Debug)]
pub enum CheckpointError {
    /// The record's structure doesn't decode.
    Malformed(String),
    /// The record was written by an unknown future version.
    UnsupportedVersion(u16),
    Bencode(DecodeError),
    Io(io::Error),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(reason) => {
                write!(f, "malformed checkpoint: {}", reason)
            }
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported checkpoint version {}", version)
            }
            Self::Bencode(e) => write!(f, "malformed checkpoint: {}", e),
            Self::Io(e) => write!(f, "checkpoint IO error: {}", e),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<io::Error> for CheckpointError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for CheckpointError {
    fn from(e: DecodeError) -> Self {
        Self::Bencode(e)
    }
}

fn malformed(reason: impl Into<String>) -> CheckpointError {
    CheckpointError::Malformed(reason.into())
}

/// A snapshot of a torrent's progress.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub info_hash: Sha1Hash,
    /// The torrent file path or magnet URI the torrent was added from, used
    /// for re-ingestion.
    pub source: Option<String>,
    /// One bit per piece; a set bit means the piece was verified at save
    /// time.
    pub pieces: Bitfield,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Unix timestamp of the save.
    pub timestamp: u64,
}

impl Checkpoint {
    /// Encodes the checkpoint in the requested format.
    pub fn encode(&self, format: CheckpointFormat) -> Vec<u8> {
        match format {
            CheckpointFormat::Bencode => self.encode_bencode(),
            CheckpointFormat::Binary => self.encode_binary(),
        }
    }

    /// Decodes a checkpoint, sniffing the encoding by the binary magic.
    pub fn decode(buf: &[u8]) -> Result<Self, CheckpointError> {
        if buf.starts_with(MAGIC) {
            Self::decode_binary(buf)
        } else {
            Self::decode_bencode(buf)
        }
    }

    fn encode_bencode(&self) -> Vec<u8> {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"downloaded".to_vec(), Value::Int(self.downloaded as i64));
        dict.insert(
            b"info hash".to_vec(),
            Value::Bytes(self.info_hash.to_vec()),
        );
        dict.insert(
            b"piece count".to_vec(),
            Value::Int(self.pieces.len() as i64),
        );
        dict.insert(
            b"pieces".to_vec(),
            Value::Bytes(self.pieces.as_slice().to_vec()),
        );
        if let Some(source) = &self.source {
            dict.insert(b"source".to_vec(), Value::from(source.as_str()));
        }
        dict.insert(b"timestamp".to_vec(), Value::Int(self.timestamp as i64));
        dict.insert(b"uploaded".to_vec(), Value::Int(self.uploaded as i64));
        dict.insert(b"version".to_vec(), Value::Int(VERSION as i64));
        bencode::encode(&Value::Dict(dict))
    }

    fn decode_bencode(buf: &[u8]) -> Result<Self, CheckpointError> {
        let value = bencode::decode(buf)?;

        let version = value
            .dict_get(b"version")
            .and_then(Value::as_int)
            .ok_or_else(|| malformed("no version"))?;
        if version != VERSION as i64 {
            return Err(CheckpointError::UnsupportedVersion(version as u16));
        }

        let info_hash_bytes = value
            .dict_get(b"info hash")
            .and_then(Value::as_bytes)
            .filter(|hash| hash.len() == 20)
            .ok_or_else(|| malformed("bad info hash"))?;
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(info_hash_bytes);

        let piece_count = value
            .dict_get(b"piece count")
            .and_then(Value::as_int)
            .filter(|count| *count > 0)
            .ok_or_else(|| malformed("bad piece count"))?
            as usize;
        let piece_bytes = value
            .dict_get(b"pieces")
            .and_then(Value::as_bytes)
            .filter(|bytes| bytes.len() == (piece_count + 7) / 8)
            .ok_or_else(|| malformed("bitfield length mismatch"))?;
        let mut pieces = Bitfield::from_vec(piece_bytes.to_vec());
        pieces.truncate(piece_count);

        Ok(Self {
            info_hash,
            source: value
                .dict_get(b"source")
                .and_then(Value::as_str)
                .map(str::to_string),
            pieces,
            downloaded: value
                .dict_get(b"downloaded")
                .and_then(Value::as_int)
                .unwrap_or(0) as u64,
            uploaded: value
                .dict_get(b"uploaded")
                .and_then(Value::as_int)
                .unwrap_or(0) as u64,
            timestamp: value
                .dict_get(b"timestamp")
                .and_then(Value::as_int)
                .unwrap_or(0) as u64,
        })
    }

    fn encode_binary(&self) -> Vec<u8> {
        let bitfield = self.pieces.as_slice();
        let source = self.source.as_deref().unwrap_or("");
        let mut buf =
            Vec::with_capacity(4 + 2 + 1 + 20 + 4 + bitfield.len() + 26 + source.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_be_bytes());
        // flags: no compression
        buf.push(0);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&(self.pieces.len() as u32).to_be_bytes());
        buf.extend_from_slice(bitfield);
        buf.extend_from_slice(&self.downloaded.to_be_bytes());
        buf.extend_from_slice(&self.uploaded.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&(source.len() as u16).to_be_bytes());
        buf.extend_from_slice(source.as_bytes());
        buf
    }

    fn decode_binary(buf: &[u8]) -> Result<Self, CheckpointError> {
        let mut reader = Reader { buf, pos: 0 };
        let magic = reader.take(4)?;
        debug_assert_eq!(magic, MAGIC);
        let version = u16::from_be_bytes([reader.byte()?, reader.byte()?]);
        if version != VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        let flags = reader.byte()?;
        if flags & FLAG_COMPRESSED != 0 {
            return Err(malformed("compressed payloads are not supported"));
        }

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(reader.take(20)?);

        let piece_count = u32::from_be_bytes(
            reader.take(4)?.try_into().expect("4 byte slice"),
        ) as usize;
        if piece_count == 0 {
            return Err(malformed("zero piece count"));
        }
        let bitfield_len = (piece_count + 7) / 8;
        let mut pieces = Bitfield::from_vec(reader.take(bitfield_len)?.to_vec());
        pieces.truncate(piece_count);

        let downloaded = u64::from_be_bytes(
            reader.take(8)?.try_into().expect("8 byte slice"),
        );
        let uploaded = u64::from_be_bytes(
            reader.take(8)?.try_into().expect("8 byte slice"),
        );
        let timestamp = u64::from_be_bytes(
            reader.take(8)?.try_into().expect("8 byte slice"),
        );
        let source_len = u16::from_be_bytes([reader.byte()?, reader.byte()?]);
        let source = if source_len > 0 {
            Some(
                String::from_utf8(reader.take(source_len as usize)?.to_vec())
                    .map_err(|_| malformed("source is not UTF-8"))?,
            )
        } else {
            None
        };

        Ok(Self {
            info_hash,
            source,
            pieces,
            downloaded,
            uploaded,
            timestamp,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CheckpointError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed("truncated record"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, CheckpointError> {
        Ok(self.take(1)?[0])
    }
}

/// The current unix time in seconds, for stamping checkpoints.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// The directory of checkpoint records, one file per info-hash.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    format: CheckpointFormat,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, format: CheckpointFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    fn record_path(&self, info_hash: &Sha1Hash) -> PathBuf {
        self.dir.join(format!("{}.resume", hex::encode(info_hash)))
    }

    /// Atomically writes the record: the encoding goes to a temp file which
    /// is then renamed over the final path.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&checkpoint.info_hash);
        let tmp_path = path.with_extension("resume.tmp");
        fs::write(&tmp_path, checkpoint.encode(self.format))?;
        fs::rename(&tmp_path, &path)?;
        log::debug!(
            "saved checkpoint for {} to {:?}",
            hex::encode(checkpoint.info_hash),
            path
        );
        Ok(())
    }

    /// Loads the record of a torrent, or `None` if there isn't one.
    pub fn load(
        &self,
        info_hash: &Sha1Hash,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.record_path(info_hash);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = Checkpoint::decode(&buf)?;
        if checkpoint.info_hash != *info_hash {
            return Err(malformed("record is for a different torrent"));
        }
        Ok(Some(checkpoint))
    }

    pub fn remove(&self, info_hash: &Sha1Hash) -> Result<(), CheckpointError> {
        match fs::remove_file(self.record_path(info_hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns all decodeable records in the directory.
    pub fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e.into()),
        };
        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map(|e| e == "resume") != Some(true) {
                continue;
            }
            match fs::read(&path).map_err(CheckpointError::from).and_then(
                |buf| Checkpoint::decode(&buf),
            ) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    log::warn!("skipping unreadable checkpoint {:?}: {}", path, e)
                }
            }
        }
        Ok(checkpoints)
    }

    /// Removes records older than the given age. Returns how many were
    /// removed.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, CheckpointError> {
        let cutoff = unix_now().saturating_sub(max_age.as_secs());
        let mut removed = 0;
        for checkpoint in self.list()? {
            if checkpoint.timestamp < cutoff {
                self.remove(&checkpoint.info_hash)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_checkpoint() -> Checkpoint {
        let mut pieces = Bitfield::repeat(false, 21);
        for index in [0, 1, 3, 17, 20].iter() {
            pieces.set(*index, true);
        }
        Checkpoint {
            info_hash: [0xfe; 20],
            source: Some("/downloads/data.torrent".into()),
            pieces,
            downloaded: 123_456_789,
            uploaded: 42,
            timestamp: 1_700_000_000,
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "riptide-checkpoint-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_bencode_round_trip() {
        let checkpoint = test_checkpoint();
        let buf = checkpoint.encode(CheckpointFormat::Bencode);
        assert_eq!(Checkpoint::decode(&buf).unwrap(), checkpoint);
    }

    #[test]
    fn test_binary_round_trip() {
        let checkpoint = test_checkpoint();
        let buf = checkpoint.encode(CheckpointFormat::Binary);
        assert!(buf.starts_with(MAGIC));
        assert_eq!(Checkpoint::decode(&buf).unwrap(), checkpoint);
    }

    #[test]
    fn test_binary_round_trip_without_source() {
        let mut checkpoint = test_checkpoint();
        checkpoint.source = None;
        let buf = checkpoint.encode(CheckpointFormat::Binary);
        assert_eq!(Checkpoint::decode(&buf).unwrap(), checkpoint);
    }

    #[test]
    fn test_truncated_binary_rejected() {
        let buf = test_checkpoint().encode(CheckpointFormat::Binary);
        assert!(matches!(
            Checkpoint::decode(&buf[..buf.len() - 10]),
            Err(CheckpointError::Malformed(_))
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut buf = test_checkpoint().encode(CheckpointFormat::Binary);
        buf[5] = 99;
        assert!(matches!(
            Checkpoint::decode(&buf),
            Err(CheckpointError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_store_save_load_remove() {
        let dir = test_dir("store");
        let store =
            CheckpointStore::new(&dir, CheckpointFormat::Binary);
        let checkpoint = test_checkpoint();

        assert!(store.load(&checkpoint.info_hash).unwrap().is_none());
        store.save(&checkpoint).unwrap();
        assert_eq!(
            store.load(&checkpoint.info_hash).unwrap(),
            Some(checkpoint.clone())
        );

        // no stray temp file is left behind
        let stray: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "tmp") == Some(true))
            .collect();
        assert!(stray.is_empty());

        store.remove(&checkpoint.info_hash).unwrap();
        assert!(store.load(&checkpoint.info_hash).unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_store_cleanup_removes_old_records() {
        let dir = test_dir("cleanup");
        let store =
            CheckpointStore::new(&dir, CheckpointFormat::Bencode);

        let mut old = test_checkpoint();
        old.timestamp = 1000;
        store.save(&old).unwrap();

        let mut fresh = test_checkpoint();
        fresh.info_hash = [0xaa; 20];
        fresh.timestamp = unix_now();
        store.save(&fresh).unwrap();

        let removed =
            store.cleanup(Duration::from_secs(24 * 60 * 60)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&old.info_hash).unwrap().is_none());
        assert!(store.load(&fresh.info_hash).unwrap().is_some());
        let _ = fs::remove_dir_all(&dir);
    }
}
