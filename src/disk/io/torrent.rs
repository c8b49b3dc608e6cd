use std::{
    collections::HashMap,
    fs,
    sync::{atomic::Ordering, Arc},
};

use lru::LruCache;
use tokio::{sync::mpsc, task};

use super::{
    file::TorrentFile,
    piece::{self, Piece},
};
use crate::{
    conf::Prealloc,
    disk::{
        DiskStats, NewTorrentError, PieceCompletion, ReadError, StorageError,
        StorageErrorKind, TorrentAlert, TorrentAlertReceiver,
        TorrentAlertSender, WriteError,
    },
    error::*,
    peer,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, the file handles, and the piece read
/// cache used for serving.
pub(super) struct Torrent {
    info_hash: Sha1Hash,
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed, or that a check pass finished.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation. Blocking tasks reference them through the arc.
    files: Arc<Vec<TorrentFile>>,
    /// Pieces recently read for serving, up to a byte budget.
    read_cache: LruCache<PieceIndex, Arc<Vec<u8>>>,
    read_cache_budget: u64,
    read_cache_size: u64,
    stats: Arc<DiskStats>,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles, preallocating according to the chosen strategy.
    ///
    /// Blocking; run on the blocking thread pool.
    pub fn new(
        info_hash: Sha1Hash,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        prealloc: Prealloc,
        read_cache_budget: u64,
    ) -> std::result::Result<
        (Self, TorrentAlertReceiver, Arc<DiskStats>),
        NewTorrentError,
    > {
        fs::create_dir_all(&info.download_dir).map_err(|e| {
            StorageError::from_io(&info.download_dir, e)
        })?;

        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            debug_assert!(!file.path.is_absolute());
            let path = info.download_dir.join(&file.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    log::debug!("creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(subdir).map_err(|e| {
                        StorageError::from_io(subdir, e)
                    })?;
                }
            }
            files.push(TorrentFile::open(
                crate::storage_info::FileInfo {
                    path,
                    len: file.len,
                    torrent_offset: file.torrent_offset,
                },
                prealloc,
            )?);
        }

        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let stats = Arc::new(DiskStats::default());

        Ok((
            Self {
                info_hash,
                info,
                piece_hashes,
                alert_chan,
                write_buf: HashMap::new(),
                files: Arc::new(files),
                read_cache: LruCache::unbounded(),
                read_cache_budget,
                read_cache_size: 0,
                stats: Arc::clone(&stats),
            },
            alert_port,
            stats,
        ))
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    pub fn send_alert(&self, alert: TorrentAlert) -> Result<()> {
        self.alert_chan.send(alert)?;
        Ok(())
    }

    /// Stages a block in the piece's write buffer; once the piece is
    /// complete, hashes it and, if valid, flushes it to disk. The outcome is
    /// reported on the torrent's alert channel.
    pub async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("saving block {} to disk", info);

        if data.len() != info.len as usize {
            log::warn!("block {} length mismatch", info);
            return self
                .send_alert(TorrentAlert::PieceCompletion(Err(
                    WriteError::InvalidBlock,
                )));
        }

        let piece_index = info.piece_index;
        if !self.write_buf.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                return self
                    .send_alert(TorrentAlert::PieceCompletion(Err(e)));
            }
        }
        let piece = self
            .write_buf
            .get_mut(&piece_index)
            .expect("newly started piece not in write buffer");

        if piece.enqueue_block(info.offset, data) {
            self.stats.write_queue_depth.fetch_add(1, Ordering::Relaxed);
        }

        // if the piece has all its blocks, we can hash it, and save it to
        // disk if valid
        if piece.is_complete() {
            let piece = self
                .write_buf
                .remove(&piece_index)
                .expect("complete piece not in write buffer");
            let block_count = piece.blocks.len();
            let piece_torrent_offset = self.info.piece_offset(piece_index);
            let files = Arc::clone(&self.files);

            // a freshly assembled and verified piece is about to be served
            // from disk; invalidate any stale cache entry
            self.read_cache.pop(&piece_index);

            self.stats.hash_queue_depth.fetch_add(1, Ordering::Relaxed);
            // don't block the executor with the expensive hashing and sync
            // file writing
            let write_result = task::spawn_blocking(move || {
                let is_valid = piece.matches_hash();
                if is_valid {
                    piece.write(piece_torrent_offset, &files)?;
                }
                Ok::<_, WriteError>(is_valid)
            })
            .await
            // our code doesn't panic in the task so until better strategies
            // are devised, unwrap here
            .expect("disk IO write task panicked");

            self.stats.hash_queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.stats
                .write_queue_depth
                .fetch_sub(block_count, Ordering::Relaxed);

            let alert = match write_result {
                Ok(is_valid) => {
                    if is_valid {
                        log::debug!("piece {} is valid", piece_index);
                    } else {
                        log::warn!("piece {} is NOT valid", piece_index);
                    }
                    TorrentAlert::PieceCompletion(Ok(PieceCompletion {
                        index: piece_index,
                        is_valid,
                    }))
                }
                Err(e) => {
                    log::warn!("disk write error: {}", e);
                    TorrentAlert::PieceCompletion(Err(e))
                }
            };
            self.send_alert(alert)?;
        }

        Ok(())
    }

    /// Serves a block read: from the piece cache when possible, otherwise by
    /// reading the whole piece from disk (and caching it). The data is sent
    /// straight to the requesting peer session.
    pub async fn read_block(
        &mut self,
        info: BlockInfo,
        tx: peer::Sender,
    ) -> Result<()> {
        log::trace!("reading block {} from disk", info);

        let piece_len = match self.info.piece_len(info.piece_index) {
            Ok(len) => len,
            Err(_) => {
                return self.read_failed(info, ReadError::InvalidBlock);
            }
        };
        let in_bounds = info
            .offset
            .checked_add(info.len)
            .map(|end| end <= piece_len)
            .unwrap_or(false);
        if info.len == 0 || info.len > BLOCK_LEN || !in_bounds {
            return self.read_failed(info, ReadError::InvalidBlock);
        }

        if let Some(bytes) = self.read_cache.get(&info.piece_index) {
            let start = info.offset as usize;
            let data = bytes[start..start + info.len as usize].to_vec();
            // the peer session may have exited, which is not our concern
            let _ = tx.send(peer::Command::Block { info, data });
            return Ok(());
        }

        let file_range = match self.info.files_intersecting_piece(info.piece_index)
        {
            Ok(range) => range,
            Err(_) => {
                return self.read_failed(info, ReadError::InvalidBlock);
            }
        };
        let piece_torrent_offset = self.info.piece_offset(info.piece_index);
        let files = Arc::clone(&self.files);

        let read_result = task::spawn_blocking(move || {
            piece::read_piece_bytes(
                piece_len,
                piece_torrent_offset,
                &files[file_range],
            )
        })
        .await
        .expect("disk IO read task panicked");

        match read_result {
            Ok(bytes) => {
                let bytes = Arc::new(bytes);
                let start = info.offset as usize;
                let data = bytes[start..start + info.len as usize].to_vec();

                self.read_cache_size += bytes.len() as u64;
                self.read_cache.put(info.piece_index, bytes);
                while self.read_cache_size > self.read_cache_budget {
                    match self.read_cache.pop_lru() {
                        Some((_, evicted)) => {
                            self.read_cache_size -= evicted.len() as u64;
                        }
                        None => break,
                    }
                }

                let _ = tx.send(peer::Command::Block { info, data });
                Ok(())
            }
            Err(e) => self.read_failed(info, ReadError::Storage(e)),
        }
    }

    fn read_failed(&self, block: BlockInfo, error: ReadError) -> Result<()> {
        log::warn!("failed to read block {}: {}", block, error);
        self.send_alert(TorrentAlert::ReadFailed { block, error })
    }

    /// Re-hashes the pieces whose bits are set from disk and reports the
    /// subset that verified. Runs detached so a long check doesn't stall the
    /// disk loop for other torrents.
    pub async fn check_pieces(&self, pieces: Bitfield) -> Result<()> {
        let files = Arc::clone(&self.files);
        let info = self.info.clone();
        let piece_hashes = self.piece_hashes.clone();
        let alert_chan = self.alert_chan.clone();

        task::spawn(async move {
            let result = task::spawn_blocking(move || {
                check_pieces_blocking(&pieces, &info, &piece_hashes, &files)
            })
            .await
            .expect("disk IO check task panicked");
            let _ = alert_chan.send(TorrentAlert::CheckCompletion(result));
        });
        Ok(())
    }

    /// Deletes the torrent's files from disk. Blocking.
    pub fn delete_files(&self) {
        if self.info.files.len() > 1 {
            // archives live in their own directory under the download dir
            if let Err(e) = fs::remove_dir_all(&self.info.download_dir) {
                log::warn!(
                    "failed to remove {:?}: {}",
                    self.info.download_dir,
                    e
                );
            }
        } else {
            for file in self.files.iter() {
                if let Err(e) = fs::remove_file(&file.info.path) {
                    log::warn!(
                        "failed to remove {:?}: {}",
                        file.info.path,
                        e
                    );
                }
            }
        }
    }

    /// Sets up the in-memory bookkeeping of a new in-progress piece.
    fn start_new_piece(
        &mut self,
        info: BlockInfo,
    ) -> std::result::Result<(), WriteError> {
        log::trace!("creating piece {} write buffer", info.piece_index);

        let hash_pos = info.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("piece index {} is invalid", info.piece_index);
            return Err(WriteError::InvalidBlock);
        }
        let mut expected_hash = [0; 20];
        expected_hash
            .copy_from_slice(&self.piece_hashes[hash_pos..hash_pos + 20]);

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError::InvalidBlock)?;
        let file_range = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError::InvalidBlock)?;

        self.write_buf.insert(
            info.piece_index,
            Piece {
                expected_hash,
                len,
                blocks: Default::default(),
                file_range,
            },
        );
        Ok(())
    }
}

/// The full-scan verification used on resume: reads and hashes every claimed
/// piece. Pieces that can't be read (missing or short files) simply don't
/// verify.
fn check_pieces_blocking(
    pieces: &Bitfield,
    info: &StorageInfo,
    piece_hashes: &[u8],
    files: &[TorrentFile],
) -> std::result::Result<Bitfield, StorageError> {
    use sha1::{Digest, Sha1};

    let mut verified = Bitfield::repeat(false, pieces.len());
    for (index, claimed) in pieces.iter().enumerate() {
        if !*claimed {
            continue;
        }
        let piece_len = info
            .piece_len(index)
            .map_err(|_| StorageError::new("", StorageErrorKind::Corrupted))?;
        let file_range = info
            .files_intersecting_piece(index)
            .map_err(|_| StorageError::new("", StorageErrorKind::Corrupted))?;
        let bytes = match piece::read_piece_bytes(
            piece_len,
            info.piece_offset(index),
            &files[file_range],
        ) {
            Ok(bytes) => bytes,
            Err(e) if e.kind == StorageErrorKind::Corrupted => {
                // data missing on disk: the piece is just not verified
                continue;
            }
            Err(e) => return Err(e),
        };
        let digest = Sha1::digest(&bytes);
        let hash_pos = index * 20;
        if piece_hashes
            .get(hash_pos..hash_pos + 20)
            .map(|expected| digest.as_slice() == expected)
            .unwrap_or(false)
        {
            verified.set(index, true);
        }
    }
    Ok(verified)
}
