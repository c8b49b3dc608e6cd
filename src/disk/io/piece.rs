use std::{collections::BTreeMap, ops::Range};

use sha1::{Digest, Sha1};

use super::file::TorrentFile;
use crate::{
    block_count,
    disk::{StorageError, WriteError},
    FileIndex, Sha1Hash,
};

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
pub(super) struct Piece {
    /// The expected hash of the whole piece.
    pub expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    pub len: u32,
    /// The so far downloaded blocks, each mapped to its offset within piece.
    /// A BTreeMap keeps the blocks ordered by offset, so hashing and
    /// assembly can just walk the values.
    pub blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with, as a left-inclusive index
    /// range into the torrent's file list.
    pub file_range: Range<FileIndex>,
}

impl Piece {
    /// Places block into piece's write buffer if it isn't already there.
    /// Returns whether the block was new.
    pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) -> bool {
        if self.blocks.contains_key(&offset) {
            log::warn!("duplicate piece block at offset {}", offset);
            false
        } else {
            self.blocks.insert(offset, data);
            true
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    pub fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on the
    /// blocking thread pool and not the async executor.
    pub fn matches_hash(&self) -> bool {
        debug_assert!(self.is_complete());
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        hash.as_slice() == self.expected_hash
    }

    /// Concatenates the blocks into the piece's contiguous bytes.
    pub fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut buf = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            buf.extend_from_slice(block);
        }
        debug_assert_eq!(buf.len(), self.len as usize);
        buf
    }

    /// Writes the assembled piece to the files it overlaps with.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on the blocking thread pool and not the async executor.
    pub fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[TorrentFile],
    ) -> Result<(), WriteError> {
        let buf = self.assemble();
        write_piece_bytes(
            &buf,
            piece_torrent_offset,
            &files[self.file_range.clone()],
        )?;
        Ok(())
    }
}

/// Writes a piece's contiguous bytes across the files it straddles.
pub(super) fn write_piece_bytes(
    buf: &[u8],
    piece_torrent_offset: u64,
    files: &[TorrentFile],
) -> Result<(), StorageError> {
    debug_assert!(!files.is_empty());
    let mut torrent_offset = piece_torrent_offset;
    let mut cursor = 0;
    for file in files {
        let slice = file
            .info
            .get_slice(torrent_offset, (buf.len() - cursor) as u64);
        // an empty file slice would mean the piece was thought to span more
        // files than it actually does
        debug_assert!(slice.len > 0);
        file.write_all_at(
            &buf[cursor..cursor + slice.len as usize],
            slice.offset,
        )?;
        torrent_offset += slice.len;
        cursor += slice.len as usize;
    }
    // all bytes must have found a home
    debug_assert_eq!(cursor, buf.len());
    Ok(())
}

/// Reads a piece's contiguous bytes from the files it straddles.
///
/// # Important
///
/// Blocking, for the blocking thread pool.
pub(super) fn read_piece_bytes(
    len: u32,
    piece_torrent_offset: u64,
    files: &[TorrentFile],
) -> Result<Vec<u8>, StorageError> {
    debug_assert!(!files.is_empty());
    let mut buf = vec![0; len as usize];
    let mut torrent_offset = piece_torrent_offset;
    let mut cursor = 0;
    for file in files {
        let slice = file
            .info
            .get_slice(torrent_offset, (buf.len() - cursor) as u64);
        debug_assert!(slice.len > 0);
        file.read_exact_at(
            &mut buf[cursor..cursor + slice.len as usize],
            slice.offset,
        )?;
        torrent_offset += slice.len;
        cursor += slice.len as usize;
    }
    debug_assert_eq!(cursor, buf.len());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::Prealloc, storage_info::FileInfo, BLOCK_LEN};

    fn sha1_of(buf: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(buf);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    fn piece_with_blocks(len: u32) -> (Piece, Vec<u8>) {
        let mut content = Vec::with_capacity(len as usize);
        for i in 0..len {
            content.push((i % 251) as u8);
        }
        let mut piece = Piece {
            expected_hash: sha1_of(&content),
            len,
            blocks: BTreeMap::new(),
            file_range: 0..1,
        };
        // insert blocks out of order; assembly must not care
        let mut offsets: Vec<u32> =
            (0..block_count(len) as u32).map(|i| i * BLOCK_LEN).collect();
        offsets.reverse();
        for offset in offsets {
            let end = (offset + BLOCK_LEN).min(len) as usize;
            piece.enqueue_block(
                offset,
                content[offset as usize..end].to_vec(),
            );
        }
        (piece, content)
    }

    #[test]
    fn test_completion_and_hash() {
        let (piece, content) = piece_with_blocks(2 * BLOCK_LEN + 1234);
        assert!(piece.is_complete());
        assert!(piece.matches_hash());
        assert_eq!(piece.assemble(), content);
    }

    #[test]
    fn test_corrupt_block_fails_hash() {
        let (mut piece, _) = piece_with_blocks(2 * BLOCK_LEN);
        let last = piece.blocks.get_mut(&BLOCK_LEN).unwrap();
        let flipped = last.last_mut().unwrap();
        *flipped = flipped.wrapping_add(1);
        assert!(piece.is_complete());
        assert!(!piece.matches_hash());
    }

    #[test]
    fn test_duplicate_block_ignored() {
        let (mut piece, _) = piece_with_blocks(BLOCK_LEN);
        assert!(!piece.enqueue_block(0, vec![0; BLOCK_LEN as usize]));
    }

    fn open_file(name: &str, len: u64, torrent_offset: u64) -> TorrentFile {
        let path = std::env::temp_dir().join(format!(
            "riptide-piece-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        TorrentFile::open(
            FileInfo {
                path,
                len,
                torrent_offset,
            },
            Prealloc::None,
        )
        .unwrap()
    }

    fn cleanup(files: &[TorrentFile]) {
        for file in files {
            let _ = std::fs::remove_file(&file.info.path);
        }
    }

    #[test]
    fn test_write_and_read_across_file_boundary() {
        // a piece that straddles two files: 1000 bytes into the first, the
        // rest into the second
        let piece_len = BLOCK_LEN;
        let piece_torrent_offset = 0;
        let files = vec![
            open_file("boundary-a", 1000, 0),
            open_file("boundary-b", BLOCK_LEN as u64, 1000),
        ];

        let (mut piece, content) = piece_with_blocks(piece_len);
        piece.file_range = 0..2;
        piece.write(piece_torrent_offset, &files).unwrap();

        let read_back =
            read_piece_bytes(piece_len, piece_torrent_offset, &files)
                .unwrap();
        assert_eq!(read_back, content);

        // the first file holds exactly its share
        let mut first = vec![0; 1000];
        files[0].read_exact_at(&mut first, 0).unwrap();
        assert_eq!(first, content[..1000].to_vec());
        cleanup(&files);
    }

    #[test]
    fn test_path_of_piece_bytes() {
        let files = vec![open_file("single", BLOCK_LEN as u64, 0)];
        let (piece, content) = piece_with_blocks(BLOCK_LEN);
        piece.write(0, &files).unwrap();
        let read_back = read_piece_bytes(BLOCK_LEN, 0, &files).unwrap();
        assert_eq!(read_back, content);
        cleanup(&files);
    }
}
