use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
};

use nix::sys::uio::{pread, pwrite};

use crate::{
    conf::Prealloc,
    disk::{StorageError, StorageErrorKind},
    storage_info::FileInfo,
};

/// A torrent file opened for positioned reads and writes.
///
/// All I/O goes through `pwrite`/`pread` so concurrent blocking tasks never
/// contend on a shared cursor, and writes to disjoint regions don't need any
/// coordination beyond the per-file handle.
pub(super) struct TorrentFile {
    /// The file's metadata, with the path anchored in the download directory.
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens (creating if necessary) the file and applies the preallocation
    /// strategy.
    pub fn open(
        info: FileInfo,
        prealloc: Prealloc,
    ) -> Result<Self, StorageError> {
        let handle = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&info.path)
            .map_err(|e| StorageError::from_io(&info.path, e))?;

        match prealloc {
            Prealloc::None => {}
            Prealloc::Sparse => {
                let disk_len = handle
                    .metadata()
                    .map_err(|e| StorageError::from_io(&info.path, e))?
                    .len();
                if disk_len < info.len {
                    // extending with set_len produces a sparse tail
                    handle
                        .set_len(info.len)
                        .map_err(|e| StorageError::from_io(&info.path, e))?;
                }
            }
            Prealloc::Full => {
                nix::fcntl::posix_fallocate(
                    handle.as_raw_fd(),
                    0,
                    info.len as i64,
                )
                .map_err(|e| {
                    StorageError::from_io(&info.path, nix_to_io(e))
                })?;
            }
        }

        Ok(Self { info, handle })
    }

    /// Writes the whole buffer at the given file offset, retrying short
    /// writes.
    pub fn write_all_at(
        &self,
        mut buf: &[u8],
        mut offset: u64,
    ) -> Result<(), StorageError> {
        while !buf.is_empty() {
            match pwrite(self.handle.as_raw_fd(), buf, offset as i64) {
                Ok(0) => {
                    return Err(StorageError::from_io(
                        &self.info.path,
                        io::Error::new(
                            io::ErrorKind::WriteZero,
                            "pwrite returned 0",
                        ),
                    ))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if is_interrupted(&e) => continue,
                Err(e) => {
                    return Err(StorageError::from_io(
                        &self.info.path,
                        nix_to_io(e),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Fills the whole buffer from the given file offset, retrying short
    /// reads. Running past the end of file is an error: served blocks must
    /// only cover verified pieces, which are on disk in full.
    pub fn read_exact_at(
        &self,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> Result<(), StorageError> {
        while !buf.is_empty() {
            match pread(self.handle.as_raw_fd(), buf, offset as i64) {
                Ok(0) => {
                    return Err(StorageError::new(
                        &self.info.path,
                        StorageErrorKind::Corrupted,
                    ))
                }
                Ok(n) => {
                    buf = &mut std::mem::take(&mut buf)[n..];
                    offset += n as u64;
                }
                Err(e) if is_interrupted(&e) => continue,
                Err(e) => {
                    return Err(StorageError::from_io(
                        &self.info.path,
                        nix_to_io(e),
                    ))
                }
            }
        }
        Ok(())
    }
}

fn is_interrupted(e: &nix::Error) -> bool {
    e.as_errno() == Some(nix::errno::Errno::EINTR)
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn test_file(name: &str, len: u64) -> FileInfo {
        let path = std::env::temp_dir().join(format!(
            "riptide-file-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        FileInfo {
            path,
            len,
            torrent_offset: 0,
        }
    }

    fn cleanup(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_write_read_round_trip_at_offset() {
        let info = test_file("rw", 4096);
        let path = info.path.clone();
        let file = TorrentFile::open(info, Prealloc::None).unwrap();

        let data = b"hello torrent".to_vec();
        file.write_all_at(&data, 1000).unwrap();

        let mut read_back = vec![0; data.len()];
        file.read_exact_at(&mut read_back, 1000).unwrap();
        assert_eq!(read_back, data);
        cleanup(&path);
    }

    #[test]
    fn test_sparse_prealloc_sets_length() {
        let info = test_file("sparse", 1 << 20);
        let path = info.path.clone();
        let file = TorrentFile::open(info, Prealloc::Sparse).unwrap();
        assert_eq!(file.handle.metadata().unwrap().len(), 1 << 20);
        cleanup(&path);
    }

    #[test]
    fn test_read_past_end_is_corruption() {
        let info = test_file("short", 4096);
        let path = info.path.clone();
        let file = TorrentFile::open(info, Prealloc::None).unwrap();
        let mut buf = vec![0; 16];
        let err = file.read_exact_at(&mut buf, 0).unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::Corrupted);
        cleanup(&path);
    }
}
