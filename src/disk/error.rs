//! Errors of the disk task.
//!
//! Disk failures are per-torrent: they pause or error the affected torrent
//! and never kill the disk task or the process.

use std::{fmt, io, path::PathBuf};

/// The broad classification of a storage failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StorageErrorKind {
    /// The disk is full.
    NoSpace,
    PermissionDenied,
    /// Any other I/O failure.
    Io,
    /// On-disk data contradicts what a checkpoint claimed.
    Corrupted,
    PathTooLong,
}

/// A storage failure, tagged with the path it occurred on.
#[derive(Debug)]
pub(crate) struct StorageError {
    pub path: PathBuf,
    pub kind: StorageErrorKind,
    /// The underlying OS error, when there is one.
    pub source: Option<io::Error>,
}

impl StorageError {
    pub fn new(path: impl Into<PathBuf>, kind: StorageErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
            source: None,
        }
    }

    /// Classifies an I/O error.
    pub fn from_io(path: impl Into<PathBuf>, e: io::Error) -> Self {
        const ENOSPC: i32 = 28;
        const ENAMETOOLONG: i32 = 36;
        let kind = match (e.kind(), e.raw_os_error()) {
            (_, Some(ENOSPC)) => StorageErrorKind::NoSpace,
            (_, Some(ENAMETOOLONG)) => StorageErrorKind::PathTooLong,
            (io::ErrorKind::PermissionDenied, _) => {
                StorageErrorKind::PermissionDenied
            }
            _ => StorageErrorKind::Io,
        };
        Self {
            path: path.into(),
            kind,
            source: Some(e),
        }
    }

    /// Whether pausing and retrying later can help (disk full), as opposed to
    /// an error that needs operator intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind, StorageErrorKind::NoSpace | StorageErrorKind::Io)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            StorageErrorKind::NoSpace => "no space left",
            StorageErrorKind::PermissionDenied => "permission denied",
            StorageErrorKind::Io => "IO error",
            StorageErrorKind::Corrupted => "data corrupted",
            StorageErrorKind::PathTooLong => "path too long",
        };
        write!(f, "{} on {:?}", kind, self.path)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {}

/// Error type returned on failed torrent allocations.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The torrent entry already exists in the disk task.
    AlreadyExists,
    Storage(StorageError),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Storage(e) => e.fmt(f),
        }
    }
}

impl From<StorageError> for NewTorrentError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Error type returned on failed block writes.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The block is not valid for the torrent's geometry.
    InvalidBlock,
    Storage(StorageError),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::Storage(e) => e.fmt(f),
        }
    }
}

impl From<StorageError> for WriteError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Error type returned on failed block reads.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block is not valid for the torrent's geometry.
    InvalidBlock,
    Storage(StorageError),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::Storage(e) => e.fmt(f),
        }
    }
}

impl From<StorageError> for ReadError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}
