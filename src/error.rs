//! Crate level errors and the error taxonomy of the engine.
//!
//! Parse failures (bencode, torrent, magnet) are fatal for the affected input
//! only. Per-peer protocol errors live in [`crate::peer`] and never leave the
//! torrent that owns the session. Storage failures are defined in
//! [`crate::disk`] and reach the public API as alerts, not unwinding errors.

use std::fmt;

use crate::bencode::DecodeError;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the engine's public operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A bencoded input could not be decoded.
    Bencode(DecodeError),
    /// The torrent metainfo is structurally invalid.
    InvalidTorrent {
        reason: String,
    },
    /// The magnet URI is invalid.
    InvalidMagnet {
        reason: String,
    },
    /// The options given when adding a torrent don't form a usable
    /// configuration. Surfaced synchronously by [`crate::engine`]; the torrent
    /// is not added.
    InvalidConfig {
        reason: String,
    },
    /// An invalid piece index was used.
    InvalidPieceIndex,
    /// A command referred to a torrent the engine doesn't know about.
    TorrentNotFound,
    /// The channel on which some component was listening or sending died.
    Channel,
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::InvalidTorrent { reason } => {
                write!(f, "invalid torrent: {}", reason)
            }
            Self::InvalidMagnet { reason } => {
                write!(f, "invalid magnet: {}", reason)
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {}", reason)
            }
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::TorrentNotFound => write!(f, "torrent not found"),
            Self::Channel => write!(f, "channel error"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Channel
    }
}
