use std::{fmt, io};

/// The error type of a peer session. A peer error tears down that one
/// connection; it never propagates past the torrent that owns the session.
#[derive(Debug)]
pub(crate) enum PeerError {
    /// The connection or an exchange on it timed out.
    Timeout,
    /// The peer closed the connection before or during the handshake.
    NoHandshake,
    /// The handshake advertised an info hash we are not serving.
    InvalidInfoHash,
    /// The peer id in the handshake is our own: we connected to ourselves.
    SelfConnection,
    /// A bitfield arrived after the availability exchange.
    UnexpectedBitfield,
    /// The message was well framed but semantically invalid (bad index, bad
    /// block geometry, request while choked without the fast extension).
    InvalidMessage,
    /// The peer session's channel to the rest of the engine died.
    Channel,
    /// The session was told to shut down.
    Shutdown,
    Io(io::Error),
}

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::NoHandshake => write!(f, "no handshake"),
            Self::InvalidInfoHash => write!(f, "invalid info hash"),
            Self::SelfConnection => write!(f, "connected to self"),
            Self::UnexpectedBitfield => {
                write!(f, "bitfield not after handshake")
            }
            Self::InvalidMessage => write!(f, "invalid message"),
            Self::Channel => write!(f, "channel error"),
            Self::Shutdown => write!(f, "session shut down"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PeerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}
