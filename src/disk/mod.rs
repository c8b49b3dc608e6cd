//! The disk task: piece persistence, hash verification, and checkpoints.
//!
//! One task owns all torrents' disk state. Commands arrive on an unbounded
//! channel; anything that blocks (SHA-1, file syscalls, checkpoint writes)
//! runs on the blocking thread pool, and results travel back on per-torrent
//! alert channels. The disk task itself must never die from an I/O error:
//! failures are reported to the torrent that caused them.

mod error;
mod io;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::{
    sync::{mpsc, oneshot},
    task,
};

pub(crate) use error::*;

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    conf::Prealloc,
    error::*,
    peer,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex, Sha1Hash, TorrentId,
};

/// Spawns the disk task, returning its join handle and the cloneable command
/// handle.
pub(crate) fn spawn(
    checkpoint_store: CheckpointStore,
) -> (task::JoinHandle<Result<()>>, DiskHandle) {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut disk = io::Disk::new(cmd_port, checkpoint_store);
    let join_handle = task::spawn(async move { disk.start().await });
    (join_handle, DiskHandle(cmd_chan))
}

/// The handle through which the rest of the engine talks to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Creates the torrent's disk state: builds the directory structure,
    /// opens (and possibly preallocates) the files. The result arrives on
    /// the returned oneshot.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info_hash: Sha1Hash,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        prealloc: Prealloc,
        read_cache_budget: u64,
    ) -> Result<oneshot::Receiver<AllocationResult>> {
        let (reply, reply_port) = oneshot::channel();
        self.0.send(Command::NewTorrent {
            id,
            info_hash,
            storage_info,
            piece_hashes,
            prealloc,
            read_cache_budget,
            reply,
        })?;
        Ok(reply_port)
    }

    /// Queues a block for writing. Completion of the piece is reported on the
    /// torrent's disk alert port.
    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.0.send(Command::WriteBlock { id, info, data })?;
        Ok(())
    }

    /// Queues a block read for serving to a peer. The data is sent straight
    /// to the given peer session.
    pub fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        tx: peer::Sender,
    ) -> Result<()> {
        self.0.send(Command::ReadBlock { id, info, tx })?;
        Ok(())
    }

    /// Re-hashes the pieces set in `pieces` from disk, reporting the subset
    /// that verified on the torrent's alert port. Used to rebuild the
    /// verified set on resume.
    pub fn check_torrent(&self, id: TorrentId, pieces: Bitfield) -> Result<()> {
        self.0.send(Command::CheckTorrent { id, pieces })?;
        Ok(())
    }

    /// Persists a checkpoint record. The disk task serializes checkpoint
    /// writes, so a newer snapshot is never overwritten by an older one.
    pub fn save_checkpoint(
        &self,
        id: TorrentId,
        checkpoint: Checkpoint,
    ) -> Result<()> {
        self.0.send(Command::SaveCheckpoint { id, checkpoint })?;
        Ok(())
    }

    /// Drops the torrent's disk state, optionally deleting its files and its
    /// checkpoint record.
    pub fn remove_torrent(
        &self,
        id: TorrentId,
        delete_files: bool,
    ) -> Result<()> {
        self.0.send(Command::RemoveTorrent { id, delete_files })?;
        Ok(())
    }

    /// Removes checkpoint records older than the retention window.
    pub fn cleanup_checkpoints(
        &self,
        max_age: std::time::Duration,
    ) -> Result<()> {
        self.0.send(Command::CleanupCheckpoints { max_age })?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown)?;
        Ok(())
    }
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// The commands the disk task executes.
pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        info_hash: Sha1Hash,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        prealloc: Prealloc,
        read_cache_budget: u64,
        reply: oneshot::Sender<AllocationResult>,
    },
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        tx: peer::Sender,
    },
    CheckTorrent {
        id: TorrentId,
        pieces: Bitfield,
    },
    SaveCheckpoint {
        id: TorrentId,
        checkpoint: Checkpoint,
    },
    RemoveTorrent {
        id: TorrentId,
        delete_files: bool,
    },
    CleanupCheckpoints {
        max_age: std::time::Duration,
    },
    Shutdown,
}

pub(crate) type AllocationResult =
    std::result::Result<TorrentAllocation, NewTorrentError>;

/// What a torrent receives once its disk state is set up.
pub(crate) struct TorrentAllocation {
    /// The channel on which the torrent receives disk events.
    pub alert_port: TorrentAlertReceiver,
    /// Queue depth gauges shared with the torrent for its stats snapshots.
    pub stats: Arc<DiskStats>,
}

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Events the disk task reports to a torrent.
pub(crate) enum TorrentAlert {
    /// A piece arrived in full and was hashed; if valid it is also on disk.
    PieceCompletion(std::result::Result<PieceCompletion, WriteError>),
    /// Result of a `CheckTorrent` pass: the pieces that verified on disk.
    CheckCompletion(std::result::Result<Bitfield, StorageError>),
    /// A checkpoint write finished.
    CheckpointSaved(std::result::Result<(), StorageError>),
    /// A block read for serving failed.
    ReadFailed { block: BlockInfo, error: ReadError },
}

/// The outcome of hashing a complete piece.
pub(crate) struct PieceCompletion {
    pub index: PieceIndex,
    /// Whether the piece matched its expected hash. Invalid pieces are
    /// discarded, not written.
    pub is_valid: bool,
}

/// Queue depth gauges of a torrent's disk state.
#[derive(Debug, Default)]
pub(crate) struct DiskStats {
    /// Blocks staged in write buffers, waiting for their piece to complete.
    pub write_queue_depth: AtomicUsize,
    /// Pieces currently being hashed or flushed on the blocking pool.
    pub hash_queue_depth: AtomicUsize,
}

impl DiskStats {
    pub fn write_queue(&self) -> usize {
        self.write_queue_depth.load(Ordering::Relaxed)
    }

    pub fn hash_queue(&self) -> usize {
        self.hash_queue_depth.load(Ordering::Relaxed)
    }
}
