mod file;
mod piece;
mod torrent;

use std::collections::HashMap;

use tokio::task;

use super::{
    AllocationResult, Command, CommandReceiver, NewTorrentError,
    StorageError, StorageErrorKind, TorrentAlert, TorrentAllocation,
};
use crate::{
    checkpoint::{CheckpointError, CheckpointStore},
    error::*,
    TorrentId,
};

/// The entity responsible for saving downloaded file blocks to disk,
/// verifying whether downloaded pieces are valid, and persisting checkpoints.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap,
    /// which includes various metadata about torrent and the torrent specific
    /// alert channel. Commands are processed sequentially; the blocking parts
    /// of each operation take `Arc` clones of what they need, so no entry is
    /// ever borrowed across an await.
    torrents: HashMap<TorrentId, torrent::Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    checkpoint_store: CheckpointStore,
}

impl Disk {
    pub(super) fn new(
        cmd_port: CommandReceiver,
        checkpoint_store: CheckpointStore,
    ) -> Self {
        Self {
            torrents: HashMap::new(),
            cmd_port,
            checkpoint_store,
        }
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    info_hash,
                    storage_info,
                    piece_hashes,
                    prealloc,
                    read_cache_budget,
                    reply,
                } => {
                    let result = if self.torrents.contains_key(&id) {
                        log::warn!("torrent {} already allocated", id);
                        Err(NewTorrentError::AlreadyExists)
                    } else {
                        self.allocate_torrent(
                            id,
                            info_hash,
                            storage_info,
                            piece_hashes,
                            prealloc,
                            read_cache_budget,
                        )
                        .await
                    };
                    // the torrent may have been dropped in the meantime; not
                    // an error for the disk task
                    let _ = reply.send(result);
                }
                Command::WriteBlock { id, info, data } => {
                    // a torrent whose alert channel died must not take the
                    // shared disk task (and every sibling torrent) with it
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        if let Err(e) = torrent.write_block(info, data).await
                        {
                            log::warn!(
                                "failed to report write to torrent {}: {}",
                                id,
                                e
                            );
                        }
                    } else {
                        // writes may race a torrent's removal
                        log::warn!("write for unknown torrent {}", id);
                    }
                }
                Command::ReadBlock { id, info, tx } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        if let Err(e) = torrent.read_block(info, tx).await {
                            log::warn!(
                                "failed to report read to torrent {}: {}",
                                id,
                                e
                            );
                        }
                    } else {
                        log::warn!("read for unknown torrent {}", id);
                    }
                }
                Command::CheckTorrent { id, pieces } => {
                    if let Some(torrent) = self.torrents.get(&id) {
                        if let Err(e) = torrent.check_pieces(pieces).await {
                            log::warn!(
                                "failed to start check of torrent {}: {}",
                                id,
                                e
                            );
                        }
                    }
                }
                Command::SaveCheckpoint { id, checkpoint } => {
                    let store = self.checkpoint_store.clone();
                    let result = task::spawn_blocking(move || {
                        store.save(&checkpoint)
                    })
                    .await
                    .expect("disk IO checkpoint task panicked")
                    .map_err(checkpoint_storage_error);
                    if let Some(torrent) = self.torrents.get(&id) {
                        if let Err(e) = torrent
                            .send_alert(TorrentAlert::CheckpointSaved(result))
                        {
                            log::warn!(
                                "failed to report checkpoint to torrent {}: \
                                 {}",
                                id,
                                e
                            );
                        }
                    }
                }
                Command::RemoveTorrent { id, delete_files } => {
                    if let Some(torrent) = self.torrents.remove(&id) {
                        let store = self.checkpoint_store.clone();
                        task::spawn_blocking(move || {
                            if let Err(e) = store.remove(&torrent.info_hash())
                            {
                                log::warn!(
                                    "failed to remove checkpoint of torrent \
                                     {}: {}",
                                    id,
                                    e
                                );
                            }
                            if delete_files {
                                torrent.delete_files();
                            }
                        })
                        .await
                        .expect("disk IO removal task panicked");
                    }
                }
                Command::CleanupCheckpoints { max_age } => {
                    let store = self.checkpoint_store.clone();
                    task::spawn_blocking(move || match store.cleanup(max_age) {
                        Ok(0) => {}
                        Ok(removed) => log::info!(
                            "checkpoint cleanup removed {} records",
                            removed
                        ),
                        Err(e) => {
                            log::warn!("checkpoint cleanup failed: {}", e)
                        }
                    })
                    .await
                    .expect("disk IO cleanup task panicked");
                }
                Command::Shutdown => {
                    log::info!("shutting down disk IO event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn allocate_torrent(
        &mut self,
        id: TorrentId,
        info_hash: crate::Sha1Hash,
        storage_info: crate::storage_info::StorageInfo,
        piece_hashes: Vec<u8>,
        prealloc: crate::conf::Prealloc,
        read_cache_budget: u64,
    ) -> AllocationResult {
        // opening and preallocating files is blocking work
        let result = task::spawn_blocking(move || {
            torrent::Torrent::new(
                info_hash,
                storage_info,
                piece_hashes,
                prealloc,
                read_cache_budget,
            )
        })
        .await
        .expect("disk IO allocation task panicked");

        match result {
            Ok((torrent, alert_port, stats)) => {
                log::info!("torrent {} successfully allocated", id);
                self.torrents.insert(id, torrent);
                Ok(TorrentAllocation { alert_port, stats })
            }
            Err(e) => {
                log::warn!("torrent {} allocation failure: {}", id, e);
                Err(e)
            }
        }
    }
}

/// Maps a checkpoint persistence failure to the storage error taxonomy.
fn checkpoint_storage_error(e: CheckpointError) -> StorageError {
    match e {
        CheckpointError::Io(e) => StorageError::from_io("checkpoint", e),
        _ => StorageError::new("checkpoint", StorageErrorKind::Corrupted),
    }
}
