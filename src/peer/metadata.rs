//! A short-lived session that fetches a torrent's metadata from a single
//! peer over ut_metadata (BEP 9).
//!
//! This is the magnet path: until the info dictionary is known, a torrent
//! can't allocate storage or schedule pieces, so regular sessions can't run.
//! Instead, candidates are dialed with this minimal session that only speaks
//! the extension protocol; once one of them hands over an info dictionary
//! whose SHA-1 matches the magnet's info-hash, the torrent is promoted and
//! normal sessions take over.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};

use super::{
    codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    error::{PeerError, Result},
    ext::{self, ExtHandshake, MetadataMsg, METADATA_PIECE_LEN},
};
use crate::{PeerId, Sha1Hash};

/// An info dictionary larger than this is nonsense and the peer is lying.
const MAX_METADATA_SIZE: u64 = 8 * 1024 * 1024;

/// Connects to the peer and downloads the raw `info` dictionary, verifying
/// it against the info-hash. The whole exchange runs under the given
/// deadline.
pub(crate) async fn download_metadata(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    deadline: time::Duration,
) -> Result<Vec<u8>> {
    time::timeout(deadline, fetch(addr, info_hash, client_id))
        .await
        .map_err(|_| PeerError::Timeout)?
}

async fn fetch(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
) -> Result<Vec<u8>> {
    log::debug!("fetching metadata from peer {}", addr);
    let socket = TcpStream::connect(addr).await?;
    let mut socket = Framed::new(socket, HandshakeCodec);

    let ours = Handshake::new(info_hash, client_id);
    socket.send(ours).await?;
    let theirs = socket
        .next()
        .await
        .ok_or(PeerError::NoHandshake)??;
    if theirs.info_hash != info_hash {
        return Err(PeerError::InvalidInfoHash);
    }
    if theirs.peer_id == client_id {
        return Err(PeerError::SelfConnection);
    }
    if !theirs.supports_extensions() {
        // without BEP 10 there is no ut_metadata to speak
        return Err(PeerError::InvalidMessage);
    }

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    socket
        .send(Message::Extended {
            id: ext::EXT_HANDSHAKE_ID,
            payload: ExtHandshake::ours(None, None).encode(),
        })
        .await?;

    // peer's ut_metadata id and the metadata size, known after its extended
    // handshake
    let mut metadata_exchange: Option<(u8, u64)> = None;
    let mut metadata: Vec<u8> = Vec::new();
    let mut piece_count = 0usize;
    let mut received = vec![];

    while let Some(msg) = socket.next().await {
        let msg = msg?;
        match msg {
            Message::Extended {
                id: ext::EXT_HANDSHAKE_ID,
                payload,
            } => {
                if metadata_exchange.is_some() {
                    continue;
                }
                let handshake = ExtHandshake::decode(&payload)
                    .map_err(|_| PeerError::InvalidMessage)?;
                let (id, size) = match (
                    handshake.metadata_id,
                    handshake.metadata_size,
                ) {
                    (Some(id), Some(size)) if size <= MAX_METADATA_SIZE => {
                        (id, size)
                    }
                    // the peer can't serve metadata, no point staying
                    _ => return Err(PeerError::InvalidMessage),
                };
                metadata_exchange = Some((id, size));
                metadata = vec![0; size as usize];
                piece_count = (size as usize + METADATA_PIECE_LEN - 1)
                    / METADATA_PIECE_LEN;
                received = vec![false; piece_count];
                // request all pieces up front; they are few and small
                for piece in 0..piece_count as u32 {
                    socket
                        .send(Message::Extended {
                            id,
                            payload: MetadataMsg::Request { piece }
                                .encode(),
                        })
                        .await?;
                }
            }
            Message::Extended {
                id: ext::OUR_METADATA_ID,
                payload,
            } => {
                let (_, size) = match metadata_exchange {
                    Some(exchange) => exchange,
                    None => return Err(PeerError::InvalidMessage),
                };
                match MetadataMsg::decode(&payload)
                    .map_err(|_| PeerError::InvalidMessage)?
                {
                    MetadataMsg::Data {
                        piece,
                        total_size,
                        payload,
                    } => {
                        let piece = piece as usize;
                        if total_size != size || piece >= piece_count {
                            return Err(PeerError::InvalidMessage);
                        }
                        let start = piece * METADATA_PIECE_LEN;
                        let expected_len = METADATA_PIECE_LEN
                            .min(size as usize - start);
                        if payload.len() != expected_len {
                            return Err(PeerError::InvalidMessage);
                        }
                        metadata[start..start + expected_len]
                            .copy_from_slice(&payload);
                        received[piece] = true;

                        if received.iter().all(|r| *r) {
                            let digest = Sha1::digest(&metadata);
                            if digest.as_slice() == info_hash {
                                log::info!(
                                    "downloaded metadata ({} bytes) from \
                                     peer {}",
                                    metadata.len(),
                                    addr
                                );
                                return Ok(metadata);
                            }
                            // the peer served a dictionary that doesn't
                            // match the swarm
                            return Err(PeerError::InvalidMessage);
                        }
                    }
                    MetadataMsg::Reject { .. } => {
                        return Err(PeerError::InvalidMessage);
                    }
                    MetadataMsg::Request { .. } => {
                        // this throwaway session has nothing to serve
                    }
                }
            }
            // everything else (bitfield, have, choke...) is irrelevant here
            _ => {}
        }
    }
    Err(PeerError::NoHandshake)
}
