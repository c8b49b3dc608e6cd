//! End-to-end download: a three piece single-file torrent is served by an
//! in-test seed speaking the raw wire protocol (independently of the
//! crate's own codec), discovered through a mock HTTP tracker, downloaded,
//! verified, and written to disk.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    time,
};

use riptide::{
    alert::Alert,
    bencode::{encode, Value},
    conf::Conf,
    engine::{self, TorrentParams, TorrentSource},
};

const PIECE_LEN: usize = 65_536;
const TOTAL_LEN: usize = 150_000;
const FILE_NAME: &str = "data.bin";

fn sha1_of(buf: &[u8]) -> Vec<u8> {
    Sha1::digest(buf).to_vec()
}

/// Builds the metainfo of a 150000 byte single zero-filled file with 64 KiB
/// pieces and the given announce URL.
fn build_torrent(announce: &str) -> Vec<u8> {
    let content = vec![0u8; TOTAL_LEN];
    let mut piece_hashes = Vec::new();
    for piece in content.chunks(PIECE_LEN) {
        piece_hashes.extend_from_slice(&sha1_of(piece));
    }

    let mut info = BTreeMap::new();
    info.insert(b"length".to_vec(), Value::Int(TOTAL_LEN as i64));
    info.insert(b"name".to_vec(), Value::from(FILE_NAME));
    info.insert(b"piece length".to_vec(), Value::Int(PIECE_LEN as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(piece_hashes));

    let mut root = BTreeMap::new();
    root.insert(b"announce".to_vec(), Value::from(announce));
    root.insert(b"info".to_vec(), Value::Dict(info));
    encode(&Value::Dict(root))
}

/// A minimal seed: handshake, bitfield of everything, unchoke on interest,
/// and zero-filled blocks for every request. Implemented straight on the
/// socket so the engine's framing is exercised against an independent
/// encoding of the protocol.
async fn run_seed(mut listener: TcpListener, info_hash: [u8; 20]) {
    let (mut socket, _) = listener.accept().await.expect("seed accept");

    // read the engine's 68 byte handshake
    let mut handshake = [0u8; 68];
    socket
        .read_exact(&mut handshake)
        .await
        .expect("seed handshake read");
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    assert_eq!(&handshake[28..48], &info_hash);

    // reply with our own (no extensions advertised)
    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(b"-SEED00-000000000000");
    socket.write_all(&reply).await.expect("seed handshake write");

    // bitfield: we have all three pieces
    socket
        .write_all(&[0, 0, 0, 2, 5, 0b1110_0000])
        .await
        .expect("seed bitfield write");

    loop {
        let mut header = [0u8; 4];
        if socket.read_exact(&mut header).await.is_err() {
            // the engine hung up; we're done
            return;
        }
        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            // keep-alive
            continue;
        }
        let mut payload = vec![0u8; len];
        socket
            .read_exact(&mut payload)
            .await
            .expect("seed frame read");

        match payload[0] {
            // interested: grant the unchoke
            2 => {
                socket
                    .write_all(&[0, 0, 0, 1, 1])
                    .await
                    .expect("seed unchoke write");
            }
            // request: serve a zero filled block
            6 => {
                let index = &payload[1..5];
                let begin = &payload[5..9];
                let block_len = u32::from_be_bytes([
                    payload[9],
                    payload[10],
                    payload[11],
                    payload[12],
                ]) as usize;

                let mut frame = Vec::with_capacity(13 + block_len);
                frame
                    .extend_from_slice(&(9 + block_len as u32).to_be_bytes());
                frame.push(7);
                frame.extend_from_slice(index);
                frame.extend_from_slice(begin);
                frame.extend(std::iter::repeat(0).take(block_len));
                socket.write_all(&frame).await.expect("seed block write");
            }
            // have, not-interested, cancel, keep-alive...: nothing to do
            _ => {}
        }
    }
}

fn test_dirs() -> (PathBuf, PathBuf) {
    let base = std::env::temp_dir()
        .join(format!("riptide-e2e-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&base);
    (base.join("downloads"), base)
}

#[tokio::test(threaded_scheduler)]
async fn test_single_peer_download() {
    // the seed listens first so the tracker can hand out its port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed_port = listener.local_addr().unwrap().port();

    let announce_url = format!("{}/announce", mockito::server_url());
    let torrent_bytes = build_torrent(&announce_url);

    // compute the info hash the same way the engine will
    let info_range =
        riptide::bencode::raw_value_range(&torrent_bytes, b"info")
            .unwrap()
            .unwrap();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&sha1_of(&torrent_bytes[info_range]));

    tokio::spawn(run_seed(listener, info_hash));

    // the mock tracker points every announce at the seed
    let mut tracker_body = b"d8:intervali1800e5:peers6:".to_vec();
    tracker_body.extend_from_slice(&[127, 0, 0, 1]);
    tracker_body.extend_from_slice(&seed_port.to_be_bytes());
    tracker_body.push(b'e');
    let _tracker = mockito::mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_body(tracker_body)
        .create();

    let (download_dir, state_dir) = test_dirs();
    let mut conf = Conf::new(&download_dir);
    conf.engine.state_dir = state_dir.clone();
    conf.engine.enable_dht = false;
    conf.engine.listen_addr = None;

    let (handle, join_handle) = engine::spawn(conf).unwrap();
    let mut alerts = handle.subscribe();

    let added_hash = handle
        .add_torrent(
            TorrentSource::TorrentBytes(torrent_bytes),
            TorrentParams::default(),
        )
        .unwrap();
    assert_eq!(added_hash, info_hash);

    // drive the alert stream until completion
    let mut verified_pieces = 0;
    let completed = time::timeout(Duration::from_secs(60), async {
        while let Some(alert) = alerts.next().await {
            match alert {
                Alert::PieceVerified { .. } => verified_pieces += 1,
                Alert::PieceFailed { .. } => {
                    panic!("no piece should fail against an honest seed")
                }
                Alert::TorrentCompleted { info_hash: hash } => {
                    assert_eq!(hash, added_hash);
                    return;
                }
                Alert::TorrentError { reason, .. } => {
                    panic!("torrent error: {}", reason)
                }
                _ => {}
            }
        }
        panic!("alert stream ended before completion");
    })
    .await;
    completed.expect("download did not complete in time");
    assert_eq!(verified_pieces, 3);

    // the payload accounting matches the content exactly (session stats
    // reach the torrent on its one-second tick, so poll briefly)
    let mut stats = handle.get_status(added_hash).await.unwrap();
    for _ in 0..20u32 {
        if stats.downloaded_payload >= TOTAL_LEN as u64 {
            break;
        }
        time::delay_for(Duration::from_millis(500)).await;
        stats = handle.get_status(added_hash).await.unwrap();
    }
    assert_eq!(stats.downloaded_payload, TOTAL_LEN as u64);
    assert_eq!(stats.pieces.verified, 3);

    // and the bytes are on disk
    let file = std::fs::read(download_dir.join(FILE_NAME)).unwrap();
    assert_eq!(file.len(), TOTAL_LEN);
    assert!(file.iter().all(|b| *b == 0));

    handle.shutdown().unwrap();
    let _ = time::timeout(Duration::from_secs(10), join_handle).await;

    // a checkpoint with all pieces was left behind for the next run
    let store = riptide::checkpoint::CheckpointStore::new(
        &state_dir,
        riptide::checkpoint::CheckpointFormat::Binary,
    );
    let checkpoint = store.load(&info_hash).unwrap().expect("checkpoint");
    assert_eq!(checkpoint.pieces.count_ones(), 3);

    let _ = std::fs::remove_dir_all(state_dir);
}
