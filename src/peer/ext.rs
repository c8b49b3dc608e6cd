//! Extension protocol payloads: the extended handshake (BEP 10), metadata
//! exchange (BEP 9), and peer exchange (BEP 11).
//!
//! Extended messages are carried inside message id 20 frames with a one byte
//! sub-id. Sub-id 0 is the extended handshake, a bencoded dictionary mapping
//! extension names to the ids the sender chose for them. We advertise
//! `ut_metadata` and `ut_pex` and address a peer's extensions by the ids it
//! advertised.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use crate::bencode::{self, DecodeError, Value};

/// The sub-id of the extended handshake itself.
pub(crate) const EXT_HANDSHAKE_ID: u8 = 0;
/// The id under which we expect ut_metadata messages.
pub(crate) const OUR_METADATA_ID: u8 = 2;
/// The id under which we expect ut_pex messages.
pub(crate) const OUR_PEX_ID: u8 = 3;

/// The metadata is exchanged in pieces of 16 KiB (BEP 9).
pub(crate) const METADATA_PIECE_LEN: usize = 0x4000;

/// The decoded form of an extended handshake dictionary.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ExtHandshake {
    /// The id the peer chose for ut_metadata, if it supports it.
    pub metadata_id: Option<u8>,
    /// The id the peer chose for ut_pex, if it supports it.
    pub pex_id: Option<u8>,
    /// The peer's listen port (`p`).
    pub listen_port: Option<u16>,
    /// The peer's client name and version (`v`).
    pub client: Option<String>,
    /// The size of the info dictionary in bytes (`metadata_size`), needed to
    /// fetch metadata from a magnet.
    pub metadata_size: Option<u64>,
    /// How many outstanding requests the peer is willing to queue (`reqq`).
    pub request_queue_len: Option<u64>,
}

impl ExtHandshake {
    /// Builds the handshake we send.
    pub fn ours(
        listen_port: Option<u16>,
        metadata_size: Option<u64>,
    ) -> Self {
        Self {
            metadata_id: Some(OUR_METADATA_ID),
            pex_id: Some(OUR_PEX_ID),
            listen_port,
            client: Some(format!(
                "riptide {}",
                env!("CARGO_PKG_VERSION")
            )),
            metadata_size,
            request_queue_len: Some(250),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = BTreeMap::new();
        if let Some(id) = self.metadata_id {
            m.insert(b"ut_metadata".to_vec(), Value::Int(id as i64));
        }
        if let Some(id) = self.pex_id {
            m.insert(b"ut_pex".to_vec(), Value::Int(id as i64));
        }

        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(port) = self.listen_port {
            dict.insert(b"p".to_vec(), Value::Int(port as i64));
        }
        if let Some(client) = &self.client {
            dict.insert(b"v".to_vec(), Value::from(client.as_str()));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size as i64));
        }
        if let Some(reqq) = self.request_queue_len {
            dict.insert(b"reqq".to_vec(), Value::Int(reqq as i64));
        }
        bencode::encode(&Value::Dict(dict))
    }

    /// Decodes a peer's extended handshake. Unknown keys are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let value = bencode::decode(buf)?;
        let ext_id = |name: &[u8]| {
            value
                .dict_get(b"m")
                .and_then(|m| m.dict_get(name))
                .and_then(Value::as_int)
                // id 0 means the peer disabled the extension
                .filter(|id| *id > 0 && *id <= u8::MAX as i64)
                .map(|id| id as u8)
        };
        Ok(Self {
            metadata_id: ext_id(b"ut_metadata"),
            pex_id: ext_id(b"ut_pex"),
            listen_port: value
                .dict_get(b"p")
                .and_then(Value::as_int)
                .filter(|p| *p > 0 && *p <= u16::MAX as i64)
                .map(|p| p as u16),
            client: value
                .dict_get(b"v")
                .and_then(Value::as_str)
                .map(str::to_string),
            metadata_size: value
                .dict_get(b"metadata_size")
                .and_then(Value::as_int)
                .filter(|size| *size > 0)
                .map(|size| size as u64),
            request_queue_len: value
                .dict_get(b"reqq")
                .and_then(Value::as_int)
                .filter(|reqq| *reqq > 0)
                .map(|reqq| reqq as u64),
        })
    }
}

/// A ut_metadata message (BEP 9).
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MetadataMsg {
    /// Ask for the 16 KiB metadata piece at the given index.
    Request { piece: u32 },
    /// A metadata piece; the raw bytes follow the bencoded header.
    Data {
        piece: u32,
        total_size: u64,
        payload: Vec<u8>,
    },
    /// The peer doesn't have (or won't serve) the piece.
    Reject { piece: u32 },
}

impl MetadataMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        let (msg_type, piece) = match self {
            Self::Request { piece } => (0, *piece),
            Self::Data { piece, .. } => (1, *piece),
            Self::Reject { piece } => (2, *piece),
        };
        dict.insert(b"msg_type".to_vec(), Value::Int(msg_type));
        dict.insert(b"piece".to_vec(), Value::Int(piece as i64));
        if let Self::Data { total_size, .. } = self {
            dict.insert(
                b"total_size".to_vec(),
                Value::Int(*total_size as i64),
            );
        }
        let mut buf = bencode::encode(&Value::Dict(dict));
        if let Self::Data { payload, .. } = self {
            buf.extend_from_slice(payload);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (header, consumed) = bencode::decode_prefix(buf)?;
        let invalid = || DecodeError {
            pos: 0,
            kind: bencode::ErrorKind::InvalidToken,
        };
        let msg_type = header
            .dict_get(b"msg_type")
            .and_then(Value::as_int)
            .ok_or_else(invalid)?;
        let piece = header
            .dict_get(b"piece")
            .and_then(Value::as_int)
            .filter(|piece| *piece >= 0 && *piece <= u32::MAX as i64)
            .ok_or_else(invalid)? as u32;
        match msg_type {
            0 => Ok(Self::Request { piece }),
            1 => Ok(Self::Data {
                piece,
                total_size: header
                    .dict_get(b"total_size")
                    .and_then(Value::as_int)
                    .filter(|size| *size >= 0)
                    .ok_or_else(invalid)? as u64,
                payload: buf[consumed..].to_vec(),
            }),
            2 => Ok(Self::Reject { piece }),
            _ => Err(invalid()),
        }
    }
}

/// A ut_pex message (BEP 11): peers that joined and left the sender's swarm
/// view since the last exchange, as compact endpoints.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PexMsg {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"added".to_vec(),
            Value::Bytes(encode_compact_v4(&self.added)),
        );
        let added6 = encode_compact_v6(&self.added);
        if !added6.is_empty() {
            dict.insert(b"added6".to_vec(), Value::Bytes(added6));
        }
        dict.insert(
            b"dropped".to_vec(),
            Value::Bytes(encode_compact_v4(&self.dropped)),
        );
        let dropped6 = encode_compact_v6(&self.dropped);
        if !dropped6.is_empty() {
            dict.insert(b"dropped6".to_vec(), Value::Bytes(dropped6));
        }
        bencode::encode(&Value::Dict(dict))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let value = bencode::decode(buf)?;
        let compact = |key: &[u8]| {
            value
                .dict_get(key)
                .and_then(Value::as_bytes)
                .unwrap_or(&[])
        };
        let mut added = parse_compact_v4(compact(b"added"));
        added.extend(parse_compact_v6(compact(b"added6")));
        let mut dropped = parse_compact_v4(compact(b"dropped"));
        dropped.extend(parse_compact_v6(compact(b"dropped6")));
        Ok(Self { added, dropped })
    }
}

fn encode_compact_v4(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::new();
    for addr in addrs {
        if let SocketAddr::V4(addr) = addr {
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

fn encode_compact_v6(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::new();
    for addr in addrs {
        if let SocketAddr::V6(addr) = addr {
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

/// Parses 6 byte IPv4 address-port entries.
pub(crate) fn parse_compact_v4(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Parses 18 byte IPv6 address-port entries.
pub(crate) fn parse_compact_v6(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(18)
        .map(|entry| {
            let mut octets = [0; 16];
            octets.copy_from_slice(&entry[..16]);
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_ext_handshake_round_trip() {
        let ours = ExtHandshake::ours(Some(6881), Some(12345));
        let decoded = ExtHandshake::decode(&ours.encode()).unwrap();
        assert_eq!(decoded, ours);
    }

    #[test]
    fn test_ext_handshake_decodes_foreign_dict() {
        // a dict another client might send: extra keys, no pex
        let buf = b"d1:md11:ut_metadatai3ee13:metadata_sizei31235e1:pi51413e\
                    4:reqqi250e7:unknowni1e1:v13:exotic cliente";
        let handshake = ExtHandshake::decode(&buf[..]).unwrap();
        assert_eq!(handshake.metadata_id, Some(3));
        assert_eq!(handshake.pex_id, None);
        assert_eq!(handshake.listen_port, Some(51413));
        assert_eq!(handshake.metadata_size, Some(31235));
        assert_eq!(handshake.client.as_deref(), Some("exotic client"));
    }

    #[test]
    fn test_metadata_msg_round_trips() {
        for msg in vec![
            MetadataMsg::Request { piece: 0 },
            MetadataMsg::Reject { piece: 3 },
            MetadataMsg::Data {
                piece: 1,
                total_size: 40_000,
                payload: vec![0xab; METADATA_PIECE_LEN],
            },
        ] {
            assert_eq!(MetadataMsg::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_metadata_data_payload_follows_header() {
        let msg = MetadataMsg::Data {
            piece: 0,
            total_size: 3,
            payload: b"abc".to_vec(),
        };
        let buf = msg.encode();
        assert!(buf.ends_with(b"abc"));
        // the header alone is a valid bencoded dict
        assert!(bencode::decode_prefix(&buf).is_ok());
    }

    #[test]
    fn test_pex_round_trip() {
        let msg = PexMsg {
            added: vec![
                "10.0.0.1:6881".parse().unwrap(),
                "[2001:db8::1]:51413".parse().unwrap(),
            ],
            dropped: vec!["10.0.0.2:6882".parse().unwrap()],
        };
        assert_eq!(PexMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_compact_v4_parse() {
        let addrs =
            parse_compact_v4(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]);
        assert_eq!(
            addrs,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ]
        );
        // a trailing partial entry is ignored
        assert!(parse_compact_v4(&[1, 2, 3]).is_empty());
    }
}
