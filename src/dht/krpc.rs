//! KRPC, the bencoded RPC format of the mainline DHT (BEP 5).
//!
//! Every datagram is a dictionary with a transaction id `t` and a type `y`:
//! `q` for queries (name in `q`, arguments in `a`), `r` for responses
//! (return values in `r`), `e` for errors (`[code, message]` in `e`).

use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use super::routing::NodeId;
use crate::{
    bencode::{self, DecodeError, ErrorKind, Value},
    peer::ext::parse_compact_v4,
    Sha1Hash,
};

/// KRPC error code: protocol error, e.g. an invalid token.
pub(crate) const ERROR_PROTOCOL: i64 = 203;
/// KRPC error code: method unknown.
pub(crate) const ERROR_METHOD_UNKNOWN: i64 = 204;

/// A node endpoint in the compact 26 byte format (id, IPv4, port).
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

/// The queries of the mainline DHT.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum QueryKind {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: Sha1Hash,
    },
    AnnouncePeer {
        info_hash: Sha1Hash,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

impl QueryKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::FindNode { .. } => "find_node",
            Self::GetPeers { .. } => "get_peers",
            Self::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// The return values of a response; which fields are filled depends on the
/// query that was answered.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Response {
    pub id: NodeId,
    /// Closer nodes, from find_node and get_peers.
    pub nodes: Vec<CompactNode>,
    /// Peer endpoints for the requested info-hash, from get_peers.
    pub values: Vec<SocketAddr>,
    /// The write token authorizing a future announce_peer.
    pub token: Option<Vec<u8>>,
}

/// A decoded KRPC datagram.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    Query {
        t: Vec<u8>,
        id: NodeId,
        /// `None` means the method is unknown and deserves error 204.
        kind: Option<QueryKind>,
    },
    Response {
        t: Vec<u8>,
        response: Response,
    },
    Error {
        t: Vec<u8>,
        code: i64,
        message: String,
    },
}

/// Encodes a query datagram.
pub(crate) fn encode_query(t: &[u8], id: NodeId, kind: &QueryKind) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(b"id".to_vec(), Value::Bytes(id.0.to_vec()));
    match kind {
        QueryKind::Ping => {}
        QueryKind::FindNode { target } => {
            args.insert(b"target".to_vec(), Value::Bytes(target.0.to_vec()));
        }
        QueryKind::GetPeers { info_hash } => {
            args.insert(
                b"info_hash".to_vec(),
                Value::Bytes(info_hash.to_vec()),
            );
        }
        QueryKind::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        } => {
            args.insert(
                b"info_hash".to_vec(),
                Value::Bytes(info_hash.to_vec()),
            );
            args.insert(b"port".to_vec(), Value::Int(*port as i64));
            args.insert(b"token".to_vec(), Value::Bytes(token.clone()));
            args.insert(
                b"implied_port".to_vec(),
                Value::Int(*implied_port as i64),
            );
        }
    }

    let mut dict = BTreeMap::new();
    dict.insert(b"a".to_vec(), Value::Dict(args));
    dict.insert(b"q".to_vec(), Value::from(kind.name()));
    dict.insert(b"t".to_vec(), Value::Bytes(t.to_vec()));
    dict.insert(b"y".to_vec(), Value::from("q"));
    bencode::encode(&Value::Dict(dict))
}

/// Encodes a response datagram.
pub(crate) fn encode_response(t: &[u8], response: &Response) -> Vec<u8> {
    let mut ret = BTreeMap::new();
    ret.insert(b"id".to_vec(), Value::Bytes(response.id.0.to_vec()));
    if !response.nodes.is_empty() {
        let mut nodes = Vec::with_capacity(response.nodes.len() * 26);
        for node in &response.nodes {
            nodes.extend_from_slice(&node.id.0);
            nodes.extend_from_slice(&node.addr.ip().octets());
            nodes.extend_from_slice(&node.addr.port().to_be_bytes());
        }
        ret.insert(b"nodes".to_vec(), Value::Bytes(nodes));
    }
    if !response.values.is_empty() {
        let values = response
            .values
            .iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(addr) => {
                    let mut entry = Vec::with_capacity(6);
                    entry.extend_from_slice(&addr.ip().octets());
                    entry.extend_from_slice(&addr.port().to_be_bytes());
                    Some(Value::Bytes(entry))
                }
                SocketAddr::V6(_) => None,
            })
            .collect();
        ret.insert(b"values".to_vec(), Value::List(values));
    }
    if let Some(token) = &response.token {
        ret.insert(b"token".to_vec(), Value::Bytes(token.clone()));
    }

    let mut dict = BTreeMap::new();
    dict.insert(b"r".to_vec(), Value::Dict(ret));
    dict.insert(b"t".to_vec(), Value::Bytes(t.to_vec()));
    dict.insert(b"y".to_vec(), Value::from("r"));
    bencode::encode(&Value::Dict(dict))
}

/// Encodes an error datagram.
pub(crate) fn encode_error(t: &[u8], code: i64, message: &str) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(
        b"e".to_vec(),
        Value::List(vec![Value::Int(code), Value::from(message)]),
    );
    dict.insert(b"t".to_vec(), Value::Bytes(t.to_vec()));
    dict.insert(b"y".to_vec(), Value::from("e"));
    bencode::encode(&Value::Dict(dict))
}

fn malformed() -> DecodeError {
    DecodeError {
        pos: 0,
        kind: ErrorKind::InvalidToken,
    }
}

fn node_id(value: Option<&Value>) -> Result<NodeId, DecodeError> {
    let bytes = value
        .and_then(Value::as_bytes)
        .filter(|bytes| bytes.len() == 20)
        .ok_or_else(malformed)?;
    let mut id = [0; 20];
    id.copy_from_slice(bytes);
    Ok(NodeId(id))
}

/// Decodes a KRPC datagram.
pub(crate) fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    let value = bencode::decode(buf)?;
    let t = value
        .dict_get(b"t")
        .and_then(Value::as_bytes)
        .ok_or_else(malformed)?
        .to_vec();
    let y = value
        .dict_get(b"y")
        .and_then(Value::as_bytes)
        .ok_or_else(malformed)?;

    match y {
        b"q" => {
            let name = value
                .dict_get(b"q")
                .and_then(Value::as_bytes)
                .ok_or_else(malformed)?;
            let args = value.dict_get(b"a").ok_or_else(malformed)?;
            let id = node_id(args.dict_get(b"id"))?;
            let kind = match name {
                b"ping" => Some(QueryKind::Ping),
                b"find_node" => Some(QueryKind::FindNode {
                    target: node_id(args.dict_get(b"target"))?,
                }),
                b"get_peers" => Some(QueryKind::GetPeers {
                    info_hash: node_id(args.dict_get(b"info_hash"))?.0,
                }),
                b"announce_peer" => Some(QueryKind::AnnouncePeer {
                    info_hash: node_id(args.dict_get(b"info_hash"))?.0,
                    port: args
                        .dict_get(b"port")
                        .and_then(Value::as_int)
                        .filter(|port| *port >= 0 && *port <= u16::MAX as i64)
                        .unwrap_or(0) as u16,
                    token: args
                        .dict_get(b"token")
                        .and_then(Value::as_bytes)
                        .ok_or_else(malformed)?
                        .to_vec(),
                    implied_port: args
                        .dict_get(b"implied_port")
                        .and_then(Value::as_int)
                        == Some(1),
                }),
                _ => None,
            };
            Ok(Message::Query { t, id, kind })
        }
        b"r" => {
            let ret = value.dict_get(b"r").ok_or_else(malformed)?;
            let id = node_id(ret.dict_get(b"id"))?;
            let nodes = ret
                .dict_get(b"nodes")
                .and_then(Value::as_bytes)
                .map(parse_compact_nodes)
                .unwrap_or_default();
            let values = ret
                .dict_get(b"values")
                .and_then(Value::as_list)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_bytes)
                        .flat_map(parse_compact_v4)
                        .collect()
                })
                .unwrap_or_default();
            let token = ret
                .dict_get(b"token")
                .and_then(Value::as_bytes)
                .map(<[u8]>::to_vec);
            Ok(Message::Response {
                t,
                response: Response {
                    id,
                    nodes,
                    values,
                    token,
                },
            })
        }
        b"e" => {
            let error = value
                .dict_get(b"e")
                .and_then(Value::as_list)
                .ok_or_else(malformed)?;
            let code = error
                .get(0)
                .and_then(Value::as_int)
                .ok_or_else(malformed)?;
            let message = error
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            Ok(Message::Error { t, code, message })
        }
        _ => Err(malformed()),
    }
}

/// Parses the packed 26 byte node entries of `nodes` fields.
pub(crate) fn parse_compact_nodes(buf: &[u8]) -> Vec<CompactNode> {
    buf.chunks_exact(26)
        .map(|entry| {
            let mut id = [0; 20];
            id.copy_from_slice(&entry[..20]);
            let ip =
                Ipv4Addr::new(entry[20], entry[21], entry[22], entry[23]);
            let port = u16::from_be_bytes([entry[24], entry[25]]);
            CompactNode {
                id: NodeId(id),
                addr: SocketAddrV4::new(ip, port),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_ping_query_wire_format() {
        let buf = encode_query(b"aa", NodeId([0x61; 20]), &QueryKind::Ping);
        // the canonical ping example of BEP 5, with id "aaaa..."
        assert_eq!(
            buf,
            b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:aa1:y1:qe"
                .to_vec()
        );
    }

    #[test]
    fn test_query_round_trips() {
        let id = NodeId([0x11; 20]);
        for kind in vec![
            QueryKind::Ping,
            QueryKind::FindNode {
                target: NodeId([0x22; 20]),
            },
            QueryKind::GetPeers {
                info_hash: [0x33; 20],
            },
            QueryKind::AnnouncePeer {
                info_hash: [0x33; 20],
                port: 6881,
                token: b"write-token".to_vec(),
                implied_port: false,
            },
        ] {
            let buf = encode_query(b"tx", id, &kind);
            match decode(&buf).unwrap() {
                Message::Query {
                    t,
                    id: decoded_id,
                    kind: decoded_kind,
                } => {
                    assert_eq!(t, b"tx".to_vec());
                    assert_eq!(decoded_id, id);
                    assert_eq!(decoded_kind, Some(kind));
                }
                other => panic!("decoded {:?}", other),
            }
        }
    }

    #[test]
    fn test_response_round_trip() {
        let response = Response {
            id: NodeId([0x42; 20]),
            nodes: vec![CompactNode {
                id: NodeId([0x43; 20]),
                addr: "10.1.2.3:6881".parse().unwrap(),
            }],
            values: vec!["192.168.1.2:51413".parse().unwrap()],
            token: Some(b"tok".to_vec()),
        };
        let buf = encode_response(b"tx", &response);
        match decode(&buf).unwrap() {
            Message::Response {
                t,
                response: decoded,
            } => {
                assert_eq!(t, b"tx".to_vec());
                assert_eq!(decoded, response);
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_error_round_trip() {
        let buf = encode_error(b"tx", ERROR_METHOD_UNKNOWN, "Method Unknown");
        assert_eq!(
            decode(&buf).unwrap(),
            Message::Error {
                t: b"tx".to_vec(),
                code: ERROR_METHOD_UNKNOWN,
                message: "Method Unknown".into(),
            }
        );
    }

    #[test]
    fn test_unknown_query_method() {
        let buf = encode_query(b"tx", NodeId([0x11; 20]), &QueryKind::Ping)
            // turn "ping" into an unknown method of the same length
            .iter()
            .map(|b| if *b == b'g' { b'x' } else { *b })
            .collect::<Vec<u8>>();
        match decode(&buf).unwrap() {
            Message::Query { kind, .. } => assert_eq!(kind, None),
            other => panic!("decoded {:?}", other),
        }
    }
}
