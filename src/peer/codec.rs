//! The framing layer of the peer wire protocol (BEP 3), including the fast
//! extension messages (BEP 6) and the extension protocol envelope (BEP 10).
//!
//! After the 68 byte handshake, every message is a 4 byte big endian length
//! prefix, a one byte message id, and a fixed layout payload. Length 0 is a
//! keep-alive.

use std::{
    convert::{TryFrom, TryInto},
    io,
};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// No legitimate frame is larger than this: the largest regular messages are
/// a piece (9 bytes header plus a block) and bitfields or metadata exchange
/// messages, which stay well under a mebibyte. Anything larger is a protocol
/// violation and drops the connection before the payload is buffered.
const MAX_FRAME_LEN: u32 = 1 << 20;

/// Reserved bit flags (the handshake's 8 reserved bytes).
const DHT_FLAG: u8 = 0x01; // byte 7
const FAST_FLAG: u8 = 0x04; // byte 7
const EXTENSIONS_FLAG: u8 = 0x10; // byte 5

/// The handshake exchanged at the start of a connection, both directions.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Feature flag bits.
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates the handshake we send: protocol v1 with the DHT, fast
    /// extension, and extension protocol bits set.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[7] |= DHT_FLAG | FAST_FLAG;
        reserved[5] |= EXTENSIONS_FLAG;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_FLAG != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_FLAG != 0
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSIONS_FLAG != 0
    }

    /// The length of the handshake on the wire.
    pub fn len(&self) -> u64 {
        1 + 19 + 8 + 20 + 20
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(68);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // `get_*` consumes, so peek at the length prefix via indexing
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake protocol string length must be 19",
            ));
        }
        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf.split_to(19));
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf.split_to(8));
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf.split_to(20));
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf.split_to(20));

        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid handshake protocol string",
            ));
        }

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, which is included as a prefix in most messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    // BEP 6, the fast extension
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // BEP 10, the extension protocol
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> io::Result<Self> {
        use MessageId::*;
        match id {
            id if id == Choke as u8 => Ok(Choke),
            id if id == Unchoke as u8 => Ok(Unchoke),
            id if id == Interested as u8 => Ok(Interested),
            id if id == NotInterested as u8 => Ok(NotInterested),
            id if id == Have as u8 => Ok(Have),
            id if id == Bitfield as u8 => Ok(Bitfield),
            id if id == Request as u8 => Ok(Request),
            id if id == Block as u8 => Ok(Block),
            id if id == Cancel as u8 => Ok(Cancel),
            id if id == Port as u8 => Ok(Port),
            id if id == Suggest as u8 => Ok(Suggest),
            id if id == HaveAll as u8 => Ok(HaveAll),
            id if id == HaveNone as u8 => Ok(HaveNone),
            id if id == Reject as u8 => Ok(Reject),
            id if id == AllowedFast as u8 => Ok(AllowedFast),
            id if id == Extended as u8 => Ok(Extended),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown message id",
            )),
        }
    }
}

/// A message in the peer wire protocol, after the handshake.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// BEP 5: the UDP port of the peer's DHT node.
    Port(u16),
    /// BEP 6: the peer suggests downloading this piece.
    Suggest {
        piece_index: PieceIndex,
    },
    /// BEP 6: equivalent to a bitfield of all ones.
    HaveAll,
    /// BEP 6: equivalent to a bitfield of all zeros.
    HaveNone,
    /// BEP 6: the peer will not serve this request.
    Reject(BlockInfo),
    /// BEP 6: this piece may be requested even while choked.
    AllowedFast {
        piece_index: PieceIndex,
    },
    /// BEP 10: an extension protocol message; id 0 is the extended
    /// handshake.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the ID of the message, if it has one (e.g. keep alive doesn't).
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
            Self::Suggest { .. } => Some(MessageId::Suggest),
            Self::HaveAll => Some(MessageId::HaveAll),
            Self::HaveNone => Some(MessageId::HaveNone),
            Self::Reject(_) => Some(MessageId::Reject),
            Self::AllowedFast { .. } => Some(MessageId::AllowedFast),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// The number of bytes the protocol chatter of this message takes on the
    /// wire (headers; block payloads are counted separately).
    pub fn protocol_len(&self) -> u64 {
        match self {
            Self::KeepAlive => 4,
            Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested
            | Self::HaveAll
            | Self::HaveNone => 4 + 1,
            Self::Have { .. }
            | Self::Suggest { .. }
            | Self::AllowedFast { .. } => 4 + 1 + 4,
            Self::Bitfield(bitfield) => 4 + 1 + bitfield.as_slice().len() as u64,
            Self::Request(_) | Self::Cancel(_) | Self::Reject(_) => {
                4 + 1 + 3 * 4
            }
            Self::Block { .. } => 4 + 1 + 2 * 4,
            Self::Port(_) => 4 + 1 + 2,
            Self::Extended { payload, .. } => 4 + 1 + 1 + payload.len() as u64,
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => buf.put_u32(0),
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(try_piece_index(piece_index)?);
            }
            Bitfield(bitfield) => {
                let field = bitfield.into_vec();
                buf.put_u32(1 + field.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&field);
            }
            Request(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                put_block_info(buf, &block)?;
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(try_piece_index(piece_index)?);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                put_block_info(buf, &block)?;
            }
            Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Suggest { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Suggest as u8);
                buf.put_u32(try_piece_index(piece_index)?);
            }
            HaveAll => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveAll as u8);
            }
            HaveNone => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveNone as u8);
            }
            Reject(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Reject as u8);
                put_block_info(buf, &block)?;
            }
            AllowedFast { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::AllowedFast as u8);
                buf.put_u32(try_piece_index(piece_index)?);
            }
            Extended { id, payload } => {
                buf.put_u32(1 + 1 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.remaining() < 4 {
            return Ok(None);
        }
        // peek at the length prefix without consuming it, as the full frame
        // may not have arrived yet
        let msg_len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if msg_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized frame",
            ));
        }
        if buf.remaining() < 4 + msg_len as usize {
            // reserve so that the socket read can complete the frame in one
            // go
            buf.reserve(4 + msg_len as usize - buf.remaining());
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let id = MessageId::try_from(buf.get_u8())?;
        let payload_len = msg_len as usize - 1;

        let expect_payload = |expected: usize| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid message length",
                ))
            }
        };

        let msg = match id {
            MessageId::Choke => {
                expect_payload(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_payload(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_payload(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_payload(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_payload(4)?;
                Message::Have {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                let field = buf.split_to(payload_len).to_vec();
                Message::Bitfield(Bitfield::from_vec(field))
            }
            MessageId::Request => {
                expect_payload(12)?;
                Message::Request(get_block_info(buf)?)
            }
            MessageId::Block => {
                if payload_len < 8 || payload_len > 8 + BLOCK_LEN as usize {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid block message length",
                    ));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let data = buf.split_to(payload_len - 8).to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => {
                expect_payload(12)?;
                Message::Cancel(get_block_info(buf)?)
            }
            MessageId::Port => {
                expect_payload(2)?;
                Message::Port(buf.get_u16())
            }
            MessageId::Suggest => {
                expect_payload(4)?;
                Message::Suggest {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::HaveAll => {
                expect_payload(0)?;
                Message::HaveAll
            }
            MessageId::HaveNone => {
                expect_payload(0)?;
                Message::HaveNone
            }
            MessageId::Reject => {
                expect_payload(12)?;
                Message::Reject(get_block_info(buf)?)
            }
            MessageId::AllowedFast => {
                expect_payload(4)?;
                Message::AllowedFast {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Extended => {
                if payload_len < 1 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "empty extended message",
                    ));
                }
                let id = buf.get_u8();
                let payload = buf.split_to(payload_len - 1).to_vec();
                Message::Extended { id, payload }
            }
        };
        Ok(Some(msg))
    }
}

fn try_piece_index(piece_index: PieceIndex) -> io::Result<u32> {
    piece_index.try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "piece index overflow")
    })
}

fn put_block_info(buf: &mut BytesMut, block: &BlockInfo) -> io::Result<()> {
    buf.put_u32(try_piece_index(block.piece_index)?);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
    Ok(())
}

fn get_block_info(buf: &mut BytesMut) -> io::Result<BlockInfo> {
    Ok(BlockInfo {
        piece_index: buf.get_u32() as PieceIndex,
        offset: buf.get_u32(),
        len: buf.get_u32(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode_msg(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    fn round_trip(msg: Message) {
        let mut buf = encode_msg(msg.clone());
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([0xab; 20], *b"-rp0100-000000000000");
        assert!(handshake.supports_dht());
        assert!(handshake.supports_fast());
        assert!(handshake.supports_extensions());

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len() as u64, handshake.len());
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_handshake_needs_all_bytes() {
        let handshake = Handshake::new([0xab; 20], [0x1; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..40]);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let mut handshake = Handshake::new([0xab; 20], [0x1; 20]);
        handshake.prot[0] = b'X';
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_round_trips() {
        let block = BlockInfo {
            piece_index: 42,
            offset: 0x4000,
            len: 0x4000,
        };
        let mut bitfield = Bitfield::repeat(false, 16);
        bitfield.set(2, true);
        bitfield.set(15, true);

        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have { piece_index: 7 });
        round_trip(Message::Bitfield(bitfield));
        round_trip(Message::Request(block));
        round_trip(Message::Block {
            piece_index: 42,
            offset: 0x4000,
            data: vec![0xfe; 0x4000],
        });
        round_trip(Message::Cancel(block));
        round_trip(Message::Port(6881));
        round_trip(Message::Suggest { piece_index: 3 });
        round_trip(Message::HaveAll);
        round_trip(Message::HaveNone);
        round_trip(Message::Reject(block));
        round_trip(Message::AllowedFast { piece_index: 3 });
        round_trip(Message::Extended {
            id: 0,
            payload: b"d1:md11:ut_metadatai2eee".to_vec(),
        });
    }

    #[test]
    fn test_request_wire_format() {
        let buf = encode_msg(Message::Request(BlockInfo {
            piece_index: 1,
            offset: 0x4000,
            len: 0x4000,
        }));
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 13, // length
                6, // id
                0, 0, 0, 1, // piece index
                0, 0, 0x40, 0, // offset
                0, 0, 0x40, 0, // length
            ]
        );
    }

    #[test]
    fn test_keep_alive_wire_format() {
        let buf = encode_msg(Message::KeepAlive);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut buf = encode_msg(Message::Have { piece_index: 3 });
        let mut partial = BytesMut::from(&buf[..4]);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
        // and with the full frame the message comes out
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Have { piece_index: 3 })
        );
    }

    #[test]
    fn test_multiple_messages_in_one_buffer() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();
        PeerCodec
            .encode(Message::Have { piece_index: 9 }, &mut buf)
            .unwrap();
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Unchoke)
        );
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Have { piece_index: 9 })
        );
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        buf.put_u8(MessageId::Bitfield as u8);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_invalid_message_id_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_wrong_payload_length_rejected() {
        let mut buf = BytesMut::new();
        // a Have message with a 2 byte payload
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(7);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }
}
