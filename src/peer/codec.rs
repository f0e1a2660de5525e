//! The peer wire protocol codec: the handshake frame and the nine typed
//! peer messages (`SPEC_FULL.md` §4.1).
//!
//! Grounded on `original_source/protocol.py`'s `PeerStreamIterator.parse`
//! for the exact streaming-frame semantics (length prefix, partial-frame
//! detection, `KeepAlive` on a zero length prefix), reimplemented as a pair
//! of `tokio_util::codec` types the way the reference engine splits a
//! one-shot `HandshakeCodec` from the long-lived `PeerCodec`, and in the
//! idiom the rest of the retrieval pack uses for this exact seam (see
//! `other_examples/*ltorrent*message.rs`'s `Decoder`/`Encoder` impls).

use std::{convert::TryFrom, fmt};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The fixed protocol string sent in every handshake, per BEP 3.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// A frame whose declared length prefix exceeds this is malformed. Sized
/// generously above the largest legitimate `Piece` message
/// (4 + 4 + 4 + `BLOCK_LEN`).
const MAX_FRAME_LEN: usize = (1 << 20) + 9;

/// The 68-byte opening exchange: protocol string, 8 reserved bytes,
/// `info_hash`, and the sender's `peer_id`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("info_hash", &hex::encode(&self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

pub(crate) struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let pstrlen = src[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(Error::MalformedFrame(format!(
                "unexpected handshake pstrlen {}",
                pstrlen
            )));
        }
        let frame_len = 1 + pstrlen + 8 + 20 + 20;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut prot = [0u8; 19];
        prot.copy_from_slice(&src[1..1 + pstrlen]);
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&src[1 + pstrlen..1 + pstrlen + 8]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&src[1 + pstrlen + 8..1 + pstrlen + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&src[1 + pstrlen + 28..frame_len]);

        src.advance(frame_len);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(68);
        dst.put_u8(handshake.prot.len() as u8);
        dst.put_slice(&handshake.prot);
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

/// The message ID byte that precedes every non-keepalive message's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self, Error> {
        match b {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            other => Err(Error::MalformedFrame(format!("unknown message id {}", other))),
        }
    }
}

/// The eleven cases a peer connection needs to dispatch on: the nine typed
/// wire messages, the zero-length `KeepAlive` framing, and `Unknown` for any
/// message id this crate doesn't recognize (`SPEC_FULL.md` §4.1: an
/// unrecognized id is a soft failure, not a reason to tear down the
/// connection — a forward-compatible peer may send an id this release
/// doesn't know about, e.g. a BEP10 extended message).
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
    Unknown(u8),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
            Message::Port(_) => Some(MessageId::Port),
            Message::Unknown(_) => None,
        }
    }
}

/// The long-lived codec used for the rest of a peer connection's life once
/// the handshake has completed. This is the streaming parser required by
/// `SPEC_FULL.md` §4.1: `decode` never advances the buffer until it has
/// proven a complete frame is present, so it tolerates arbitrary chunking
/// of the underlying TCP stream.
pub(crate) struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if len > MAX_FRAME_LEN {
            return Err(Error::MalformedFrame(format!(
                "frame length {} exceeds cap {}",
                len, MAX_FRAME_LEN
            )));
        }

        let frame_len = 4 + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let id_byte = src[4];
        let payload = &src[5..frame_len];

        let msg = match MessageId::try_from(id_byte) {
            Err(_) => {
                // §4.1: an unrecognized message id is a soft failure. A
                // forward-compatible peer may send an id this release
                // doesn't know about (e.g. a BEP10 extended message); we log
                // and hand the id back rather than tearing down the
                // connection over it.
                log::debug!(
                    "Peer sent message with unknown id {} ({} byte payload)",
                    id_byte,
                    payload.len()
                );
                Message::Unknown(id_byte)
            }
            Ok(MessageId::Unchoke) => expect_empty(payload, MessageId::Unchoke, Message::Unchoke)?,
            Ok(MessageId::Interested) => {
                expect_empty(payload, MessageId::Interested, Message::Interested)?
            }
            Ok(MessageId::NotInterested) => {
                expect_empty(payload, MessageId::NotInterested, Message::NotInterested)?
            }
            Ok(MessageId::Have) => {
                if payload.len() != 4 {
                    return Err(Error::MalformedFrame(
                        "Have payload must be 4 bytes".into(),
                    ));
                }
                let index = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) as PieceIndex;
                Message::Have(index)
            }
            Ok(MessageId::Bitfield) => {
                // the codec itself doesn't know the piece count; trailing
                // spare bits are trimmed by the caller (`PeerSession`) once
                // it does, via `Bitfield::resize`.
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            Ok(MessageId::Request) => Message::Request(parse_block_info(payload)?),
            Ok(MessageId::Piece) => {
                if payload.len() < 8 {
                    return Err(Error::MalformedFrame(
                        "Piece payload shorter than 8 bytes".into(),
                    ));
                }
                let piece_index = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) as PieceIndex;
                let offset = u32::from_be_bytes([
                    payload[4], payload[5], payload[6], payload[7],
                ]);
                let data = payload[8..].to_vec();
                Message::Piece {
                    piece_index,
                    offset,
                    data,
                }
            }
            Ok(MessageId::Cancel) => Message::Cancel(parse_block_info(payload)?),
            Ok(MessageId::Port) => {
                if payload.len() != 2 {
                    return Err(Error::MalformedFrame(
                        "Port payload must be 2 bytes".into(),
                    ));
                }
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
        };

        src.advance(frame_len);
        Ok(Some(msg))
    }
}

fn expect_empty(
    payload: &[u8],
    id: MessageId,
    msg: Message,
) -> Result<Message, Error> {
    if !payload.is_empty() {
        return Err(Error::MalformedFrame(format!(
            "{:?} must have an empty payload",
            id
        )));
    }
    Ok(msg)
}

fn parse_block_info(payload: &[u8]) -> Result<BlockInfo, Error> {
    if payload.len() != 12 {
        return Err(Error::MalformedFrame(
            "Request/Cancel payload must be 12 bytes".into(),
        ));
    }
    let piece_index =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as PieceIndex;
    let offset = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let len = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    Ok(BlockInfo {
        piece_index,
        offset,
        len,
    })
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke => encode_empty(dst, MessageId::Choke),
            Message::Unchoke => encode_empty(dst, MessageId::Unchoke),
            Message::Interested => encode_empty(dst, MessageId::Interested),
            Message::NotInterested => encode_empty(dst, MessageId::NotInterested),
            Message::Have(index) => {
                dst.reserve(4 + 1 + 4);
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.reserve(4 + 1 + bytes.len());
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bytes);
            }
            Message::Request(block) => encode_block_info(dst, MessageId::Request, block),
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                dst.reserve(4 + 1 + 4 + 4 + data.len());
                dst.put_u32(1 + 4 + 4 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => encode_block_info(dst, MessageId::Cancel, block),
            Message::Port(port) => {
                dst.reserve(4 + 1 + 2);
                dst.put_u32(3);
                dst.put_u8(MessageId::Port as u8);
                dst.put_u16(port);
            }
            Message::Unknown(id) => {
                // received-only: this crate never constructs one of these to
                // send, since we don't know the payload shape behind an id
                // we don't recognize.
                log::warn!("attempted to encode unsupported message id {}", id);
            }
        }
        Ok(())
    }
}

fn encode_empty(dst: &mut BytesMut, id: MessageId) {
    dst.reserve(5);
    dst.put_u32(1);
    dst.put_u8(id as u8);
}

fn encode_block_info(dst: &mut BytesMut, id: MessageId, block: BlockInfo) {
    dst.reserve(4 + 1 + 12);
    dst.put_u32(1 + 12);
    dst.put_u8(id as u8);
    dst.put_u32(block.piece_index as u32);
    dst.put_u32(block.offset);
    dst.put_u32(block.len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: Message) {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_every_typed_message() {
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have(7));
        roundtrip(Message::Bitfield(Bitfield::from_vec(vec![0b1010_0000])));
        roundtrip(Message::Request(BlockInfo {
            piece_index: 1,
            offset: 0,
            len: 16384,
        }));
        roundtrip(Message::Piece {
            piece_index: 0,
            offset: 0,
            data: b"XYZT".to_vec(),
        });
        roundtrip(Message::Cancel(BlockInfo {
            piece_index: 2,
            offset: 16384,
            len: 16384,
        }));
        roundtrip(Message::Port(6881));
    }

    #[test]
    fn keepalive_consumes_four_bytes() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_frame_over_cap() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    /// `SPEC_FULL.md` §4.1: an unrecognized message id is a soft failure —
    /// `Unknown(id)` plus a log line, not a `MalformedFrame` disconnect. A
    /// BEP10-extended peer (id 20) must not tear down the session.
    #[test]
    fn unknown_message_id_decodes_as_unknown_instead_of_erroring() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1 + 3); // id byte + 3 bytes of payload we don't understand
        buf.put_u8(20);
        buf.put_slice(&[1, 2, 3]);

        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Unknown(20));
        assert!(msg.id().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_reads_do_not_consume_bytes() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5); // Have message: id + 4 byte index
        buf.put_u8(MessageId::Have as u8);
        // only 2 of the 4 index bytes have arrived
        buf.put_u8(0);
        buf.put_u8(0);
        let before = buf.len();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);
    }

    /// Streaming scenario from `SPEC_FULL.md` §8: feed
    /// `BitField ‖ Have(7) ‖ KeepAlive ‖ Piece(0, 0, "XYZT")` in chunks of
    /// 1, 3, and 7 bytes and expect exactly those four messages in order.
    #[test]
    fn streams_arbitrary_chunking_into_the_same_message_sequence() {
        let mut encoder = PeerCodec;
        let mut whole = BytesMut::new();
        encoder
            .encode(Message::Bitfield(Bitfield::from_vec(vec![0b1100_0001])), &mut whole)
            .unwrap();
        encoder.encode(Message::Have(7), &mut whole).unwrap();
        encoder.encode(Message::KeepAlive, &mut whole).unwrap();
        encoder
            .encode(
                Message::Piece {
                    piece_index: 0,
                    offset: 0,
                    data: b"XYZT".to_vec(),
                },
                &mut whole,
            )
            .unwrap();
        let whole = whole.freeze().to_vec();

        for chunk_size in [1usize, 3, 7] {
            let mut decoder = PeerCodec;
            let mut buf = BytesMut::new();
            let mut messages = Vec::new();
            for chunk in whole.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                while let Some(msg) = decoder.decode(&mut buf).unwrap() {
                    messages.push(msg);
                }
            }
            assert_eq!(messages.len(), 4, "chunk size {}", chunk_size);
            assert!(matches!(messages[0], Message::Bitfield(_)));
            assert_eq!(messages[1], Message::Have(7));
            assert_eq!(messages[2], Message::KeepAlive);
            assert!(matches!(messages[3], Message::Piece { .. }));
            assert!(buf.is_empty(), "residual bytes at chunk size {}", chunk_size);
        }
    }
}
