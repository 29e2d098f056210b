//! Data packet layout and field packing.

use super::{HEADER_LEN, MEDIA_HEADER_LEN, SocketType};
use crate::error::CodecError;
use crate::seq::{MSG_MAX, SEQ_MAX};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

/// Position of a packet's payload within its message (word 1, bits 30-31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Boundary {
    Middle = 0b00,
    Last = 0b01,
    First = 0b10,
    Solo = 0b11,
}

impl Boundary {
    pub fn is_first(self) -> bool {
        matches!(self, Boundary::First | Boundary::Solo)
    }

    pub fn is_last(self) -> bool {
        matches!(self, Boundary::Last | Boundary::Solo)
    }
}

/// Frame metadata for media flows: ties a chunk back to its frame and
/// carries the frame's delivery deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub frame_id: u16,
    pub chunk_id: u8,
    pub total_chunks: u8,
    /// Absolute deadline in microseconds since connection start.
    pub deadline_us: u32,
}

impl FrameMeta {
    /// Packs the identity fields into the fifth header word. The deadline
    /// rides in word 2 and is not part of this word.
    fn pack(self) -> u32 {
        (self.total_chunks as u32) << 24 | (self.chunk_id as u32) << 16 | self.frame_id as u32
    }

    fn unpack(word: u32, deadline_us: u32) -> Self {
        Self {
            frame_id: (word & 0xFFFF) as u16,
            chunk_id: ((word >> 16) & 0xFF) as u8,
            total_chunks: (word >> 24) as u8,
            deadline_us,
        }
    }
}

/// One data packet: a sequenced chunk of one application message.
#[derive(Debug, Clone)]
pub struct DataPacket {
    /// 31-bit packet sequence number.
    pub seq: u32,
    pub boundary: Boundary,
    /// Deliver in message-number order when set.
    pub in_order: bool,
    /// 29-bit message number shared by all chunks of one send call.
    pub msg_no: u32,
    /// Microseconds since connection start. On media packets carrying frame
    /// metadata this word is the frame deadline instead.
    pub timestamp_us: u32,
    /// Peer socket id.
    pub dest_id: u32,
    /// Present on media flows when the block was tagged; an all-zero frame
    /// word on the wire decodes as `None`.
    pub frame: Option<FrameMeta>,
    pub payload: Bytes,
}

impl DataPacket {
    /// Encodes header and payload into `writer` as one datagram. The layout
    /// (16 or 20 byte header) follows the flow's socket type.
    pub fn encode(&self, writer: &mut BytesMut, kind: SocketType) {
        writer.reserve(kind.header_len() + self.payload.len());
        writer.put_u32(self.seq & SEQ_MAX);
        let mut word1 = (self.boundary as u32) << 30 | (self.msg_no & MSG_MAX);
        if self.in_order {
            word1 |= 1 << 29;
        }
        writer.put_u32(word1);
        match (kind, self.frame) {
            (SocketType::Media, Some(meta)) => {
                writer.put_u32(meta.deadline_us);
                writer.put_u32(self.dest_id);
                writer.put_u32(meta.pack());
            }
            (SocketType::Media, None) => {
                writer.put_u32(self.timestamp_us);
                writer.put_u32(self.dest_id);
                writer.put_u32(0);
            }
            (SocketType::Stream, _) => {
                writer.put_u32(self.timestamp_us);
                writer.put_u32(self.dest_id);
            }
        }
        writer.put_slice(&self.payload);
    }

    /// Decodes a data packet according to the flow's layout.
    pub fn decode(reader: &mut Bytes, kind: SocketType) -> Result<Self, CodecError> {
        let header_len = kind.header_len();
        if reader.remaining() < header_len {
            return Err(CodecError::UnexpectedEof {
                needed: header_len,
                remaining: reader.remaining(),
            });
        }
        let seq = reader.get_u32() & SEQ_MAX;
        let word1 = reader.get_u32();
        // The two boundary bits cover all four values, so this cannot fail.
        let boundary = Boundary::try_from((word1 >> 30) as u8)
            .map_err(|_| CodecError::InvalidField("message boundary".into()))?;
        let in_order = word1 & (1 << 29) != 0;
        let msg_no = word1 & MSG_MAX;
        let timestamp_us = reader.get_u32();
        let dest_id = reader.get_u32();
        let frame = match kind {
            SocketType::Stream => None,
            SocketType::Media => {
                let word = reader.get_u32();
                if word == 0 {
                    None
                } else {
                    Some(FrameMeta::unpack(word, timestamp_us))
                }
            }
        };
        let payload = reader.copy_to_bytes(reader.remaining());
        Ok(Self {
            seq,
            boundary,
            in_order,
            msg_no,
            timestamp_us,
            dest_id,
            frame,
            payload,
        })
    }

    /// Total encoded size for the given layout.
    pub fn wire_len(&self, kind: SocketType) -> usize {
        kind.header_len() + self.payload.len()
    }
}

// Keep the constants honest.
const _: () = assert!(HEADER_LEN == 16 && MEDIA_HEADER_LEN == 20);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(frame: Option<FrameMeta>) -> DataPacket {
        DataPacket {
            seq: 0x12345,
            boundary: Boundary::First,
            in_order: true,
            msg_no: 77,
            timestamp_us: 900_000,
            dest_id: 42,
            frame,
            payload: Bytes::from_static(b"hello transport"),
        }
    }

    #[test]
    fn test_stream_roundtrip() {
        let pkt = sample(None);
        let mut writer = BytesMut::new();
        pkt.encode(&mut writer, SocketType::Stream);
        assert_eq!(writer.len(), HEADER_LEN + pkt.payload.len());

        let mut reader = writer.freeze();
        let decoded = DataPacket::decode(&mut reader, SocketType::Stream).unwrap();
        assert_eq!(decoded.seq, pkt.seq);
        assert_eq!(decoded.boundary, Boundary::First);
        assert!(decoded.in_order);
        assert_eq!(decoded.msg_no, 77);
        assert_eq!(decoded.timestamp_us, 900_000);
        assert_eq!(decoded.dest_id, 42);
        assert_eq!(decoded.frame, None);
        assert_eq!(decoded.payload, pkt.payload);
    }

    #[test]
    fn test_media_roundtrip_carries_frame_and_deadline() {
        let meta = FrameMeta {
            frame_id: 9,
            chunk_id: 3,
            total_chunks: 100,
            deadline_us: 16_000,
        };
        let pkt = sample(Some(meta));
        let mut writer = BytesMut::new();
        pkt.encode(&mut writer, SocketType::Media);
        assert_eq!(writer.len(), MEDIA_HEADER_LEN + pkt.payload.len());

        let mut reader = writer.freeze();
        let decoded = DataPacket::decode(&mut reader, SocketType::Media).unwrap();
        let got = decoded.frame.unwrap();
        assert_eq!(got, meta);
        // The deadline occupies the timestamp word on tagged media packets.
        assert_eq!(decoded.timestamp_us, 16_000);
    }

    #[test]
    fn test_media_untagged_block() {
        let pkt = sample(None);
        let mut writer = BytesMut::new();
        pkt.encode(&mut writer, SocketType::Media);
        let mut reader = writer.freeze();
        let decoded = DataPacket::decode(&mut reader, SocketType::Media).unwrap();
        assert_eq!(decoded.frame, None);
        assert_eq!(decoded.timestamp_us, 900_000);
    }

    #[test]
    fn test_boundary_bits() {
        for (boundary, bits) in [
            (Boundary::Middle, 0b00u32),
            (Boundary::Last, 0b01),
            (Boundary::First, 0b10),
            (Boundary::Solo, 0b11),
        ] {
            let mut pkt = sample(None);
            pkt.boundary = boundary;
            pkt.in_order = false;
            let mut writer = BytesMut::new();
            pkt.encode(&mut writer, SocketType::Stream);
            let word1 = u32::from_be_bytes([writer[4], writer[5], writer[6], writer[7]]);
            assert_eq!(word1 >> 30, bits);
            assert_eq!(word1 & (1 << 29), 0);
            assert_eq!(word1 & MSG_MAX, 77);
        }
    }

    #[test]
    fn test_decode_runt() {
        let mut reader = Bytes::from_static(&[0u8; 10]);
        assert!(matches!(
            DataPacket::decode(&mut reader, SocketType::Stream),
            Err(CodecError::UnexpectedEof { needed: 16, .. })
        ));
    }
}
