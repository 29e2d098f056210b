//! Control packet definitions and the NAK loss-list encoding.

use super::{HEADER_LEN, SocketType, VERSION};
use crate::error::CodecError;
use crate::seq::SEQ_MAX;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::net::IpAddr;

/// Control packet types (word 0, bits 16-30).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum ControlType {
    Handshake = 0,
    KeepAlive = 1,
    Ack = 2,
    Nak = 3,
    CongestionWarning = 4,
    Shutdown = 5,
    Ack2 = 6,
    MsgDrop = 7,
    PeerError = 8,
}

/// Handshake payload (48 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub socket_type: SocketType,
    /// Initial packet sequence number.
    pub init_seq: u32,
    pub mss: u32,
    /// Maximum unacknowledged packets the sender of this handshake accepts.
    pub flow_window: u32,
    /// 1 = request, 0 = rendezvous, -1 = response, -2 = listener challenge.
    pub request_type: i32,
    pub socket_id: u32,
    pub cookie: u32,
    /// The address the sender sees the peer's UDP port bound to.
    pub peer_ip: [u8; 16],
}

pub const HANDSHAKE_LEN: usize = 48;

impl Handshake {
    pub fn peer_addr_bytes(ip: IpAddr) -> [u8; 16] {
        match ip {
            IpAddr::V4(v4) => {
                let mut out = [0u8; 16];
                out[..4].copy_from_slice(&v4.octets());
                out
            }
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    fn encode(&self, writer: &mut BytesMut) {
        writer.put_u32(self.version);
        writer.put_u32(self.socket_type as u32);
        writer.put_u32(self.init_seq & SEQ_MAX);
        writer.put_u32(self.mss);
        writer.put_u32(self.flow_window);
        writer.put_i32(self.request_type);
        writer.put_u32(self.socket_id);
        writer.put_u32(self.cookie);
        writer.put_slice(&self.peer_ip);
    }

    fn decode(reader: &mut Bytes) -> Result<Self, CodecError> {
        if reader.remaining() < HANDSHAKE_LEN {
            return Err(CodecError::UnexpectedEof {
                needed: HANDSHAKE_LEN,
                remaining: reader.remaining(),
            });
        }
        let version = reader.get_u32();
        let socket_type = SocketType::try_from(reader.get_u32())
            .map_err(|e| CodecError::InvalidField(format!("socket type {}", e.number)))?;
        let init_seq = reader.get_u32() & SEQ_MAX;
        let mss = reader.get_u32();
        let flow_window = reader.get_u32();
        let request_type = reader.get_i32();
        let socket_id = reader.get_u32();
        let cookie = reader.get_u32();
        let mut peer_ip = [0u8; 16];
        reader.copy_to_slice(&mut peer_ip);
        Ok(Self {
            version,
            socket_type,
            init_seq,
            mss,
            flow_window,
            request_type,
            socket_id,
            cookie,
            peer_ip,
        })
    }
}

/// Extended fields of a full acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckDetail {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// Free receive-buffer slots (packets).
    pub avail_window: u32,
    /// Measured delivery rate and estimated link capacity, packets/second.
    /// Included on every other full acknowledgment.
    pub rates: Option<(u32, u32)>,
}

/// Acknowledgment body: the first not-yet-received sequence, plus detail on
/// full (non-light) acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub ack_seq: u32,
    pub detail: Option<AckDetail>,
}

impl AckInfo {
    fn encode(&self, writer: &mut BytesMut) {
        writer.put_u32(self.ack_seq & SEQ_MAX);
        if let Some(detail) = self.detail {
            writer.put_u32(detail.rtt_us);
            writer.put_u32(detail.rtt_var_us);
            writer.put_u32(detail.avail_window);
            if let Some((recv_rate, bandwidth)) = detail.rates {
                writer.put_u32(recv_rate);
                writer.put_u32(bandwidth);
            }
        }
    }

    fn decode(reader: &mut Bytes) -> Result<Self, CodecError> {
        if reader.remaining() < 4 {
            return Err(CodecError::UnexpectedEof {
                needed: 4,
                remaining: reader.remaining(),
            });
        }
        let ack_seq = reader.get_u32() & SEQ_MAX;
        let detail = if reader.remaining() >= 12 {
            let rtt_us = reader.get_u32();
            let rtt_var_us = reader.get_u32();
            let avail_window = reader.get_u32();
            let rates = if reader.remaining() >= 8 {
                Some((reader.get_u32(), reader.get_u32()))
            } else {
                None
            };
            Some(AckDetail {
                rtt_us,
                rtt_var_us,
                avail_window,
                rates,
            })
        } else {
            None
        };
        Ok(Self { ack_seq, detail })
    }
}

/// Decoded control packet body, one variant per `ControlType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlInfo {
    Handshake(Handshake),
    KeepAlive,
    /// `ack_no` is the acknowledgment sub-sequence (additional-info word).
    Ack { ack_no: u32, info: AckInfo },
    /// Raw loss-encoded words; see [`encode_loss`]/[`decode_loss`].
    Nak(Vec<u32>),
    CongestionWarning,
    Shutdown,
    /// Acknowledges the acknowledgment carrying the same sub-sequence.
    Ack2 { ack_no: u32 },
    /// The sender abandoned a message; its packets will never arrive.
    MsgDrop { msg_no: u32, first_seq: u32, last_seq: u32 },
    PeerError { code: u32 },
}

impl ControlInfo {
    fn control_type(&self) -> ControlType {
        match self {
            ControlInfo::Handshake(_) => ControlType::Handshake,
            ControlInfo::KeepAlive => ControlType::KeepAlive,
            ControlInfo::Ack { .. } => ControlType::Ack,
            ControlInfo::Nak(_) => ControlType::Nak,
            ControlInfo::CongestionWarning => ControlType::CongestionWarning,
            ControlInfo::Shutdown => ControlType::Shutdown,
            ControlInfo::Ack2 { .. } => ControlType::Ack2,
            ControlInfo::MsgDrop { .. } => ControlType::MsgDrop,
            ControlInfo::PeerError { .. } => ControlType::PeerError,
        }
    }

    /// The type-specific additional-info word (word 1).
    fn additional_info(&self) -> u32 {
        match self {
            ControlInfo::Ack { ack_no, .. } => *ack_no,
            ControlInfo::Ack2 { ack_no } => *ack_no,
            ControlInfo::MsgDrop { msg_no, .. } => *msg_no,
            ControlInfo::PeerError { code } => *code,
            _ => 0,
        }
    }
}

/// A control packet: shared header plus a typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub timestamp_us: u32,
    pub dest_id: u32,
    pub info: ControlInfo,
}

impl ControlPacket {
    pub fn encode(&self, writer: &mut BytesMut) {
        let type_bits = (self.info.control_type() as u32) << 16;
        writer.put_u32(0x8000_0000 | type_bits);
        writer.put_u32(self.info.additional_info());
        writer.put_u32(self.timestamp_us);
        writer.put_u32(self.dest_id);
        match &self.info {
            ControlInfo::Handshake(hs) => hs.encode(writer),
            ControlInfo::Ack { info, .. } => info.encode(writer),
            ControlInfo::Nak(words) => {
                for word in words {
                    writer.put_u32(*word);
                }
            }
            ControlInfo::MsgDrop {
                first_seq,
                last_seq,
                ..
            } => {
                writer.put_u32(*first_seq & SEQ_MAX);
                writer.put_u32(*last_seq & SEQ_MAX);
            }
            ControlInfo::KeepAlive
            | ControlInfo::CongestionWarning
            | ControlInfo::Shutdown
            | ControlInfo::Ack2 { .. }
            | ControlInfo::PeerError { .. } => {}
        }
    }

    pub fn decode(reader: &mut Bytes) -> Result<Self, CodecError> {
        if reader.remaining() < HEADER_LEN {
            return Err(CodecError::UnexpectedEof {
                needed: HEADER_LEN,
                remaining: reader.remaining(),
            });
        }
        let word0 = reader.get_u32();
        let type_bits = ((word0 >> 16) & 0x7FFF) as u16;
        let control_type = ControlType::try_from(type_bits)
            .map_err(|_| CodecError::UnknownControlType(type_bits))?;
        let additional = reader.get_u32();
        let timestamp_us = reader.get_u32();
        let dest_id = reader.get_u32();
        let info = match control_type {
            ControlType::Handshake => ControlInfo::Handshake(Handshake::decode(reader)?),
            ControlType::KeepAlive => ControlInfo::KeepAlive,
            ControlType::Ack => ControlInfo::Ack {
                ack_no: additional,
                info: AckInfo::decode(reader)?,
            },
            ControlType::Nak => {
                if reader.remaining() % 4 != 0 {
                    return Err(CodecError::InvalidField("loss list length".into()));
                }
                let mut words = Vec::with_capacity(reader.remaining() / 4);
                while reader.has_remaining() {
                    words.push(reader.get_u32());
                }
                ControlInfo::Nak(words)
            }
            ControlType::CongestionWarning => ControlInfo::CongestionWarning,
            ControlType::Shutdown => ControlInfo::Shutdown,
            ControlType::Ack2 => ControlInfo::Ack2 { ack_no: additional },
            ControlType::MsgDrop => {
                if reader.remaining() < 8 {
                    return Err(CodecError::UnexpectedEof {
                        needed: 8,
                        remaining: reader.remaining(),
                    });
                }
                ControlInfo::MsgDrop {
                    msg_no: additional,
                    first_seq: reader.get_u32() & SEQ_MAX,
                    last_seq: reader.get_u32() & SEQ_MAX,
                }
            }
            ControlType::PeerError => ControlInfo::PeerError { code: additional },
        };
        Ok(Self {
            timestamp_us,
            dest_id,
            info,
        })
    }
}

/// Builds a fresh handshake request with the local parameters.
pub fn handshake_request(
    socket_type: SocketType,
    init_seq: u32,
    mss: u32,
    flow_window: u32,
    request_type: i32,
    socket_id: u32,
    cookie: u32,
    peer: IpAddr,
) -> Handshake {
    Handshake {
        version: VERSION,
        socket_type,
        init_seq,
        mss,
        flow_window,
        request_type,
        socket_id,
        cookie,
        peer_ip: Handshake::peer_addr_bytes(peer),
    }
}

/// Encodes lost-sequence ranges into NAK words. A range of one packet is a
/// bare sequence (high bit clear); a longer range is its start with the high
/// bit set, followed by the inclusive end.
pub fn encode_loss(ranges: &[(u32, u32)]) -> Vec<u32> {
    let mut words = Vec::with_capacity(ranges.len() * 2);
    for &(start, end) in ranges {
        if start == end {
            words.push(start & SEQ_MAX);
        } else {
            words.push(start & SEQ_MAX | 0x8000_0000);
            words.push(end & SEQ_MAX);
        }
    }
    words
}

/// Decodes NAK words back into ranges, validating that every range start is
/// followed by an end and that endpoints are ordered.
pub fn decode_loss(words: &[u32]) -> Result<Vec<(u32, u32)>, CodecError> {
    let mut ranges = Vec::new();
    let mut iter = words.iter();
    while let Some(&word) = iter.next() {
        if word & 0x8000_0000 != 0 {
            let start = word & SEQ_MAX;
            let &end = iter
                .next()
                .ok_or_else(|| CodecError::InvalidField("truncated loss range".into()))?;
            if end & 0x8000_0000 != 0 {
                return Err(CodecError::InvalidField("range end has start bit".into()));
            }
            if crate::seq::cmp(start, end) > 0 {
                return Err(CodecError::InvalidField(format!(
                    "inverted loss range {} > {}",
                    start, end
                )));
            }
            ranges.push((start, end));
        } else {
            ranges.push((word, word));
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn roundtrip(info: ControlInfo) -> ControlPacket {
        let pkt = ControlPacket {
            timestamp_us: 123_456,
            dest_id: 99,
            info,
        };
        let mut writer = BytesMut::new();
        pkt.encode(&mut writer);
        let mut reader = writer.freeze();
        let decoded = ControlPacket::decode(&mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(decoded, pkt);
        decoded
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = handshake_request(
            SocketType::Media,
            0x0123_4567,
            1500,
            25600,
            1,
            0xAABB_CCDD,
            0x5EED,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        );
        let decoded = roundtrip(ControlInfo::Handshake(hs));
        if let ControlInfo::Handshake(got) = decoded.info {
            assert_eq!(got.version, VERSION);
            assert_eq!(got.peer_ip[..4], [10, 0, 0, 7]);
        } else {
            panic!("expected handshake");
        }
    }

    #[test]
    fn test_handshake_wire_size() {
        let hs = handshake_request(
            SocketType::Stream,
            1,
            1500,
            16,
            1,
            2,
            3,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let mut writer = BytesMut::new();
        ControlPacket {
            timestamp_us: 0,
            dest_id: 0,
            info: ControlInfo::Handshake(hs),
        }
        .encode(&mut writer);
        assert_eq!(writer.len(), HEADER_LEN + HANDSHAKE_LEN);
    }

    #[test]
    fn test_ack_tiers() {
        roundtrip(ControlInfo::Ack {
            ack_no: 7,
            info: AckInfo {
                ack_seq: 1000,
                detail: None,
            },
        });
        roundtrip(ControlInfo::Ack {
            ack_no: 8,
            info: AckInfo {
                ack_seq: 1001,
                detail: Some(AckDetail {
                    rtt_us: 20_000,
                    rtt_var_us: 5_000,
                    avail_window: 8192,
                    rates: None,
                }),
            },
        });
        roundtrip(ControlInfo::Ack {
            ack_no: 9,
            info: AckInfo {
                ack_seq: 1002,
                detail: Some(AckDetail {
                    rtt_us: 20_000,
                    rtt_var_us: 5_000,
                    avail_window: 8192,
                    rates: Some((80_000, 120_000)),
                }),
            },
        });
    }

    #[test]
    fn test_simple_bodies() {
        roundtrip(ControlInfo::KeepAlive);
        roundtrip(ControlInfo::Shutdown);
        roundtrip(ControlInfo::CongestionWarning);
        roundtrip(ControlInfo::Ack2 { ack_no: 31 });
        roundtrip(ControlInfo::PeerError { code: 4 });
        roundtrip(ControlInfo::MsgDrop {
            msg_no: 12,
            first_seq: 300,
            last_seq: 320,
        });
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut writer = BytesMut::new();
        writer.put_u32(0x8000_0000 | (200u32 << 16));
        writer.put_u32(0);
        writer.put_u32(0);
        writer.put_u32(0);
        let mut reader = writer.freeze();
        assert!(matches!(
            ControlPacket::decode(&mut reader),
            Err(CodecError::UnknownControlType(200))
        ));
    }

    #[test]
    fn test_loss_encoding_compresses_runs() {
        // A burst plus two isolated losses.
        let ranges = vec![(102, 105), (200, 200), (250, 251)];
        let words = encode_loss(&ranges);
        assert_eq!(
            words,
            vec![102 | 0x8000_0000, 105, 200, 250 | 0x8000_0000, 251]
        );
        assert_eq!(decode_loss(&words).unwrap(), ranges);
    }

    #[test]
    fn test_loss_decode_rejects_inverted_range() {
        let words = vec![105 | 0x8000_0000, 102];
        assert!(decode_loss(&words).is_err());
    }

    #[test]
    fn test_loss_decode_rejects_truncated_range() {
        let words = vec![105 | 0x8000_0000];
        assert!(decode_loss(&words).is_err());
    }

    #[test]
    fn test_loss_range_across_wrap() {
        let ranges = vec![(SEQ_MAX - 1, 2)];
        let words = encode_loss(&ranges);
        assert_eq!(decode_loss(&words).unwrap(), ranges);
    }
}
