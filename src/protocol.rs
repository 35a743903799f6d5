//! On-wire formats: one record per UDP payload, all integers big-endian,
//! fields laid out with no padding.
//!
//! There are two datagram families sharing a common header prefix. The tiled
//! family inserts a `tile_id` right after `frame_type`; which family a socket
//! speaks is fixed by the program pair, not signalled on the wire, so
//! decoding is parameterised by [`WireFormat`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// (frame_id, frag_id): the identity of a fragment within a session.
pub type SeqNum = (u32, u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Unknown,
    Key,
    NonKey,
}

impl FrameType {
    pub fn to_u8(self) -> u8 {
        match self {
            FrameType::Unknown => 0,
            FrameType::Key => 1,
            FrameType::NonKey => 2,
        }
    }

    pub fn from_u8(raw: u8) -> FrameType {
        match raw {
            1 => FrameType::Key,
            2 => FrameType::NonKey,
            _ => FrameType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Plain,
    Tiled,
}

impl WireFormat {
    /// Serialized header size: 4 + 1 + 2 + 2 + 2 + 2 + 8 = 21 bytes,
    /// plus 2 for the tile id in the tiled family.
    pub fn header_len(self) -> usize {
        match self {
            WireFormat::Plain => 21,
            WireFormat::Tiled => 23,
        }
    }
}

/// One fragment of a compressed frame.
///
/// `tile_id` is `Some` exactly on the tiled wire family. `send_ts` is stamped
/// immediately before each (re)transmission and echoed back in the ACK;
/// retransmission bookkeeping lives off-wire in the sender's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub frame_id: u32,
    pub frame_type: FrameType,
    pub tile_id: Option<u16>,
    pub frag_id: u16,
    pub frag_cnt: u16,
    pub frame_width: u16,
    pub frame_height: u16,
    pub send_ts: u64,
    pub payload: Bytes,
}

impl Datagram {
    pub fn seq(&self) -> SeqNum {
        (self.frame_id, self.frag_id)
    }

    pub fn wire_format(&self) -> WireFormat {
        if self.tile_id.is_some() {
            WireFormat::Tiled
        } else {
            WireFormat::Plain
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_format().header_len() + self.payload.len());
        buf.put_u32(self.frame_id);
        buf.put_u8(self.frame_type.to_u8());
        if let Some(tile_id) = self.tile_id {
            buf.put_u16(tile_id);
        }
        buf.put_u16(self.frag_id);
        buf.put_u16(self.frag_cnt);
        buf.put_u16(self.frame_width);
        buf.put_u16(self.frame_height);
        buf.put_u64(self.send_ts);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes, format: WireFormat) -> Result<Datagram, ProtocolError> {
        if buf.len() < format.header_len() {
            return Err(ProtocolError::Malformed("datagram shorter than its header"));
        }

        let frame_id = buf.get_u32();
        let frame_type = FrameType::from_u8(buf.get_u8());
        let tile_id = match format {
            WireFormat::Plain => None,
            WireFormat::Tiled => Some(buf.get_u16()),
        };
        let frag_id = buf.get_u16();
        let frag_cnt = buf.get_u16();
        let frame_width = buf.get_u16();
        let frame_height = buf.get_u16();
        let send_ts = buf.get_u64();

        Ok(Datagram {
            frame_id,
            frame_type,
            tile_id,
            frag_id,
            frag_cnt,
            frame_width,
            frame_height,
            send_ts,
            payload: buf,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub frame_id: u32,
    pub frag_id: u16,
    /// Echo of the `send_ts` the sender stamped into the acknowledged
    /// fragment; `now - send_ts` at the sender is one RTT sample.
    pub send_ts: u64,
}

impl Ack {
    pub fn for_datagram(datagram: &Datagram) -> Ack {
        Ack {
            frame_id: datagram.frame_id,
            frag_id: datagram.frag_id,
            send_ts: datagram.send_ts,
        }
    }
}

/// Sent once per socket by the receiver to open the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub width: u16,
    pub height: u16,
    pub frame_rate: u16,
    pub target_bitrate: u32,
}

/// Remote bitrate estimate, in kbps. Whatever produces it lives outside this
/// crate; receipt re-targets the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateEstimate {
    pub target_bitrate: u32,
}

/// Control-plane messages. One per UDP payload, first byte is the type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Ack(Ack),
    Config(Config),
    RateEstimate(RateEstimate),
}

const TAG_ACK: u8 = 1;
const TAG_CONFIG: u8 = 2;
const TAG_RATE_ESTIMATE: u8 = 3;

impl Message {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Message::Ack(ack) => {
                buf.put_u8(TAG_ACK);
                buf.put_u32(ack.frame_id);
                buf.put_u16(ack.frag_id);
                buf.put_u64(ack.send_ts);
            }
            Message::Config(config) => {
                buf.put_u8(TAG_CONFIG);
                buf.put_u16(config.width);
                buf.put_u16(config.height);
                buf.put_u16(config.frame_rate);
                buf.put_u32(config.target_bitrate);
            }
            Message::RateEstimate(est) => {
                buf.put_u8(TAG_RATE_ESTIMATE);
                buf.put_u32(est.target_bitrate);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Message, ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::Malformed("empty message"));
        }

        let tag = buf.get_u8();
        match tag {
            TAG_ACK => {
                if buf.remaining() < 14 {
                    return Err(ProtocolError::Malformed("truncated ACK"));
                }
                Ok(Message::Ack(Ack {
                    frame_id: buf.get_u32(),
                    frag_id: buf.get_u16(),
                    send_ts: buf.get_u64(),
                }))
            }
            TAG_CONFIG => {
                if buf.remaining() < 10 {
                    return Err(ProtocolError::Malformed("truncated CONFIG"));
                }
                Ok(Message::Config(Config {
                    width: buf.get_u16(),
                    height: buf.get_u16(),
                    frame_rate: buf.get_u16(),
                    target_bitrate: buf.get_u32(),
                }))
            }
            TAG_RATE_ESTIMATE => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Malformed("truncated RATE_ESTIMATE"));
                }
                Ok(Message::RateEstimate(RateEstimate {
                    target_bitrate: buf.get_u32(),
                }))
            }
            _ => Err(ProtocolError::Malformed("unknown message tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    fn datagram(tile_id: Option<u16>, payload: &'static [u8]) -> Datagram {
        Datagram {
            frame_id: 0x0102_0304,
            frame_type: FrameType::Key,
            tile_id,
            frag_id: 7,
            frag_cnt: 9,
            frame_width: 1280,
            frame_height: 720,
            send_ts: 0x1122_3344_5566_7788,
            payload: Bytes::from_static(payload),
        }
    }

    #[rstest]
    #[case::plain(None, &b"hello"[..])]
    #[case::plain_empty(None, &b""[..])]
    #[case::tiled(Some(13), &b"tile payload"[..])]
    #[case::tiled_empty(Some(0), &b""[..])]
    fn datagram_round_trip(#[case] tile_id: Option<u16>, #[case] payload: &'static [u8]) {
        let original = datagram(tile_id, payload);
        let format = original.wire_format();

        let encoded = original.encode();
        assert_eq!(encoded.len(), format.header_len() + payload.len());

        let decoded = Datagram::decode(encoded, format).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn datagram_header_layout() {
        let encoded = datagram(None, b"").encode();
        // frame_id, then frame_type
        assert_eq!(&encoded[..5], &[1, 2, 3, 4, 1]);
        // frag_id, frag_cnt
        assert_eq!(&encoded[5..9], &[0, 7, 0, 9]);
        // width, height
        assert_eq!(&encoded[9..13], &[5, 0, 2, 208]);
        // send_ts
        assert_eq!(
            &encoded[13..21],
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn tiled_header_carries_tile_id_after_frame_type() {
        let encoded = datagram(Some(0x0a0b), b"").encode();
        assert_eq!(&encoded[5..7], &[0x0a, 0x0b]);
        assert_eq!(encoded.len(), 23);
    }

    #[rstest]
    #[case::plain(WireFormat::Plain)]
    #[case::tiled(WireFormat::Tiled)]
    fn short_datagram_is_malformed(#[case] format: WireFormat) {
        let buf = Bytes::from(vec![0u8; format.header_len() - 1]);
        assert_matches!(
            Datagram::decode(buf, format),
            Err(ProtocolError::Malformed(_))
        );
    }

    #[test]
    fn unknown_frame_type_decodes_as_unknown() {
        let mut original = datagram(None, b"x");
        original.frame_type = FrameType::Unknown;
        let mut raw = original.encode().to_vec();
        raw[4] = 200; // not a defined frame type
        let decoded = Datagram::decode(Bytes::from(raw), WireFormat::Plain).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Unknown);
    }

    #[rstest]
    #[case::ack(Message::Ack(Ack { frame_id: 42, frag_id: 3, send_ts: 987_654_321 }), 15)]
    #[case::config(Message::Config(Config { width: 1920, height: 1080, frame_rate: 30, target_bitrate: 8000 }), 11)]
    #[case::rate(Message::RateEstimate(RateEstimate { target_bitrate: 2500 }), 5)]
    fn message_round_trip(#[case] original: Message, #[case] wire_len: usize) {
        let encoded = original.encode();
        assert_eq!(encoded.len(), wire_len);
        assert_eq!(Message::decode(&encoded).unwrap(), original);
    }

    #[rstest]
    #[case::empty(&[][..])]
    #[case::invalid_tag(&[0u8][..])]
    #[case::unknown_tag(&[9u8, 0, 0, 0, 0][..])]
    #[case::truncated_ack(&[1u8, 0, 0][..])]
    #[case::truncated_config(&[2u8, 0, 1][..])]
    #[case::truncated_rate(&[3u8, 0][..])]
    fn bad_message_is_malformed(#[case] raw: &[u8]) {
        assert_matches!(Message::decode(raw), Err(ProtocolError::Malformed(_)));
    }

    #[test]
    fn ack_echoes_the_stamped_send_ts() {
        let mut d = datagram(None, b"payload");
        d.send_ts = 1_000_001;
        let ack = Ack::for_datagram(&d);
        assert_eq!(ack.frame_id, d.frame_id);
        assert_eq!(ack.frag_id, d.frag_id);
        assert_eq!(ack.send_ts, 1_000_001);
    }
}
