//! Receiver-side driver: assembler in front, codec and display sink behind.

use tracing::{debug, trace, warn};

use crate::assembler::FrameAssembler;
use crate::codec::FrameDecoder;
use crate::error::ProtocolError;
use crate::image::RawImage;
use crate::protocol::Datagram;

/// What happens to a completed frame. Level 2 measures the network stack in
/// isolation by skipping the codec entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyLevel {
    Display,
    DecodeOnly,
    Discard,
}

impl LazyLevel {
    pub fn from_u8(raw: u8) -> Option<LazyLevel> {
        match raw {
            0 => Some(LazyLevel::Display),
            1 => Some(LazyLevel::DecodeOnly),
            2 => Some(LazyLevel::Discard),
            _ => None,
        }
    }
}

/// Consumer of decoded frames; the real display lives outside this crate.
pub trait FrameSink: Send {
    fn present(&mut self, frame: &RawImage) -> Result<(), ProtocolError>;
}

pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &RawImage) -> Result<(), ProtocolError> {
        Ok(())
    }
}

pub struct DecoderDriver {
    assembler: FrameAssembler,
    codec: Box<dyn FrameDecoder>,
    sink: Box<dyn FrameSink>,
    lazy: LazyLevel,

    frames_delivered: u64,
    decode_failures: u64,
}

impl DecoderDriver {
    pub fn new(
        codec: Box<dyn FrameDecoder>,
        sink: Box<dyn FrameSink>,
        lazy: LazyLevel,
    ) -> DecoderDriver {
        DecoderDriver {
            assembler: FrameAssembler::new(),
            codec,
            sink,
            lazy,
            frames_delivered: 0,
            decode_failures: 0,
        }
    }

    /// Feeds one fragment in. An inconsistent fragment is discarded with a
    /// log line; the poisoned frame falls to the stale purge eventually.
    pub fn add_datagram(&mut self, datagram: Datagram) {
        match self.assembler.add(datagram) {
            Ok(()) => {}
            Err(e @ ProtocolError::Inconsistent { .. }) => warn!("discarding fragment: {e}"),
            Err(e) => debug!("discarding fragment: {e}"),
        }
    }

    /// Consumes every frame that is complete at the cursor, decoding and
    /// displaying according to the lazy level. Returns how many frames were
    /// consumed.
    pub fn drain_complete(&mut self) -> Result<usize, ProtocolError> {
        let mut consumed = 0;
        while let Some(frame) = self.assembler.consume_next_frame() {
            consumed += 1;
            self.frames_delivered += 1;
            trace!(
                frame_id = frame.frame_id,
                len = frame.data.len(),
                "frame complete"
            );

            if self.lazy == LazyLevel::Discard {
                continue;
            }
            let decoded = match self.codec.decode_frame(&frame.data) {
                Ok(decoded) => decoded,
                Err(ProtocolError::CodecFailure(reason)) => {
                    warn!(frame_id = frame.frame_id, %reason, "decode failed, skipping frame");
                    self.decode_failures += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self.lazy == LazyLevel::Display {
                self.sink.present(&decoded)?;
            }
        }
        Ok(consumed)
    }

    pub fn next_frame_id(&self) -> u32 {
        self.assembler.next_frame_id()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn pending_frames(&self) -> usize {
        self.assembler.pending_frames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MockFrameDecoder, SyntheticCodec};
    use crate::protocol::FrameType;
    use bytes::Bytes;

    fn fragment(frame_id: u32, frag_id: u16, frag_cnt: u16) -> Datagram {
        Datagram {
            frame_id,
            frame_type: FrameType::NonKey,
            tile_id: None,
            frag_id,
            frag_cnt,
            frame_width: 320,
            frame_height: 240,
            send_ts: 0,
            payload: Bytes::from_static(b"data"),
        }
    }

    fn synthetic_driver(lazy: LazyLevel) -> DecoderDriver {
        DecoderDriver::new(
            Box::new(SyntheticCodec::new(320, 240, 30, 500)),
            Box::new(NullSink),
            lazy,
        )
    }

    #[test]
    fn frames_flow_through_in_order() {
        let mut dec = synthetic_driver(LazyLevel::Display);
        dec.add_datagram(fragment(0, 0, 2));
        assert_eq!(dec.drain_complete().unwrap(), 0);

        dec.add_datagram(fragment(0, 1, 2));
        dec.add_datagram(fragment(1, 0, 1));
        assert_eq!(dec.drain_complete().unwrap(), 2);
        assert_eq!(dec.frames_delivered(), 2);
        assert_eq!(dec.next_frame_id(), 2);
    }

    #[test]
    fn discard_level_skips_the_codec() {
        let mut codec = MockFrameDecoder::new();
        codec.expect_decode_frame().never();

        let mut dec = DecoderDriver::new(Box::new(codec), Box::new(NullSink), LazyLevel::Discard);
        dec.add_datagram(fragment(0, 0, 1));
        assert_eq!(dec.drain_complete().unwrap(), 1);
        assert_eq!(dec.frames_delivered(), 1);
    }

    #[test]
    fn decode_only_level_never_presents() {
        struct PanicSink;
        impl FrameSink for PanicSink {
            fn present(&mut self, _frame: &RawImage) -> Result<(), ProtocolError> {
                panic!("frame must not be displayed at lazy level 1");
            }
        }

        let mut dec = DecoderDriver::new(
            Box::new(SyntheticCodec::new(320, 240, 30, 500)),
            Box::new(PanicSink),
            LazyLevel::DecodeOnly,
        );
        dec.add_datagram(fragment(0, 0, 1));
        assert_eq!(dec.drain_complete().unwrap(), 1);
    }

    #[test]
    fn decode_failure_skips_and_continues() {
        let mut codec = MockFrameDecoder::new();
        codec
            .expect_decode_frame()
            .returning(|_| Err(ProtocolError::CodecFailure("bitstream damage".to_string())));

        let mut dec = DecoderDriver::new(Box::new(codec), Box::new(NullSink), LazyLevel::Display);
        dec.add_datagram(fragment(0, 0, 1));
        dec.add_datagram(fragment(1, 0, 1));
        assert_eq!(dec.drain_complete().unwrap(), 2);
        assert_eq!(dec.decode_failures(), 2);
    }

    #[test]
    fn inconsistent_fragment_is_dropped_not_fatal() {
        let mut dec = synthetic_driver(LazyLevel::Discard);
        dec.add_datagram(fragment(0, 0, 2));
        dec.add_datagram(fragment(0, 1, 3)); // disagrees on frag_cnt
        assert_eq!(dec.drain_complete().unwrap(), 0);
        assert_eq!(dec.pending_frames(), 1);
    }
}
