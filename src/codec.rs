//! The seam to the external block codec. The real encoder/decoder (libvpx or
//! similar) lives outside this crate; everything here talks to it through
//! these traits.
//!
//! [`SyntheticCodec`] is a deterministic stand-in that produces opaque
//! payloads sized from the target bitrate, which is all the transport needs
//! to be exercised end to end.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::image::RawImage;

/// One compressed frame as the codec hands it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub keyframe: bool,
}

#[cfg_attr(test, mockall::automock)]
pub trait FrameEncoder: Send {
    /// Applies to the next `encode_frame` call; may also hint the codec
    /// mid-GoP.
    fn set_target_bitrate(&mut self, kbps: u32);

    fn encode_frame(&mut self, frame: &RawImage) -> Result<EncodedFrame, ProtocolError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait FrameDecoder: Send {
    fn decode_frame(&mut self, data: &[u8]) -> Result<RawImage, ProtocolError>;
}

/// Bitrate assumed when the peer requests 0 kbps (meaning "no preference").
const FALLBACK_KBPS: u32 = 500;

/// Deterministic pattern codec: frame size follows the target bitrate at the
/// configured frame rate, one key frame per GoP (key frames cost double).
#[derive(Debug, Clone)]
pub struct SyntheticCodec {
    width: u16,
    height: u16,
    frame_rate: u16,
    target_kbps: u32,
    gop: u32,
    frames_encoded: u32,
}

impl SyntheticCodec {
    pub const DEFAULT_GOP: u32 = 30;

    pub fn new(width: u16, height: u16, frame_rate: u16, target_kbps: u32) -> SyntheticCodec {
        SyntheticCodec {
            width,
            height,
            frame_rate: frame_rate.max(1),
            target_kbps,
            gop: Self::DEFAULT_GOP,
            frames_encoded: 0,
        }
    }

    fn bytes_per_frame(&self, keyframe: bool) -> usize {
        let kbps = if self.target_kbps == 0 {
            FALLBACK_KBPS
        } else {
            self.target_kbps
        };
        let base = (kbps as usize * 1000 / 8) / usize::from(self.frame_rate);
        let len = if keyframe { base * 2 } else { base };
        len.max(1)
    }
}

impl FrameEncoder for SyntheticCodec {
    fn set_target_bitrate(&mut self, kbps: u32) {
        self.target_kbps = kbps;
    }

    fn encode_frame(&mut self, _frame: &RawImage) -> Result<EncodedFrame, ProtocolError> {
        let keyframe = self.frames_encoded % self.gop == 0;
        let len = self.bytes_per_frame(keyframe);
        let seed = self.frames_encoded;
        let data: Vec<u8> = (0..len)
            .map(|i| (seed as usize).wrapping_add(i).wrapping_mul(31) as u8)
            .collect();
        self.frames_encoded += 1;
        Ok(EncodedFrame {
            data: Bytes::from(data),
            keyframe,
        })
    }
}

impl FrameDecoder for SyntheticCodec {
    fn decode_frame(&mut self, data: &[u8]) -> Result<RawImage, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::CodecFailure(
                "empty compressed frame".to_string(),
            ));
        }
        // the synthetic stream carries no picture data; hand back a blank
        // frame of the negotiated size
        Ok(RawImage::new(self.width, self.height))
    }
}
