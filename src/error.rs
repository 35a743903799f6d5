use std::io;

/// Everything that can go wrong between reading a raw frame and presenting it
/// on the far side. Wire-level problems (`Malformed`, `Inconsistent`) are
/// recoverable per datagram; the callers drop the offending input and move on.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed wire data: {0}")]
    Malformed(&'static str),

    /// A fragment asserted a different fragment count than the one recorded
    /// when its frame was first seen. The frame is poisoned and will be
    /// purged when the delivery cursor advances past it.
    #[error("fragment of frame {frame_id} claims frag_cnt {claimed}, frame was announced with {expected}")]
    Inconsistent {
        frame_id: u32,
        expected: u16,
        claimed: u16,
    },

    #[error("MTU {0} is outside the supported range of 512..=1500 bytes")]
    BadMtu(usize),

    #[error("{rows}x{cols} tiling does not divide a {width}x{height} frame into whole even-sized tiles")]
    BadGeometry {
        width: u16,
        height: u16,
        rows: u16,
        cols: u16,
    },

    #[error("socket error")]
    Io(#[from] io::Error),

    #[error("codec failure: {0}")]
    CodecFailure(String),

    #[error("raw video input exhausted")]
    EndOfInput,
}
