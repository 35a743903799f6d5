use bytes::Bytes;

use crate::protocol::{Datagram, FrameType};

/// Splits one compressed frame into MTU-sized datagrams.
///
/// Payloads are zero-copy slices of the compressed blob; `send_ts` stays 0
/// until the event loop stamps it at the moment of transmission.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    max_payload: usize,
    tile_id: Option<u16>,
}

impl Fragmenter {
    pub fn new(max_payload: usize, tile_id: Option<u16>) -> Fragmenter {
        assert!(max_payload > 0, "fragment payload size must be positive");
        Fragmenter {
            max_payload,
            tile_id,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Produces `ceil(len / max_payload)` fragments in ascending `frag_id`
    /// order; an empty frame still yields one zero-length fragment so the
    /// receiver can complete it.
    pub fn fragment(
        &self,
        frame_id: u32,
        frame_type: FrameType,
        frame_width: u16,
        frame_height: u16,
        compressed: Bytes,
    ) -> Vec<Datagram> {
        let frag_cnt = compressed.len().div_ceil(self.max_payload).max(1) as u16;

        (0..frag_cnt)
            .map(|frag_id| {
                let start = usize::from(frag_id) * self.max_payload;
                let end = (start + self.max_payload).min(compressed.len());
                Datagram {
                    frame_id,
                    frame_type,
                    tile_id: self.tile_id,
                    frag_id,
                    frag_cnt,
                    frame_width,
                    frame_height,
                    send_ts: 0,
                    payload: compressed.slice(start..end),
                }
            })
            .collect()
    }
}
