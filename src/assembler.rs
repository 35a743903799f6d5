//! Receiver-side reassembly of fragments into frames, delivered strictly in
//! `frame_id` order.
//!
//! The cursor `next_frame_id` names the lowest undelivered frame; everything
//! below it is gone. An incomplete frame never stalls the stream forever:
//! a key frame arriving above the cursor discards the incomplete prefix,
//! since by the codec contract it references nothing before itself.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::protocol::{Datagram, FrameType};

/// A fully reassembled compressed frame, ready for the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub frame_id: u32,
    pub frame_type: FrameType,
    pub frame_width: u16,
    pub frame_height: u16,
    pub data: Bytes,
}

#[derive(Debug)]
struct PendingFrame {
    frame_type: FrameType,
    frame_width: u16,
    frame_height: u16,
    frag_cnt: u16,
    received: u16,
    slots: Vec<Option<Bytes>>,
}

impl PendingFrame {
    fn new(datagram: &Datagram) -> PendingFrame {
        PendingFrame {
            frame_type: datagram.frame_type,
            frame_width: datagram.frame_width,
            frame_height: datagram.frame_height,
            frag_cnt: datagram.frag_cnt,
            received: 0,
            slots: vec![None; usize::from(datagram.frag_cnt)],
        }
    }

    fn complete(&self) -> bool {
        self.frag_cnt > 0 && self.received == self.frag_cnt
    }
}

#[derive(Debug)]
pub struct FrameAssembler {
    frames: BTreeMap<u32, PendingFrame>,
    next_frame_id: u32,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler {
            frames: BTreeMap::new(),
            next_frame_id: 0,
        }
    }

    pub fn next_frame_id(&self) -> u32 {
        self.next_frame_id
    }

    /// Inserts one fragment.
    ///
    /// Fragments below the cursor are dropped silently (late arrivals for
    /// frames already delivered or purged). Duplicates are ignored. A
    /// fragment disagreeing with the fragment count recorded for its frame
    /// is rejected as [`ProtocolError::Inconsistent`].
    pub fn add(&mut self, datagram: Datagram) -> Result<(), ProtocolError> {
        if datagram.frame_id < self.next_frame_id {
            trace!(
                frame_id = datagram.frame_id,
                next_frame_id = self.next_frame_id,
                "fragment below delivery cursor, dropping"
            );
            return Ok(());
        }
        if datagram.frag_cnt == 0 {
            return Err(ProtocolError::Malformed("datagram with zero frag_cnt"));
        }
        if datagram.frag_id >= datagram.frag_cnt {
            return Err(ProtocolError::Malformed("frag_id out of range"));
        }

        // Stale-frame purge: a key frame above the cursor obsoletes the
        // incomplete prefix below it.
        if datagram.frame_type == FrameType::Key && datagram.frame_id > self.next_frame_id {
            let discarded = {
                let kept = self.frames.split_off(&datagram.frame_id);
                std::mem::replace(&mut self.frames, kept).len()
            };
            if discarded > 0 {
                debug!(
                    discarded,
                    key_frame_id = datagram.frame_id,
                    "key frame advanced the delivery cursor past incomplete frames"
                );
            }
            self.next_frame_id = datagram.frame_id;
        }

        let frame = self
            .frames
            .entry(datagram.frame_id)
            .or_insert_with(|| PendingFrame::new(&datagram));

        if frame.frag_cnt != datagram.frag_cnt {
            return Err(ProtocolError::Inconsistent {
                frame_id: datagram.frame_id,
                expected: frame.frag_cnt,
                claimed: datagram.frag_cnt,
            });
        }

        let slot = &mut frame.slots[usize::from(datagram.frag_id)];
        if slot.is_some() {
            trace!(
                frame_id = datagram.frame_id,
                frag_id = datagram.frag_id,
                "duplicate fragment, ignoring"
            );
            return Ok(());
        }
        *slot = Some(datagram.payload);
        frame.received += 1;
        Ok(())
    }

    /// True iff the frame at the cursor has all of its fragments.
    pub fn next_frame_complete(&self) -> bool {
        self.frames
            .get(&self.next_frame_id)
            .is_some_and(|f| f.complete())
    }

    /// Concatenates the cursor frame's payloads in `frag_id` order, removes
    /// its record and advances the cursor. `None` while the frame at the
    /// cursor is incomplete.
    pub fn consume_next_frame(&mut self) -> Option<AssembledFrame> {
        if !self.next_frame_complete() {
            return None;
        }
        let frame_id = self.next_frame_id;
        let frame = self.frames.remove(&frame_id).expect("checked complete");
        self.next_frame_id += 1;

        let total: usize = frame
            .slots
            .iter()
            .map(|s| s.as_ref().map_or(0, Bytes::len))
            .sum();
        let mut data = BytesMut::with_capacity(total);
        for slot in frame.slots {
            data.extend_from_slice(&slot.expect("complete frame has every slot"));
        }

        Some(AssembledFrame {
            frame_id,
            frame_type: frame.frame_type,
            frame_width: frame.frame_width,
            frame_height: frame.frame_height,
            data: data.freeze(),
        })
    }

    /// Number of frames currently buffered (for stats).
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> FrameAssembler {
        FrameAssembler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn fragment(frame_id: u32, frag_id: u16, frag_cnt: u16, payload: &'static [u8]) -> Datagram {
        typed_fragment(frame_id, FrameType::NonKey, frag_id, frag_cnt, payload)
    }

    fn typed_fragment(
        frame_id: u32,
        frame_type: FrameType,
        frag_id: u16,
        frag_cnt: u16,
        payload: &'static [u8],
    ) -> Datagram {
        Datagram {
            frame_id,
            frame_type,
            tile_id: None,
            frag_id,
            frag_cnt,
            frame_width: 640,
            frame_height: 480,
            send_ts: 0,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn single_fragment_frame_completes() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 0, 1, b"whole")).unwrap();

        assert!(asm.next_frame_complete());
        let frame = asm.consume_next_frame().unwrap();
        assert_eq!(frame.frame_id, 0);
        assert_eq!(&frame.data[..], b"whole");
        assert_eq!(asm.next_frame_id(), 1);
    }

    #[test]
    fn out_of_order_fragments_reassemble_in_frag_order() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 2, 3, b"cc")).unwrap();
        asm.add(fragment(0, 0, 3, b"aa")).unwrap();
        assert!(!asm.next_frame_complete());
        asm.add(fragment(0, 1, 3, b"bb")).unwrap();

        let frame = asm.consume_next_frame().unwrap();
        assert_eq!(&frame.data[..], b"aabbcc");
    }

    #[test]
    fn delivery_order_is_strictly_ascending() {
        let mut asm = FrameAssembler::new();
        // frame 1 arrives entirely before frame 0
        asm.add(fragment(1, 0, 1, b"one")).unwrap();
        asm.add(fragment(0, 0, 1, b"zero")).unwrap();

        let mut delivered = Vec::new();
        while let Some(frame) = asm.consume_next_frame() {
            delivered.push(frame.frame_id);
        }
        assert_eq!(delivered, vec![0, 1]);
    }

    #[test]
    fn fragment_below_cursor_is_dropped_silently() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 0, 1, b"zero")).unwrap();
        asm.consume_next_frame().unwrap();

        asm.add(fragment(0, 0, 1, b"late")).unwrap();
        assert_eq!(asm.pending_frames(), 0);
        assert!(!asm.next_frame_complete());
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 0, 2, b"aa")).unwrap();
        asm.add(fragment(0, 0, 2, b"aa")).unwrap();
        assert!(!asm.next_frame_complete());

        asm.add(fragment(0, 1, 2, b"bb")).unwrap();
        assert_eq!(&asm.consume_next_frame().unwrap().data[..], b"aabb");
    }

    #[test]
    fn inconsistent_frag_cnt_is_rejected() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(5, 0, 3, b"aa")).unwrap();

        assert_matches!(
            asm.add(fragment(5, 1, 4, b"bb")),
            Err(ProtocolError::Inconsistent {
                frame_id: 5,
                expected: 3,
                claimed: 4
            })
        );
        // the offending fragment was discarded, the frame record survives
        assert_eq!(asm.pending_frames(), 1);
    }

    #[test]
    fn zero_frag_cnt_and_out_of_range_frag_id_are_malformed() {
        let mut asm = FrameAssembler::new();
        assert_matches!(
            asm.add(fragment(0, 0, 0, b"")),
            Err(ProtocolError::Malformed(_))
        );
        assert_matches!(
            asm.add(fragment(0, 3, 3, b"x")),
            Err(ProtocolError::Malformed(_))
        );
    }

    #[test]
    fn key_frame_purges_incomplete_prefix() {
        // frames 0 and 2 complete, frame 1 loses all of its fragments
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 0, 1, b"zero")).unwrap();
        assert_eq!(asm.consume_next_frame().unwrap().frame_id, 0);

        asm.add(typed_fragment(2, FrameType::Key, 0, 2, b"ke")).unwrap();
        asm.add(typed_fragment(2, FrameType::Key, 1, 2, b"y!")).unwrap();

        assert_eq!(asm.next_frame_id(), 2);
        let frame = asm.consume_next_frame().unwrap();
        assert_eq!(frame.frame_id, 2);
        assert_eq!(&frame.data[..], b"key!");
        assert_eq!(asm.next_frame_id(), 3);
    }

    #[test]
    fn key_frame_purges_partially_received_frames() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 0, 2, b"half")).unwrap();
        asm.add(fragment(1, 0, 2, b"half")).unwrap();

        asm.add(typed_fragment(3, FrameType::Key, 0, 1, b"key")).unwrap();
        assert_eq!(asm.next_frame_id(), 3);
        assert_eq!(asm.pending_frames(), 1);

        // late fragments of the purged frames are now below the cursor
        asm.add(fragment(0, 1, 2, b"half")).unwrap();
        assert_eq!(asm.pending_frames(), 1);

        assert_eq!(asm.consume_next_frame().unwrap().frame_id, 3);
    }

    #[test]
    fn non_key_frame_does_not_purge() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 0, 2, b"half")).unwrap();
        asm.add(fragment(4, 0, 1, b"later")).unwrap();
        assert_eq!(asm.next_frame_id(), 0);
        assert_eq!(asm.pending_frames(), 2);
    }

    #[test]
    fn empty_payload_fragment_completes_a_frame() {
        let mut asm = FrameAssembler::new();
        asm.add(fragment(0, 0, 1, b"")).unwrap();
        let frame = asm.consume_next_frame().unwrap();
        assert!(frame.data.is_empty());
    }
}
