//! Sender-side driver: owns the codec, the fragmenter and the send-side
//! transport state for one stream (or one tile of one).
//!
//! The event loop calls in on three paths: the frame tick compresses and
//! enqueues, the writable path drains via `next_sendable`/`on_sent`, and the
//! readable path feeds ACKs through `handle_ack`.

use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::codec::FrameEncoder;
use crate::config::TransportConfig;
use crate::error::ProtocolError;
use crate::fragment::Fragmenter;
use crate::image::RawImage;
use crate::protocol::{Ack, FrameType, SeqNum, WireFormat};
use crate::rtt::RttEstimator;
use crate::send_buffer::{SendBuffer, SendRecord};
use crate::stats::{StatsSink, StatsSnapshot};

pub struct EncoderDriver {
    codec: Box<dyn FrameEncoder>,
    fragmenter: Fragmenter,
    buf: SendBuffer,
    rtt: RttEstimator,

    next_frame_id: u32,
    target_kbps: u32,
    frame_width: u16,
    frame_height: u16,

    giveup_us: u64,

    frames: u64,
    frags_sent: u64,
    retransmissions: u64,
    acks: u64,
    codec_failures: u64,
}

impl EncoderDriver {
    pub fn new(
        mut codec: Box<dyn FrameEncoder>,
        config: &TransportConfig,
        tile_id: Option<u16>,
        frame_width: u16,
        frame_height: u16,
        frame_rate: u16,
        target_kbps: u32,
    ) -> EncoderDriver {
        let format = if tile_id.is_some() {
            WireFormat::Tiled
        } else {
            WireFormat::Plain
        };
        let frame_interval_us = 1_000_000 / u64::from(frame_rate.max(1));
        codec.set_target_bitrate(target_kbps);

        EncoderDriver {
            codec,
            fragmenter: Fragmenter::new(config.max_payload(format), tile_id),
            buf: SendBuffer::new(),
            rtt: RttEstimator::new(
                config.rto_multiplier,
                config.rto_floor.as_micros() as u64,
            ),
            next_frame_id: 0,
            target_kbps,
            frame_width,
            frame_height,
            giveup_us: 2 * frame_interval_us * u64::from(config.giveup_window_frames),
            frames: 0,
            frags_sent: 0,
            retransmissions: 0,
            acks: 0,
            codec_failures: 0,
        }
    }

    /// Compresses one raw frame at the current target bitrate and enqueues
    /// its fragments. A codec failure skips the frame and the stream
    /// continues.
    pub fn compress_frame(&mut self, raw: &RawImage, clock: &Clock) -> Result<(), ProtocolError> {
        let encoded = match self.codec.encode_frame(raw) {
            Ok(encoded) => encoded,
            Err(ProtocolError::CodecFailure(reason)) => {
                warn!(frame_id = self.next_frame_id, %reason, "codec failed, skipping frame");
                self.codec_failures += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let frame_type = if encoded.keyframe {
            FrameType::Key
        } else {
            FrameType::NonKey
        };
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let fragments = self.fragmenter.fragment(
            frame_id,
            frame_type,
            self.frame_width,
            self.frame_height,
            encoded.data,
        );
        trace!(
            frame_id,
            frag_cnt = fragments.len(),
            keyframe = encoded.keyframe,
            "compressed and fragmented frame"
        );
        self.buf.enqueue_new(fragments, clock.now_us());
        self.frames += 1;
        Ok(())
    }

    /// Feeds one ACK through the unacked set and the RTT estimator, then
    /// scans for fragments whose RTO has since expired.
    pub fn handle_ack(&mut self, ack: &Ack, clock: &Clock) {
        let now = clock.now_us();
        if let Some(sample) = self.buf.ack(ack.frame_id, ack.frag_id, ack.send_ts, now) {
            self.rtt.on_sample(sample);
            self.acks += 1;
        }
        self.buf.scan_retransmits(now, self.rtt.rto_us());
    }

    /// Periodic upkeep on the frame tick: abandon overdue frames, requeue
    /// expired fragments.
    pub fn tick_maintenance(&mut self, clock: &Clock) {
        let now = clock.now_us();
        self.buf.give_up(now, self.giveup_us);
        self.buf.scan_retransmits(now, self.rtt.rto_us());
    }

    /// Applies to the next `compress_frame`.
    pub fn set_target_bitrate(&mut self, kbps: u32) {
        debug!(kbps, "re-targeting encoder bitrate");
        self.target_kbps = kbps;
        self.codec.set_target_bitrate(kbps);
    }

    // --- the event loop's drain interface -------------------------------

    pub fn next_sendable(&mut self, clock: &Clock) -> Option<SendRecord> {
        self.buf.pop_sendable(clock.now_us(), self.giveup_us)
    }

    pub fn on_sent(&mut self, record: SendRecord, send_ts: u64) {
        self.frags_sent += 1;
        if record.num_rtx > 0 {
            self.retransmissions += 1;
        }
        self.buf.mark_sent(record, send_ts);
    }

    pub fn on_send_blocked(&mut self, record: SendRecord) {
        self.buf.unsend(record);
    }

    pub fn has_pending(&self) -> bool {
        !self.buf.queue_is_empty()
    }

    // --- introspection ---------------------------------------------------

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames,
            frags_sent: self.frags_sent,
            retransmissions: self.retransmissions,
            acks: self.acks,
            srtt_us: self.rtt.srtt_us(),
            target_kbps: self.target_kbps,
        }
    }

    pub fn output_periodic_stats(&self, sink: &mut StatsSink) {
        sink.record(&self.snapshot());
    }

    pub fn target_bitrate(&self) -> u32 {
        self.target_kbps
    }

    pub fn srtt_us(&self) -> Option<u64> {
        self.rtt.srtt_us()
    }

    pub fn codec_failures(&self) -> u64 {
        self.codec_failures
    }

    pub fn unacked_len(&self) -> usize {
        self.buf.unacked_len()
    }

    pub fn unacked_contains(&self, seq: SeqNum) -> bool {
        self.buf.unacked_contains(seq)
    }

    pub fn num_rtx_of(&self, seq: SeqNum) -> Option<u32> {
        self.buf.num_rtx_of(seq)
    }

    /// True iff this driver has `(frame_id, frag_id)` in flight with exactly
    /// the echoed send timestamp. The tiled sender uses this to route ACKs,
    /// whose wire format carries no tile id, to the right tile.
    pub fn owns_ack_exactly(&self, ack: &Ack) -> bool {
        self.buf.last_send_ts_of((ack.frame_id, ack.frag_id)) == Some(ack.send_ts)
    }

    /// Weaker routing fallback: the fragment is in flight here, whatever its
    /// last send timestamp.
    pub fn owns_seq(&self, seq: SeqNum) -> bool {
        self.buf.unacked_contains(seq)
    }
}
