//! Tiled operation: the frame is split into an `R x C` grid, every tile is
//! compressed by its own encoder with its own transport state, and all tiles
//! share the data socket.
//!
//! The per-tick fan-out runs on tokio's persistent blocking pool, one task
//! per tile, each owning its encoder for the duration of the tick, and joins
//! before write interest is armed, so no encoder is ever entered twice
//! concurrently and nothing is written while workers run.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::assembler::FrameAssembler;
use crate::clock::Clock;
use crate::codec::FrameDecoder;
use crate::decoder::{FrameSink, LazyLevel};
use crate::encoder::EncoderDriver;
use crate::error::ProtocolError;
use crate::image::{crop_tile, merge_tile, RawImage, TileGeometry};
use crate::protocol::{Ack, Config, Datagram, Message, WireFormat};
use crate::stats::{StatsSink, StatsSnapshot};
use crate::y4m::FrameSource;

/// Reads `size` raw frames up front; the tick handler then cycles through
/// them, so a short input file can pace an arbitrarily long run.
pub fn prefill_ring(
    source: &mut dyn FrameSource,
    width: u16,
    height: u16,
    size: usize,
) -> anyhow::Result<Vec<Arc<RawImage>>> {
    anyhow::ensure!(size > 0, "raw frame ring must hold at least one frame");
    let mut ring = Vec::with_capacity(size);
    for i in 0..size {
        let mut raw = RawImage::new(width, height);
        source
            .read_frame(&mut raw)
            .with_context(|| format!("filling the raw frame ring ({i}/{size} frames read)"))?;
        ring.push(Arc::new(raw));
        if (i + 1) % 30 == 0 {
            info!(filled = i + 1, size, "raw frame ring filling");
        }
    }
    Ok(ring)
}

/// One frame tick's fork-join: crops and compresses all tiles in parallel,
/// returning only once every tile encoder has produced its output.
pub async fn encode_tiles(
    encoders: &mut [Option<EncoderDriver>],
    frame: &Arc<RawImage>,
    geo: &TileGeometry,
    clock: &Clock,
) -> anyhow::Result<()> {
    let mut join = JoinSet::new();
    for row in 0..geo.rows {
        for col in 0..geo.cols {
            let idx = geo.tile_index(row, col);
            let mut encoder = encoders[idx].take().expect("tile encoder present in grid");
            let frame = Arc::clone(frame);
            let geo = *geo;
            let clock = *clock;
            join.spawn_blocking(move || {
                let tile = crop_tile(&frame, &geo, row, col);
                let result = encoder.compress_frame(&tile, &clock);
                (idx, encoder, result)
            });
        }
    }

    while let Some(joined) = join.join_next().await {
        let (idx, encoder, result) = joined.context("tile encoder task failed")?;
        encoders[idx] = Some(encoder);
        result?;
    }
    Ok(())
}

enum SenderEvent {
    FrameTick,
    StatsTick,
    DataReadable,
    CtrlReadable,
    DataWritable,
}

pub struct TileSenderLoop {
    data_sock: UdpSocket,
    ctrl_sock: UdpSocket,
    geo: TileGeometry,
    encoders: Vec<Option<EncoderDriver>>,
    ring: Vec<Arc<RawImage>>,
    ring_idx: usize,
    clock: Clock,
    stats: StatsSink,
    frame_interval: Duration,
    want_write: bool,
}

impl TileSenderLoop {
    pub fn new(
        data_sock: UdpSocket,
        ctrl_sock: UdpSocket,
        geo: TileGeometry,
        encoders: Vec<EncoderDriver>,
        ring: Vec<Arc<RawImage>>,
        frame_rate: u16,
        stats: StatsSink,
    ) -> TileSenderLoop {
        assert_eq!(encoders.len(), geo.tile_count());
        TileSenderLoop {
            data_sock,
            ctrl_sock,
            geo,
            encoders: encoders.into_iter().map(Some).collect(),
            ring,
            ring_idx: 0,
            clock: Clock::new(),
            stats,
            frame_interval: Duration::from_micros(1_000_000 / u64::from(frame_rate.max(1))),
            want_write: false,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<StatsSnapshot> {
        let mut fps_timer = time::interval(self.frame_interval);
        fps_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_timer = time::interval(Duration::from_secs(1));
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = time::Instant::now();
        let mut frames_consumed: u64 = 0;

        loop {
            let event = tokio::select! {
                _ = fps_timer.tick() => SenderEvent::FrameTick,
                _ = stats_timer.tick() => SenderEvent::StatsTick,
                r = self.data_sock.readable() => { r?; SenderEvent::DataReadable }
                r = self.ctrl_sock.readable() => { r?; SenderEvent::CtrlReadable }
                r = self.data_sock.writable(), if self.want_write => { r?; SenderEvent::DataWritable }
            };

            match event {
                SenderEvent::FrameTick => {
                    self.on_frame_tick(started, &mut frames_consumed).await?
                }
                SenderEvent::StatsTick => {
                    let snapshot = self.aggregate_snapshot();
                    self.stats.record(&snapshot);
                }
                SenderEvent::DataReadable => self.on_data_readable()?,
                SenderEvent::CtrlReadable => self.on_ctrl_readable()?,
                SenderEvent::DataWritable => self.on_data_writable()?,
            }
        }
    }

    async fn on_frame_tick(
        &mut self,
        started: time::Instant,
        frames_consumed: &mut u64,
    ) -> anyhow::Result<()> {
        let interval_us = self.frame_interval.as_micros() as u64;
        let expected = started.elapsed().as_micros() as u64 / interval_us + 1;
        let due = expected.saturating_sub(*frames_consumed).max(1);
        if due > 1 {
            warn!(skipped = due - 1, "frame timer fell behind, skipping buffered frames");
        }
        self.ring_idx = (self.ring_idx + due as usize) % self.ring.len();
        *frames_consumed = expected;

        let frame = Arc::clone(&self.ring[self.ring_idx]);
        encode_tiles(&mut self.encoders, &frame, &self.geo, &self.clock).await?;

        for encoder in self.encoders.iter_mut().flatten() {
            encoder.tick_maintenance(&self.clock);
        }
        if self.has_pending() {
            self.want_write = true;
        }
        Ok(())
    }

    fn on_data_readable(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 2048];
        loop {
            match self.data_sock.try_recv(&mut buf) {
                Ok(n) => match Message::decode(&buf[..n]) {
                    Ok(Message::Ack(ack)) => self.route_ack(&ack),
                    Ok(other) => debug!(?other, "unexpected message on data socket, dropping"),
                    Err(e) => debug!("malformed message on data socket, dropping: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if self.has_pending() {
            self.want_write = true;
        }
        Ok(())
    }

    /// The wire ACK carries no tile id, so route by fragment identity plus
    /// the echoed send timestamp, falling back to fragment identity alone.
    fn route_ack(&mut self, ack: &Ack) {
        let seq = (ack.frame_id, ack.frag_id);
        let tile = self
            .encoders
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.owns_ack_exactly(ack)))
            .or_else(|| {
                self.encoders
                    .iter()
                    .position(|e| e.as_ref().is_some_and(|e| e.owns_seq(seq)))
            });

        match tile {
            Some(idx) => {
                trace!(
                    frame_id = ack.frame_id,
                    frag_id = ack.frag_id,
                    tile = idx,
                    "received ACK"
                );
                if let Some(encoder) = &mut self.encoders[idx] {
                    encoder.handle_ack(ack, &self.clock);
                }
            }
            None => trace!(
                frame_id = ack.frame_id,
                frag_id = ack.frag_id,
                "ACK matches no tile, ignoring"
            ),
        }
    }

    fn on_ctrl_readable(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 2048];
        loop {
            match self.ctrl_sock.try_recv(&mut buf) {
                Ok(n) => match Message::decode(&buf[..n]) {
                    Ok(Message::RateEstimate(est)) => {
                        info!(kbps = est.target_bitrate, "received rate estimate, re-targeting all tiles");
                        for encoder in self.encoders.iter_mut().flatten() {
                            encoder.set_target_bitrate(est.target_bitrate);
                        }
                    }
                    Ok(other) => debug!(?other, "non-RATE_ESTIMATE message on control socket, dropping"),
                    Err(e) => debug!("malformed message on control socket, dropping: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// All tiles drain to the one socket from this single task, which is the
    /// write serialisation the shared socket needs.
    fn on_data_writable(&mut self) -> anyhow::Result<()> {
        for encoder in self.encoders.iter_mut().flatten() {
            while let Some(mut record) = encoder.next_sendable(&self.clock) {
                let send_ts = self.clock.now_us();
                record.datagram.send_ts = send_ts;
                let wire = record.datagram.encode();

                match self.data_sock.try_send(&wire) {
                    Ok(_) => encoder.on_sent(record, send_ts),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        encoder.on_send_blocked(record);
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for encoder in self.encoders.iter_mut().flatten() {
            encoder.tick_maintenance(&self.clock);
        }
        self.want_write = self.has_pending();
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.encoders
            .iter()
            .flatten()
            .any(EncoderDriver::has_pending)
    }

    fn aggregate_snapshot(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for encoder in self.encoders.iter().flatten() {
            let snap = encoder.snapshot();
            total.frames += snap.frames;
            total.frags_sent += snap.frags_sent;
            total.retransmissions += snap.retransmissions;
            total.acks += snap.acks;
            total.srtt_us = total.srtt_us.max(snap.srtt_us);
            total.target_kbps = snap.target_kbps;
        }
        // frames is per-tile; report whole-frame ticks
        total.frames /= self.geo.tile_count() as u64;
        total
    }
}

/// Collects decoded tiles per frame until all `R x C` have arrived, then
/// merges them into the full picture. Entries at or below an emitted frame
/// are gone; a bounded depth keeps one dead tile from pinning memory.
pub struct TileMerger {
    geo: TileGeometry,
    pending: BTreeMap<u32, Vec<Option<RawImage>>>,
    emitted_up_to: Option<u32>,
}

const MAX_PENDING_MERGES: usize = 8;

impl TileMerger {
    pub fn new(geo: TileGeometry) -> TileMerger {
        TileMerger {
            geo,
            pending: BTreeMap::new(),
            emitted_up_to: None,
        }
    }

    pub fn add_tile(
        &mut self,
        frame_id: u32,
        tile_idx: usize,
        tile: RawImage,
    ) -> Option<(u32, RawImage)> {
        if self.emitted_up_to.is_some_and(|e| frame_id <= e) {
            trace!(frame_id, tile_idx, "tile for an already emitted frame, dropping");
            return None;
        }

        let slots = self
            .pending
            .entry(frame_id)
            .or_insert_with(|| vec![None; self.geo.tile_count()]);
        slots[tile_idx] = Some(tile);

        if slots.iter().all(Option::is_some) {
            let slots = self.pending.remove(&frame_id).expect("entry just filled");
            let mut frame = RawImage::new(self.geo.frame_width, self.geo.frame_height);
            for row in 0..self.geo.rows {
                for col in 0..self.geo.cols {
                    let tile = slots[self.geo.tile_index(row, col)]
                        .as_ref()
                        .expect("all slots filled");
                    merge_tile(&mut frame, tile, &self.geo, row, col);
                }
            }

            // everything older can never complete ahead of the emitted frame
            self.pending = self.pending.split_off(&frame_id);
            self.emitted_up_to = Some(frame_id);
            return Some((frame_id, frame));
        }

        while self.pending.len() > MAX_PENDING_MERGES {
            if let Some((dropped_id, _)) = self.pending.pop_first() {
                debug!(frame_id = dropped_id, "merge buffer full, dropping stale partial frame");
            }
        }
        None
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }
}

enum ReceiverEvent {
    DataReadable,
    StatsTick,
    Deadline,
}

pub struct TileReceiverLoop {
    data_sock: UdpSocket,
    ctrl_sock: UdpSocket,
    config: Config,
    geo: TileGeometry,
    assemblers: Vec<FrameAssembler>,
    decoders: Vec<Box<dyn FrameDecoder>>,
    merger: TileMerger,
    sink: Box<dyn FrameSink>,
    lazy: LazyLevel,
    stream_time: Option<Duration>,
    stats: StatsSink,

    datagrams: u64,
    acks_sent: u64,
    frames_merged: u64,
    decode_failures: u64,
}

/// Final counters, returned on clean shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileReceiverReport {
    pub datagrams: u64,
    pub acks_sent: u64,
    pub frames_merged: u64,
    pub decode_failures: u64,
}

impl TileReceiverLoop {
    pub fn new(
        data_sock: UdpSocket,
        ctrl_sock: UdpSocket,
        config: Config,
        geo: TileGeometry,
        decoders: Vec<Box<dyn FrameDecoder>>,
        sink: Box<dyn FrameSink>,
        lazy: LazyLevel,
        stream_time: Option<Duration>,
        stats: StatsSink,
    ) -> TileReceiverLoop {
        assert_eq!(decoders.len(), geo.tile_count());
        TileReceiverLoop {
            data_sock,
            ctrl_sock,
            config,
            geo,
            assemblers: (0..geo.tile_count()).map(|_| FrameAssembler::new()).collect(),
            decoders,
            merger: TileMerger::new(geo),
            sink,
            lazy,
            stream_time,
            stats,
            datagrams: 0,
            acks_sent: 0,
            frames_merged: 0,
            decode_failures: 0,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<TileReceiverReport> {
        let hello = Message::Config(self.config).encode();
        self.data_sock.send(&hello).await?;
        self.ctrl_sock.send(&hello).await?;
        info!(
            width = self.config.width,
            height = self.config.height,
            rows = self.geo.rows,
            cols = self.geo.cols,
            "tiled session opened"
        );

        let deadline = self.stream_time.map(|d| time::Instant::now() + d);
        let mut stats_timer = time::interval(Duration::from_secs(1));
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                r = self.data_sock.readable() => { r?; ReceiverEvent::DataReadable }
                _ = stats_timer.tick() => ReceiverEvent::StatsTick,
                _ = time::sleep_until(deadline.unwrap_or_else(time::Instant::now)), if deadline.is_some() => ReceiverEvent::Deadline,
            };

            match event {
                ReceiverEvent::DataReadable => self.on_data_readable()?,
                ReceiverEvent::StatsTick => {
                    self.stats.record(&StatsSnapshot {
                        frames: self.frames_merged,
                        frags_sent: self.datagrams,
                        retransmissions: 0,
                        acks: self.acks_sent,
                        srtt_us: None,
                        target_kbps: self.config.target_bitrate,
                    });
                }
                ReceiverEvent::Deadline => {
                    info!("streaming time is up");
                    return Ok(self.report());
                }
            }
        }
    }

    fn on_data_readable(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 2048];
        loop {
            match self.data_sock.try_recv(&mut buf) {
                Ok(n) => {
                    let datagram =
                        match Datagram::decode(Bytes::copy_from_slice(&buf[..n]), WireFormat::Tiled)
                        {
                            Ok(datagram) => datagram,
                            Err(e) => {
                                debug!("malformed datagram, dropping: {e}");
                                continue;
                            }
                        };
                    self.datagrams += 1;

                    let ack = Message::Ack(Ack::for_datagram(&datagram)).encode();
                    match self.data_sock.try_send(&ack) {
                        Ok(_) => self.acks_sent += 1,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            debug!("data socket busy, ACK dropped")
                        }
                        Err(e) => return Err(e.into()),
                    }

                    self.dispatch(datagram)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, datagram: Datagram) -> anyhow::Result<()> {
        let tile_idx = usize::from(datagram.tile_id.expect("tiled wire format has a tile id"));
        if tile_idx >= self.geo.tile_count() {
            debug!(tile_idx, "tile id out of range, dropping");
            return Ok(());
        }

        let assembler = &mut self.assemblers[tile_idx];
        match assembler.add(datagram) {
            Ok(()) => {}
            Err(e @ ProtocolError::Inconsistent { .. }) => warn!("discarding fragment: {e}"),
            Err(e) => debug!("discarding fragment: {e}"),
        }

        while let Some(tile_frame) = self.assemblers[tile_idx].consume_next_frame() {
            if self.lazy == LazyLevel::Discard {
                // count a whole frame once all tiles passed this point
                self.frames_merged += u64::from(
                    self.assemblers
                        .iter()
                        .all(|a| a.next_frame_id() > tile_frame.frame_id),
                );
                continue;
            }

            let decoded = match self.decoders[tile_idx].decode_frame(&tile_frame.data) {
                Ok(decoded) => decoded,
                Err(ProtocolError::CodecFailure(reason)) => {
                    warn!(
                        frame_id = tile_frame.frame_id,
                        tile_idx, %reason, "tile decode failed, skipping"
                    );
                    self.decode_failures += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some((frame_id, frame)) = self.merger.add_tile(tile_frame.frame_id, tile_idx, decoded)
            {
                trace!(frame_id, "merged full frame");
                self.frames_merged += 1;
                if self.lazy == LazyLevel::Display {
                    self.sink.present(&frame)?;
                }
            }
        }
        Ok(())
    }

    fn report(&self) -> TileReceiverReport {
        TileReceiverReport {
            datagrams: self.datagrams,
            acks_sent: self.acks_sent,
            frames_merged: self.frames_merged,
            decode_failures: self.decode_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SyntheticCodec;
    use crate::config::TransportConfig;

    fn geometry() -> TileGeometry {
        TileGeometry::new(64, 64, 4, 4).unwrap()
    }

    fn tile_encoders(geo: &TileGeometry) -> Vec<Option<EncoderDriver>> {
        let config = TransportConfig::new(1500).unwrap();
        (0..geo.tile_count())
            .map(|idx| {
                let codec = SyntheticCodec::new(geo.tile_width, geo.tile_height, 30, 300);
                Some(EncoderDriver::new(
                    Box::new(codec),
                    &config,
                    Some(idx as u16),
                    geo.tile_width,
                    geo.tile_height,
                    30,
                    300,
                ))
            })
            .collect()
    }

    #[tokio::test]
    async fn frame_tick_joins_all_sixteen_tiles() {
        // one tick must produce compressed output for every tile before
        // the call returns
        let geo = geometry();
        let mut encoders = tile_encoders(&geo);
        let frame = Arc::new(RawImage::new(64, 64));
        let clock = Clock::new();

        encode_tiles(&mut encoders, &frame, &geo, &clock)
            .await
            .unwrap();

        assert_eq!(encoders.len(), 16);
        for encoder in &encoders {
            let encoder = encoder.as_ref().expect("every encoder returned to the grid");
            assert_eq!(encoder.snapshot().frames, 1);
            assert!(encoder.has_pending());
        }
    }

    #[tokio::test]
    async fn tile_fragments_carry_their_tile_id() {
        let geo = geometry();
        let mut encoders = tile_encoders(&geo);
        let frame = Arc::new(RawImage::new(64, 64));
        let clock = Clock::new();
        encode_tiles(&mut encoders, &frame, &geo, &clock)
            .await
            .unwrap();

        for (idx, encoder) in encoders.iter_mut().enumerate() {
            let encoder = encoder.as_mut().unwrap();
            let record = encoder.next_sendable(&clock).unwrap();
            assert_eq!(record.datagram.tile_id, Some(idx as u16));
            assert_eq!(record.datagram.wire_format(), WireFormat::Tiled);
        }
    }

    fn patterned_tile(geo: &TileGeometry, fill: u8) -> RawImage {
        let mut img = RawImage::new(geo.tile_width, geo.tile_height);
        img.y_mut().fill(fill);
        img
    }

    #[test]
    fn merger_emits_only_complete_frames() {
        let geo = TileGeometry::new(32, 32, 2, 2).unwrap();
        let mut merger = TileMerger::new(geo);

        for idx in 0..3 {
            assert!(merger.add_tile(0, idx, patterned_tile(&geo, idx as u8)).is_none());
        }
        let (frame_id, frame) = merger.add_tile(0, 3, patterned_tile(&geo, 3)).unwrap();
        assert_eq!(frame_id, 0);
        // top-left luma comes from tile 0, bottom-right from tile 3
        assert_eq!(frame.y()[0], 0);
        assert_eq!(frame.y()[frame.y().len() - 1], 3);
        assert_eq!(merger.pending_frames(), 0);
    }

    #[test]
    fn merger_drops_tiles_of_emitted_frames() {
        let geo = TileGeometry::new(32, 32, 2, 2).unwrap();
        let mut merger = TileMerger::new(geo);

        // frame 1 completes while frame 0 waits on a lost tile
        assert!(merger.add_tile(0, 0, patterned_tile(&geo, 9)).is_none());
        for idx in 0..3 {
            assert!(merger.add_tile(1, idx, patterned_tile(&geo, 1)).is_none());
        }
        assert!(merger.add_tile(1, 3, patterned_tile(&geo, 1)).is_some());

        // frame 0 is gone; its late tile cannot resurrect it
        assert_eq!(merger.pending_frames(), 0);
        assert!(merger.add_tile(0, 1, patterned_tile(&geo, 9)).is_none());
        assert_eq!(merger.pending_frames(), 0);
    }

    #[test]
    fn merger_depth_is_bounded() {
        let geo = TileGeometry::new(32, 32, 2, 2).unwrap();
        let mut merger = TileMerger::new(geo);

        for frame_id in 0..20u32 {
            merger.add_tile(frame_id, 0, patterned_tile(&geo, 0));
        }
        assert!(merger.pending_frames() <= MAX_PENDING_MERGES);
    }
}
