//! The receiver's event loop: acknowledge every arriving fragment, dispatch
//! it to the decoder for its resolution, and deliver completed frames in
//! order.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::decoder::DecoderDriver;
use crate::protocol::{Ack, Config, Datagram, Message, RateEstimate, WireFormat};
use crate::stats::{StatsSink, StatsSnapshot};

/// Bitrate ladder replayed by `--cycle`, a stand-in for an external
/// congestion controller.
const RATE_LADDER: [u32; 4] = [8000, 5000, 2500, 1000];

/// Final counters, returned on clean shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverReport {
    pub datagrams: u64,
    pub acks_sent: u64,
    pub frames_delivered: u64,
}

enum Event {
    DataReadable,
    RateTick,
    StatsTick,
    Deadline,
}

/// Builds a fresh decoder pipeline for a newly observed resolution.
pub type DecoderFactory = Box<dyn FnMut(u16, u16) -> DecoderDriver + Send>;

pub struct ReceiverLoop {
    data_sock: UdpSocket,
    ctrl_sock: UdpSocket,
    config: Config,
    decoders: FxHashMap<u16, DecoderDriver>,
    make_decoder: DecoderFactory,
    stream_time: Option<Duration>,
    cycle_rates: bool,
    stats: StatsSink,

    datagrams: u64,
    acks_sent: u64,
}

impl ReceiverLoop {
    /// Both sockets must be connected to the sender's data and control ports.
    pub fn new(
        data_sock: UdpSocket,
        ctrl_sock: UdpSocket,
        config: Config,
        make_decoder: DecoderFactory,
        stream_time: Option<Duration>,
        cycle_rates: bool,
        stats: StatsSink,
    ) -> ReceiverLoop {
        ReceiverLoop {
            data_sock,
            ctrl_sock,
            config,
            decoders: FxHashMap::default(),
            make_decoder,
            stream_time,
            cycle_rates,
            stats,
            datagrams: 0,
            acks_sent: 0,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<ReceiverReport> {
        // open the session: one CONFIG on each socket pins us as the
        // sender's peer for both channels
        let hello = Message::Config(self.config).encode();
        self.data_sock.send(&hello).await?;
        self.ctrl_sock.send(&hello).await?;
        info!(
            width = self.config.width,
            height = self.config.height,
            fps = self.config.frame_rate,
            target_kbps = self.config.target_bitrate,
            "session opened"
        );

        let deadline = self.stream_time.map(|d| time::Instant::now() + d);
        let mut rate_timer = time::interval(Duration::from_secs(5));
        rate_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        rate_timer.tick().await; // the immediate first tick
        let mut ladder_idx = 0usize;

        let mut stats_timer = time::interval(Duration::from_secs(1));
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                r = self.data_sock.readable() => { r?; Event::DataReadable }
                _ = rate_timer.tick(), if self.cycle_rates => Event::RateTick,
                _ = stats_timer.tick() => Event::StatsTick,
                _ = time::sleep_until(deadline.unwrap_or_else(time::Instant::now)), if deadline.is_some() => Event::Deadline,
            };

            match event {
                Event::DataReadable => self.on_data_readable()?,
                Event::RateTick => {
                    let estimate = RateEstimate {
                        target_bitrate: RATE_LADDER[ladder_idx % RATE_LADDER.len()],
                    };
                    ladder_idx += 1;
                    info!(kbps = estimate.target_bitrate, "advertising rate estimate");
                    match self.ctrl_sock.try_send(&Message::RateEstimate(estimate).encode()) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            debug!("control socket busy, rate estimate dropped")
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Event::StatsTick => {
                    let report = self.report();
                    self.stats.record(&StatsSnapshot {
                        frames: report.frames_delivered,
                        frags_sent: report.datagrams,
                        retransmissions: 0,
                        acks: report.acks_sent,
                        srtt_us: None,
                        target_kbps: self.config.target_bitrate,
                    });
                }
                Event::Deadline => {
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
                        match Datagram::decode(Bytes::copy_from_slice(&buf[..n]), WireFormat::Plain)
                        {
                            Ok(datagram) => datagram,
                            Err(e) => {
                                debug!("malformed datagram, dropping: {e}");
                                continue;
                            }
                        };
                    self.datagrams += 1;

                    // acknowledge before anything else; the ACK echoes the
                    // send_ts the sender stamped
                    let ack = Message::Ack(Ack::for_datagram(&datagram)).encode();
                    match self.data_sock.try_send(&ack) {
                        Ok(_) => self.acks_sent += 1,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            debug!("data socket busy, ACK dropped")
                        }
                        Err(e) => return Err(e.into()),
                    }
                    trace!(
                        frame_id = datagram.frame_id,
                        frag_id = datagram.frag_id,
                        width = datagram.frame_width,
                        "acked datagram"
                    );

                    // dispatch on resolution; a new width gets its own decoder
                    let (width, height) = (datagram.frame_width, datagram.frame_height);
                    let make_decoder = &mut self.make_decoder;
                    let decoder = self
                        .decoders
                        .entry(width)
                        .or_insert_with(|| make_decoder(width, height));
                    decoder.add_datagram(datagram);
                    decoder.drain_complete()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn report(&self) -> ReceiverReport {
        ReceiverReport {
            datagrams: self.datagrams,
            acks_sent: self.acks_sent,
            frames_delivered: self.decoders.values().map(|d| d.frames_delivered()).sum(),
        }
    }
}
