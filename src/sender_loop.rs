//! The sender's cooperative event loop: a single-threaded `select!` fan-in
//! over the frame timer, the stats timer and socket readiness. Every handler
//! runs to completion; a would-block on the data socket suspends the drain
//! and leaves the unsent fragment at the head of the queue.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::encoder::EncoderDriver;
use crate::error::ProtocolError;
use crate::image::RawImage;
use crate::protocol::{Config, Message};
use crate::stats::{StatsSink, StatsSnapshot};
use crate::y4m::FrameSource;

/// Binds the data socket on `port` and the control socket on `port + 1`.
/// With `port == 0` an adjacent free pair is picked (used by tests).
pub async fn bind_socket_pair(port: u16) -> anyhow::Result<(UdpSocket, UdpSocket)> {
    if port != 0 {
        let ctrl_port = port
            .checked_add(1)
            .context("data port must leave room for the control port")?;
        let data = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding data socket on port {port}"))?;
        let ctrl = UdpSocket::bind(("0.0.0.0", ctrl_port))
            .await
            .with_context(|| format!("binding control socket on port {ctrl_port}"))?;
        return Ok((data, ctrl));
    }

    for _ in 0..16 {
        let data = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let data_port = data.local_addr()?.port();
        if data_port == u16::MAX {
            continue;
        }
        if let Ok(ctrl) = UdpSocket::bind(("0.0.0.0", data_port + 1)).await {
            return Ok((data, ctrl));
        }
    }
    anyhow::bail!("could not find an adjacent free UDP port pair")
}

/// Blocks until a valid `CONFIG` arrives, returning its source address.
/// Everything else is dropped; the sender is not configured yet.
pub async fn wait_for_config(sock: &UdpSocket) -> anyhow::Result<(SocketAddr, Config)> {
    let mut buf = [0u8; 2048];
    loop {
        let (n, peer) = sock.recv_from(&mut buf).await?;
        match Message::decode(&buf[..n]) {
            Ok(Message::Config(config)) => return Ok((peer, config)),
            Ok(other) => debug!(?other, %peer, "ignoring non-CONFIG message while waiting for a receiver"),
            Err(e) => debug!(%peer, "ignoring malformed message while waiting for a receiver: {e}"),
        }
    }
}

enum Event {
    FrameTick,
    StatsTick,
    DataReadable,
    CtrlReadable,
    DataWritable,
}

pub struct SenderLoop {
    data_sock: UdpSocket,
    ctrl_sock: UdpSocket,
    encoder: EncoderDriver,
    source: Box<dyn FrameSource>,
    raw: RawImage,
    clock: Clock,
    stats: StatsSink,
    frame_interval: Duration,
    want_write: bool,
}

impl SenderLoop {
    /// Both sockets must already be connected to their peers (§ session
    /// setup: the source of the first valid CONFIG on each socket).
    pub fn new(
        data_sock: UdpSocket,
        ctrl_sock: UdpSocket,
        encoder: EncoderDriver,
        source: Box<dyn FrameSource>,
        config: &Config,
        stats: StatsSink,
    ) -> SenderLoop {
        SenderLoop {
            data_sock,
            ctrl_sock,
            encoder,
            source,
            raw: RawImage::new(config.width, config.height),
            clock: Clock::new(),
            stats,
            frame_interval: Duration::from_micros(1_000_000 / u64::from(config.frame_rate.max(1))),
            want_write: false,
        }
    }

    /// Runs until the raw input is exhausted (clean exit, returning the final
    /// counters) or a socket fails.
    pub async fn run(mut self) -> anyhow::Result<StatsSnapshot> {
        let mut fps_timer = time::interval(self.frame_interval);
        fps_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_timer = time::interval(Duration::from_secs(1));
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = time::Instant::now();
        let mut frames_read: u64 = 0;

        loop {
            let event = tokio::select! {
                _ = fps_timer.tick() => Event::FrameTick,
                _ = stats_timer.tick() => Event::StatsTick,
                r = self.data_sock.readable() => { r?; Event::DataReadable }
                r = self.ctrl_sock.readable() => { r?; Event::CtrlReadable }
                r = self.data_sock.writable(), if self.want_write => { r?; Event::DataWritable }
            };

            match event {
                Event::FrameTick => {
                    if !self.on_frame_tick(started, &mut frames_read)? {
                        info!("raw video input exhausted, shutting down");
                        return Ok(self.encoder.snapshot());
                    }
                }
                Event::StatsTick => self.encoder.output_periodic_stats(&mut self.stats),
                Event::DataReadable => self.on_data_readable()?,
                Event::CtrlReadable => self.on_ctrl_readable()?,
                Event::DataWritable => self.on_data_writable()?,
            }
        }
    }

    /// Reads the raw frames due since the last tick (using only the latest,
    /// as a late sender must not lag behind its source), compresses and
    /// enqueues. Returns `false` when the source is exhausted.
    fn on_frame_tick(
        &mut self,
        started: time::Instant,
        frames_read: &mut u64,
    ) -> anyhow::Result<bool> {
        let interval_us = self.frame_interval.as_micros() as u64;
        let expected = started.elapsed().as_micros() as u64 / interval_us + 1;
        let due = expected.saturating_sub(*frames_read).max(1);
        if due > 1 {
            warn!(skipped = due - 1, "frame timer fell behind, skipping raw frames");
        }

        for _ in 0..due {
            match self.source.read_frame(&mut self.raw) {
                Ok(()) => *frames_read += 1,
                Err(ProtocolError::EndOfInput) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        self.encoder.compress_frame(&self.raw, &self.clock)?;
        self.encoder.tick_maintenance(&self.clock);
        if self.encoder.has_pending() {
            self.want_write = true;
        }
        Ok(true)
    }

    fn on_data_readable(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 2048];
        loop {
            match self.data_sock.try_recv(&mut buf) {
                Ok(n) => match Message::decode(&buf[..n]) {
                    Ok(Message::Ack(ack)) => {
                        trace!(
                            frame_id = ack.frame_id,
                            frag_id = ack.frag_id,
                            "received ACK"
                        );
                        self.encoder.handle_ack(&ack, &self.clock);
                    }
                    Ok(other) => debug!(?other, "unexpected message on data socket, dropping"),
                    Err(e) => debug!("malformed message on data socket, dropping: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        // ACK processing may have queued retransmissions
        if self.encoder.has_pending() {
            self.want_write = true;
        }
        Ok(())
    }

    fn on_ctrl_readable(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 2048];
        loop {
            match self.ctrl_sock.try_recv(&mut buf) {
                Ok(n) => match Message::decode(&buf[..n]) {
                    Ok(Message::RateEstimate(est)) => {
                        info!(kbps = est.target_bitrate, "received rate estimate");
                        self.encoder.set_target_bitrate(est.target_bitrate);
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

    fn on_data_writable(&mut self) -> anyhow::Result<()> {
        while let Some(mut record) = self.encoder.next_sendable(&self.clock) {
            let send_ts = self.clock.now_us();
            record.datagram.send_ts = send_ts;
            let wire = record.datagram.encode();

            match self.data_sock.try_send(&wire) {
                Ok(_) => {
                    trace!(
                        frame_id = record.datagram.frame_id,
                        frag_id = record.datagram.frag_id,
                        num_rtx = record.num_rtx,
                        "sent datagram"
                    );
                    self.encoder.on_sent(record, send_ts);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // try again on the next writable event; the fragment
                    // keeps its place at the head of the queue
                    self.encoder.on_send_blocked(record);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        // the drain may have emptied the queue while RTOs expired
        self.encoder.tick_maintenance(&self.clock);
        self.want_write = self.encoder.has_pending();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RateEstimate;

    #[tokio::test]
    async fn socket_pair_ports_are_adjacent() {
        let (data, ctrl) = bind_socket_pair(0).await.unwrap();
        let data_port = data.local_addr().unwrap().port();
        let ctrl_port = ctrl.local_addr().unwrap().port();
        assert_eq!(ctrl_port, data_port + 1);
    }

    #[tokio::test]
    async fn wait_for_config_skips_garbage_and_pins_the_sender() {
        let (data, _ctrl) = bind_socket_pair(0).await.unwrap();
        let server_addr = data.local_addr().unwrap();

        let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        client
            .connect(("127.0.0.1", server_addr.port()))
            .await
            .unwrap();

        client.send(b"\xffgarbage").await.unwrap();
        client
            .send(&Message::RateEstimate(RateEstimate { target_bitrate: 1 }).encode())
            .await
            .unwrap();
        let config = Config {
            width: 640,
            height: 480,
            frame_rate: 30,
            target_bitrate: 2000,
        };
        client.send(&Message::Config(config).encode()).await.unwrap();

        let (peer, received) = wait_for_config(&data).await.unwrap();
        assert_eq!(received, config);
        assert_eq!(peer.port(), client.local_addr().unwrap().port());
    }
}
