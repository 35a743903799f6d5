//! Single-stream video receiver: connects to a sender's data and control
//! ports, requests a configuration, then acknowledges fragments and decodes
//! completed frames until the streaming time is up.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::info;

use tilecast::codec::SyntheticCodec;
use tilecast::decoder::{DecoderDriver, LazyLevel, NullSink};
use tilecast::protocol::Config;
use tilecast::receiver_loop::ReceiverLoop;
use tilecast::stats::StatsSink;

#[derive(Parser, Debug)]
#[clap(name = "receiver")]
struct Opt {
    /// frame rate to request from the sender
    #[clap(long, default_value_t = 30)]
    fps: u16,
    /// constant bitrate (kbps) to request from the sender
    #[clap(long, default_value_t = 0)]
    cbr: u32,
    /// 0: decode and display, 1: decode only, 2: discard
    #[clap(long, default_value_t = 0)]
    lazy: u8,
    /// file to write per-second stats to
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,
    /// enable per-datagram logging
    #[clap(short, long)]
    verbose: bool,
    /// total streaming time in seconds; runs forever when omitted
    #[clap(long)]
    streamtime: Option<u64>,
    /// advertise a cycling bitrate ladder every 5 seconds
    #[clap(long)]
    cycle: bool,
    /// sender host
    host: String,
    /// sender data port; control uses port + 1
    port: u16,
    /// requested frame width
    width: u16,
    /// requested frame height
    height: u16,
}

fn main() {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    if let Err(e) = run(opt) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("tilecast=trace,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn run(opt: Opt) -> anyhow::Result<()> {
    let lazy = LazyLevel::from_u8(opt.lazy).context("lazy level must be 0, 1 or 2")?;

    let ctrl_port = opt
        .port
        .checked_add(1)
        .context("data port must leave room for the control port")?;
    let data_sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
    data_sock.connect((opt.host.as_str(), opt.port)).await?;
    let ctrl_sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
    ctrl_sock.connect((opt.host.as_str(), ctrl_port)).await?;
    info!(
        data = %data_sock.local_addr()?,
        ctrl = %ctrl_sock.local_addr()?,
        sender = %data_sock.peer_addr()?,
        "connected"
    );

    let config = Config {
        width: opt.width,
        height: opt.height,
        frame_rate: opt.fps,
        target_bitrate: opt.cbr,
    };

    let fps = opt.fps;
    let cbr = opt.cbr;
    let make_decoder = Box::new(move |width: u16, height: u16| {
        DecoderDriver::new(
            Box::new(SyntheticCodec::new(width, height, fps, cbr)),
            Box::new(NullSink),
            lazy,
        )
    });
    let stats = StatsSink::new(opt.output.as_deref())?;

    let report = ReceiverLoop::new(
        data_sock,
        ctrl_sock,
        config,
        make_decoder,
        opt.streamtime.map(Duration::from_secs),
        opt.cycle,
        stats,
    )
    .run()
    .await?;

    info!(
        datagrams = report.datagrams,
        acks_sent = report.acks_sent,
        frames_delivered = report.frames_delivered,
        "stream finished"
    );
    Ok(())
}
