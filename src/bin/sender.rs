//! Single-stream video sender: binds the data/control socket pair, waits for
//! a receiver's CONFIG on each, then streams a Y4M file at the negotiated
//! resolution and frame rate.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tilecast::codec::SyntheticCodec;
use tilecast::config::TransportConfig;
use tilecast::encoder::EncoderDriver;
use tilecast::sender_loop::{bind_socket_pair, wait_for_config, SenderLoop};
use tilecast::stats::StatsSink;
use tilecast::y4m::Y4mReader;

#[derive(Parser, Debug)]
#[clap(name = "sender")]
struct Opt {
    /// MTU for deciding UDP payload size
    #[clap(long, default_value_t = 1500)]
    mtu: usize,
    /// file to write per-second transport stats to
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,
    /// enable per-datagram logging
    #[clap(short, long)]
    verbose: bool,
    /// UDP port of the data socket; the control socket uses port + 1
    port: u16,
    /// YUV4MPEG2 input file
    y4m: PathBuf,
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
    let config = TransportConfig::new(opt.mtu)?;

    let (data_sock, ctrl_sock) = bind_socket_pair(opt.port).await?;
    info!(
        data = %data_sock.local_addr()?,
        ctrl = %ctrl_sock.local_addr()?,
        "listening, waiting for receiver"
    );

    // pin each socket's peer independently to the first valid CONFIG
    let (data_peer, session) = wait_for_config(&data_sock).await?;
    data_sock.connect(data_peer).await?;
    info!(peer = %data_peer, "data channel connected");

    let (ctrl_peer, _) = wait_for_config(&ctrl_sock).await?;
    ctrl_sock.connect(ctrl_peer).await?;
    info!(peer = %ctrl_peer, "control channel connected");

    info!(
        width = session.width,
        height = session.height,
        fps = session.frame_rate,
        target_kbps = session.target_bitrate,
        "received session config"
    );

    let source = Y4mReader::open(&opt.y4m, session.width, session.height)
        .context("opening video input")?;
    let codec = SyntheticCodec::new(
        session.width,
        session.height,
        session.frame_rate,
        session.target_bitrate,
    );
    let encoder = EncoderDriver::new(
        Box::new(codec),
        &config,
        None,
        session.width,
        session.height,
        session.frame_rate,
        session.target_bitrate,
    );
    let stats = StatsSink::new(opt.output.as_deref())?;

    let final_stats = SenderLoop::new(
        data_sock,
        ctrl_sock,
        encoder,
        Box::new(source),
        &session,
        stats,
    )
    .run()
    .await?;

    info!(
        frames = final_stats.frames,
        frags_sent = final_stats.frags_sent,
        rtx = final_stats.retransmissions,
        acks = final_stats.acks,
        "stream finished"
    );
    Ok(())
}
