//! Tiled video sender: splits each frame into an R x C grid, compresses the
//! tiles in parallel and streams them over one shared socket pair. Input is
//! pre-read into a ring of raw frames so disk I/O never stalls a frame tick.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tilecast::codec::SyntheticCodec;
use tilecast::config::TransportConfig;
use tilecast::encoder::EncoderDriver;
use tilecast::image::TileGeometry;
use tilecast::sender_loop::{bind_socket_pair, wait_for_config};
use tilecast::stats::StatsSink;
use tilecast::tile::{prefill_ring, TileSenderLoop};
use tilecast::y4m::Y4mReader;

#[derive(Parser, Debug)]
#[clap(name = "tile_sender")]
struct Opt {
    /// MTU for deciding UDP payload size
    #[clap(long, default_value_t = 1500)]
    mtu: usize,
    /// rows of the tiling grid
    #[clap(long, default_value_t = 4)]
    rows: u16,
    /// columns of the tiling grid
    #[clap(long, default_value_t = 4)]
    cols: u16,
    /// size of the raw frame ring, in frames
    #[clap(long, default_value_t = 240)]
    buffer: usize,
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

    let (data_peer, session) = wait_for_config(&data_sock).await?;
    data_sock.connect(data_peer).await?;
    info!(peer = %data_peer, "data channel connected");

    let (ctrl_peer, _) = wait_for_config(&ctrl_sock).await?;
    ctrl_sock.connect(ctrl_peer).await?;
    info!(peer = %ctrl_peer, "control channel connected");

    let geo = TileGeometry::new(session.width, session.height, opt.rows, opt.cols)?;
    info!(
        width = session.width,
        height = session.height,
        fps = session.frame_rate,
        target_kbps = session.target_bitrate,
        rows = geo.rows,
        cols = geo.cols,
        tile_width = geo.tile_width,
        tile_height = geo.tile_height,
        "received session config"
    );

    let mut source = Y4mReader::open(&opt.y4m, session.width, session.height)
        .context("opening video input")?;
    let ring = prefill_ring(&mut source, session.width, session.height, opt.buffer)?;
    info!(frames = ring.len(), "raw frame ring filled");

    let encoders: Vec<EncoderDriver> = (0..geo.tile_count())
        .map(|idx| {
            let codec = SyntheticCodec::new(
                geo.tile_width,
                geo.tile_height,
                session.frame_rate,
                session.target_bitrate,
            );
            EncoderDriver::new(
                Box::new(codec),
                &config,
                Some(idx as u16),
                geo.tile_width,
                geo.tile_height,
                session.frame_rate,
                session.target_bitrate,
            )
        })
        .collect();
    let stats = StatsSink::new(opt.output.as_deref())?;

    let final_stats = TileSenderLoop::new(
        data_sock,
        ctrl_sock,
        geo,
        encoders,
        ring,
        session.frame_rate,
        stats,
    )
    .run()
    .await?;

    info!(
        frames = final_stats.frames,
        frags_sent = final_stats.frags_sent,
        "stream finished"
    );
    Ok(())
}
