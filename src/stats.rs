//! Per-second transport statistics, one CSV-like line per tick.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub frags_sent: u64,
    pub retransmissions: u64,
    pub acks: u64,
    pub srtt_us: Option<u64>,
    pub target_kbps: u32,
}

pub struct StatsSink {
    file: Option<File>,
}

impl StatsSink {
    /// With no path, stats only go to the log.
    pub fn new(path: Option<&Path>) -> anyhow::Result<StatsSink> {
        let file = match path {
            Some(path) => {
                let mut file = File::create(path)
                    .with_context(|| format!("creating stats output {}", path.display()))?;
                writeln!(file, "time,frames,frags_sent,rtx,acks,srtt_us,target_kbps")?;
                Some(file)
            }
            None => None,
        };
        Ok(StatsSink { file })
    }

    pub fn record(&mut self, snap: &StatsSnapshot) {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let srtt = snap.srtt_us.unwrap_or(0);

        info!(
            frames = snap.frames,
            frags_sent = snap.frags_sent,
            rtx = snap.retransmissions,
            acks = snap.acks,
            srtt_us = srtt,
            target_kbps = snap.target_kbps,
            "periodic stats"
        );

        if let Some(file) = &mut self.file {
            if let Err(e) = writeln!(
                file,
                "{wall},{},{},{},{},{srtt},{}",
                snap.frames, snap.frags_sent, snap.retransmissions, snap.acks, snap.target_kbps
            ) {
                warn!("failed to write stats line: {e}");
            }
        }
    }
}
