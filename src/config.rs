use std::time::Duration;

use crate::error::ProtocolError;
use crate::protocol::WireFormat;

pub const MIN_MTU: usize = 512;
pub const MAX_MTU: usize = 1500;

/// IPv4 + UDP header overhead subtracted from the MTU before our own header.
const IP_UDP_OVERHEAD: usize = 28;

/// Knobs of the data plane. One value per sender; the fragmenter and the
/// retransmission machinery are constructed from it rather than reading
/// process-wide state.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    mtu: usize,

    /// RTO = max(srtt * rto_multiplier, rto_floor).
    pub rto_multiplier: f64,
    pub rto_floor: Duration,

    /// A frame older than `2 * frame_interval * giveup_window_frames` is
    /// abandoned: its fragments are dropped from the send queue and the
    /// unacked map. Real-time playback prefers fresh frames over late ones.
    pub giveup_window_frames: u32,
}

impl TransportConfig {
    pub fn new(mtu: usize) -> Result<TransportConfig, ProtocolError> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(ProtocolError::BadMtu(mtu));
        }
        Ok(TransportConfig {
            mtu,
            rto_multiplier: 2.0,
            rto_floor: Duration::from_millis(4),
            giveup_window_frames: 8,
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest fragment payload that still fits one UDP datagram of `mtu`
    /// bytes after IP/UDP overhead and our header.
    pub fn max_payload(&self, format: WireFormat) -> usize {
        self.mtu - IP_UDP_OVERHEAD - format.header_len()
    }
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig::new(MAX_MTU).expect("default MTU is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case::default_plain(1500, WireFormat::Plain, 1451)]
    #[case::default_tiled(1500, WireFormat::Tiled, 1449)]
    #[case::small(512, WireFormat::Plain, 463)]
    fn max_payload_from_mtu(#[case] mtu: usize, #[case] format: WireFormat, #[case] expected: usize) {
        let config = TransportConfig::new(mtu).unwrap();
        assert_eq!(config.max_payload(format), expected);
    }

    #[rstest]
    #[case(511)]
    #[case(1501)]
    #[case(0)]
    fn unreasonable_mtu_is_rejected(#[case] mtu: usize) {
        assert_matches!(TransportConfig::new(mtu), Err(ProtocolError::BadMtu(m)) if m == mtu);
    }
}
