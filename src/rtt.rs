/// Smoothed RTT over ACK samples and the retransmission timeout derived
/// from it.
///
/// `srtt` is the classic exponentially weighted moving average with
/// alpha = 1/8; `min_rtt` tracks the smallest sample seen. Until the first
/// ACK arrives there is nothing to smooth, so the RTO falls back to a
/// conservative initial value.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_us: Option<f64>,
    min_rtt_us: Option<u64>,
    multiplier: f64,
    floor_us: u64,
}

const ALPHA: f64 = 0.125;

/// RTO used before the first RTT sample.
const INITIAL_RTO_US: u64 = 200_000;

impl RttEstimator {
    pub fn new(multiplier: f64, floor_us: u64) -> RttEstimator {
        RttEstimator {
            srtt_us: None,
            min_rtt_us: None,
            multiplier,
            floor_us,
        }
    }

    pub fn on_sample(&mut self, sample_us: u64) {
        self.min_rtt_us = Some(match self.min_rtt_us {
            Some(min) => min.min(sample_us),
            None => sample_us,
        });
        self.srtt_us = Some(match self.srtt_us {
            Some(srtt) => (1.0 - ALPHA) * srtt + ALPHA * sample_us as f64,
            None => sample_us as f64,
        });
    }

    pub fn srtt_us(&self) -> Option<u64> {
        self.srtt_us.map(|v| v as u64)
    }

    pub fn min_rtt_us(&self) -> Option<u64> {
        self.min_rtt_us
    }

    pub fn rto_us(&self) -> u64 {
        match self.srtt_us {
            Some(srtt) => ((srtt * self.multiplier) as u64).max(self.floor_us),
            None => INITIAL_RTO_US,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn estimator() -> RttEstimator {
        RttEstimator::new(2.0, 4_000)
    }

    #[test]
    fn first_sample_initialises_both_estimates() {
        let mut rtt = estimator();
        assert_eq!(rtt.srtt_us(), None);
        assert_eq!(rtt.rto_us(), INITIAL_RTO_US);

        rtt.on_sample(30_000);
        assert_eq!(rtt.srtt_us(), Some(30_000));
        assert_eq!(rtt.min_rtt_us(), Some(30_000));
        assert_eq!(rtt.rto_us(), 60_000);
    }

    #[test]
    fn ewma_matches_hand_computation() {
        let mut rtt = estimator();
        let samples = [10_000u64, 20_000, 5_000, 40_000, 12_000];

        let mut expected = samples[0] as f64;
        rtt.on_sample(samples[0]);
        for &s in &samples[1..] {
            rtt.on_sample(s);
            expected = 0.875 * expected + 0.125 * s as f64;
        }

        assert_eq!(rtt.srtt_us(), Some(expected as u64));
        assert_eq!(rtt.min_rtt_us(), Some(5_000));
    }

    #[test]
    fn converges_to_the_sample_mean() {
        // constant samples: srtt must settle on the sample value
        let mut rtt = estimator();
        for _ in 0..200 {
            rtt.on_sample(25_000);
        }
        let srtt = rtt.srtt_us().unwrap();
        assert!((24_999..=25_001).contains(&srtt), "srtt = {srtt}");

        // alternating samples: srtt settles near the mean
        let mut rtt = estimator();
        for i in 0..2_000 {
            rtt.on_sample(if i % 2 == 0 { 10_000 } else { 30_000 });
        }
        let srtt = rtt.srtt_us().unwrap();
        assert!((18_000..=22_000).contains(&srtt), "srtt = {srtt}");
    }

    #[rstest]
    #[case::floor_wins(1_000, 4_000)]
    #[case::srtt_wins(50_000, 100_000)]
    fn rto_is_scaled_srtt_with_a_floor(#[case] sample: u64, #[case] expected_rto: u64) {
        let mut rtt = estimator();
        rtt.on_sample(sample);
        assert_eq!(rtt.rto_us(), expected_rto);
    }

    #[test]
    fn min_rtt_never_increases() {
        let mut rtt = estimator();
        rtt.on_sample(20_000);
        rtt.on_sample(8_000);
        rtt.on_sample(50_000);
        assert_eq!(rtt.min_rtt_us(), Some(8_000));
    }
}
