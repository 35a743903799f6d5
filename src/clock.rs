use tokio::time::Instant;

/// Microsecond timestamps relative to a process-local origin.
///
/// `send_ts` values on the wire are opaque to the receiver (it only echoes
/// them back in ACKs), so an arbitrary epoch is fine. Built on
/// [`tokio::time::Instant`] so paused-time tests can drive the retransmission
/// machinery deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            origin: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}
