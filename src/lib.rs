//! Real-time video transport over plain UDP.
//!
//! A sender compresses raw frames, fragments each compressed frame into
//! MTU-sized datagrams and streams them to a receiver, which acknowledges
//! every fragment, reassembles frames and hands them to a decoder. The
//! transport is *frame-grained reliable*: lost fragments are retransmitted
//! while their frame is still worth delivering, and abandoned once it is not.
//! Latency always wins over completeness.
//!
//! ## Design goals
//!
//! * Minimise glass-to-glass latency on lossy networks; never stall the
//!   stream behind one missing fragment
//! * Retransmit under a budget: a fragment is retried while its frame is
//!   younger than the give-up window, then dropped on both sides
//! * Let the receiver steer the sender's bitrate through a side channel,
//!   without fixing any congestion-control algorithm
//! * Optionally split each frame into independently encoded tiles and fan
//!   the per-tile compressions out over a worker pool
//!
//! ## Wire format
//!
//! One record per UDP payload, all integers big-endian. Data-plane datagrams
//! (header 21 bytes, 23 with a tile id):
//!
//! ```ascii
//! 0:  frame_id (u32)
//! 4:  frame_type (u8): 0 unknown, 1 key, 2 non-key
//! *:  tile_id (u16) - tiled family only
//! 5:  frag_id (u16)
//! 7:  frag_cnt (u16)
//! 9:  frame_width (u16)
//! 11: frame_height (u16)
//! 13: send_ts (u64) - stamped at the last send attempt, echoed by ACKs
//! 21: payload - a contiguous slice of the compressed frame
//! ```
//!
//! Control-plane messages (first byte is the type tag):
//!
//! ```ascii
//! ACK (1):           frame_id (u32), frag_id (u16), send_ts (u64)
//! CONFIG (2):        width, height, frame_rate (u16 each), target_bitrate (u32)
//! RATE_ESTIMATE (3): target_bitrate (u32)
//! ```
//!
//! ## Session shape
//!
//! The sender binds the data socket on port `P` and the control socket on
//! `P + 1`. A receiver opens the session by sending one `CONFIG` to each;
//! the sender pins each socket's peer to the source of the first valid
//! `CONFIG` independently and ignores other peers from then on. ACKs flow
//! back on the data socket, `RATE_ESTIMATE`s on the control socket.
//!
//! Both processes are single-threaded cooperative event loops; the only
//! parallelism is the tiled sender's per-tick fork-join over its tile
//! encoders.

pub mod assembler;
pub mod clock;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod fragment;
pub mod image;
pub mod protocol;
pub mod receiver_loop;
pub mod rtt;
pub mod send_buffer;
pub mod sender_loop;
pub mod stats;
pub mod tile;
pub mod y4m;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
