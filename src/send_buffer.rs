//! Sender-side queueing: the FIFO of fragments awaiting (re)transmission and
//! the map of transmitted-but-unacknowledged fragments.
//!
//! A fragment lives in the unacked map from its first successful send until
//! it is acknowledged or its frame is abandoned. Retransmissions travel
//! through the queue as cheap copies (payloads are refcounted `Bytes`); the
//! unacked entry itself is never re-inserted.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::protocol::{Datagram, SeqNum};

/// A wire datagram plus the off-wire bookkeeping the sender keeps for it.
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub datagram: Datagram,
    /// How many times this fragment has been retransmitted.
    pub num_rtx: u32,
    /// Timestamp of the last successful send, 0 before the first one.
    pub last_send_ts: u64,
    /// When the fragment's frame was compressed; drives the give-up policy.
    pub frame_ctime: u64,
}

pub struct SendBuffer {
    queue: VecDeque<SendRecord>,
    unacked: FxHashMap<SeqNum, SendRecord>,
    /// Retransmission deadlines in send order. Sends are stamped with a
    /// monotonic clock, so the deque stays sorted by construction; entries
    /// are validated lazily against the unacked map, which keeps the scan
    /// amortised O(number retransmitted).
    deadlines: VecDeque<(u64, SeqNum)>,
}

impl SendBuffer {
    pub fn new() -> SendBuffer {
        SendBuffer {
            queue: VecDeque::new(),
            unacked: FxHashMap::default(),
            deadlines: VecDeque::new(),
        }
    }

    /// Appends freshly fragmented datagrams, in ascending `frag_id` order.
    pub fn enqueue_new(&mut self, datagrams: impl IntoIterator<Item = Datagram>, ctime: u64) {
        for datagram in datagrams {
            self.queue.push_back(SendRecord {
                datagram,
                num_rtx: 0,
                last_send_ts: 0,
                frame_ctime: ctime,
            });
        }
    }

    /// Pops the next record worth sending. Records whose frame has passed the
    /// give-up bound, and retransmission copies whose fragment was
    /// acknowledged while queued, are discarded on the way.
    pub fn pop_sendable(&mut self, now_us: u64, giveup_us: u64) -> Option<SendRecord> {
        while let Some(record) = self.queue.pop_front() {
            if now_us.saturating_sub(record.frame_ctime) > giveup_us {
                debug!(
                    frame_id = record.datagram.frame_id,
                    frag_id = record.datagram.frag_id,
                    "dropping overdue fragment instead of sending"
                );
                self.unacked.remove(&record.datagram.seq());
                continue;
            }
            if record.num_rtx > 0 && !self.unacked.contains_key(&record.datagram.seq()) {
                trace!(
                    frame_id = record.datagram.frame_id,
                    frag_id = record.datagram.frag_id,
                    "retransmission acknowledged while queued, dropping"
                );
                continue;
            }
            return Some(record);
        }
        None
    }

    /// Puts an unsent record back at the head of the queue (EWOULDBLOCK).
    pub fn unsend(&mut self, mut record: SendRecord) {
        record.datagram.send_ts = 0;
        self.queue.push_front(record);
    }

    /// Bookkeeping for a successful send at `send_ts`: a first transmission
    /// moves into the unacked map, a retransmission refreshes the existing
    /// entry in place.
    pub fn mark_sent(&mut self, mut record: SendRecord, send_ts: u64) {
        let seq = record.datagram.seq();
        record.last_send_ts = send_ts;

        if record.num_rtx == 0 {
            self.unacked.insert(seq, record);
        } else if let Some(entry) = self.unacked.get_mut(&seq) {
            entry.last_send_ts = send_ts;
            entry.datagram.send_ts = record.datagram.send_ts;
        }
        self.deadlines.push_back((send_ts, seq));
    }

    /// Removes the acknowledged fragment and returns the RTT sample
    /// `now - echoed_send_ts`. ACKs for unknown keys (duplicates, or arrivals
    /// after the frame was abandoned) return `None`.
    pub fn ack(
        &mut self,
        frame_id: u32,
        frag_id: u16,
        echoed_send_ts: u64,
        now_us: u64,
    ) -> Option<u64> {
        match self.unacked.remove(&(frame_id, frag_id)) {
            Some(_) => Some(now_us.saturating_sub(echoed_send_ts)),
            None => {
                trace!(frame_id, frag_id, "ACK for unknown fragment, ignoring");
                None
            }
        }
    }

    /// Requeues every unacked fragment whose RTO has expired. Returns the
    /// number of fragments queued for retransmission.
    pub fn scan_retransmits(&mut self, now_us: u64, rto_us: u64) -> usize {
        let mut requeued = 0;
        while let Some(&(sent_at, seq)) = self.deadlines.front() {
            if sent_at + rto_us > now_us {
                break;
            }
            self.deadlines.pop_front();

            // stale deadline: acknowledged, abandoned, or re-sent since
            let Some(entry) = self.unacked.get_mut(&seq) else {
                continue;
            };
            if entry.last_send_ts != sent_at {
                continue;
            }

            entry.num_rtx += 1;
            let copy = entry.clone();
            debug!(
                frame_id = seq.0,
                frag_id = seq.1,
                num_rtx = copy.num_rtx,
                "retransmission timeout, requeueing fragment"
            );
            self.queue.push_back(copy);
            requeued += 1;
        }
        requeued
    }

    /// Abandons every fragment whose frame is older than the give-up bound.
    /// Returns the number of unacked fragments dropped.
    pub fn give_up(&mut self, now_us: u64, giveup_us: u64) -> usize {
        let before = self.unacked.len();
        self.queue
            .retain(|r| now_us.saturating_sub(r.frame_ctime) <= giveup_us);
        self.unacked
            .retain(|_, r| now_us.saturating_sub(r.frame_ctime) <= giveup_us);
        let dropped = before - self.unacked.len();
        if dropped > 0 {
            debug!(dropped, "abandoned fragments past the give-up bound");
        }
        dropped
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn unacked_contains(&self, seq: SeqNum) -> bool {
        self.unacked.contains_key(&seq)
    }

    pub fn num_rtx_of(&self, seq: SeqNum) -> Option<u32> {
        self.unacked.get(&seq).map(|r| r.num_rtx)
    }

    pub fn last_send_ts_of(&self, seq: SeqNum) -> Option<u64> {
        self.unacked.get(&seq).map(|r| r.last_send_ts)
    }
}

impl Default for SendBuffer {
    fn default() -> SendBuffer {
        SendBuffer::new()
    }
}
