//! Min-heap timer queue with lazy cancellation.
//!
//! Timers are never removed from the heap when cancelled. Instead the owner
//! of each timed object records the deadline it last armed per kind; a popped
//! entry whose deadline no longer matches that record is dead and is skipped.
//! This keeps cancellation O(1) at the cost of occasional stale pops.
//!
//! All deadlines are offsets from the start of the serial session, so the
//! queue is deterministic under test.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

/// What a timer expiry means to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The oldest unacknowledged segment is due for retransmission.
    Retransmission,
    /// A connection has waited out 2·MSL and can be deleted.
    TimeWait,
    /// A deferred ACK must be flushed.
    DelayedAck,
    /// A connection attempt has run out of time to reach ESTABLISHED.
    ConnectTimeout,
    /// Periodic idle-activity sweep for an established flow.
    Keepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry<K> {
    deadline: Duration,
    seq: u64,
    kind: TimerKind,
    key: K,
}

impl<K: Eq> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl<K: Eq> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A timer that has come due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired<K> {
    pub kind: TimerKind,
    pub key: K,
    /// The deadline the entry was armed with. The owner compares this with
    /// its armed-slot record to detect dead entries.
    pub deadline: Duration,
}

/// The timer heap. `K` identifies the timed object, typically a connection.
#[derive(Debug)]
pub struct TimerQueue<K> {
    heap: BinaryHeap<Reverse<Entry<K>>>,
    next_seq: u64,
}

impl<K: Eq + Clone> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Arm a timer. Re-arming does not remove the previous entry; the stale
    /// one is skipped on pop.
    pub fn arm(&mut self, kind: TimerKind, key: K, deadline: Duration) {
        self.heap.push(Reverse(Entry {
            deadline,
            seq: self.next_seq,
            kind,
            key,
        }));
        self.next_seq += 1;
    }

    /// Pop the next entry with `deadline <= now`, oldest first. Liveness is
    /// the caller's judgement; dead entries come out like live ones.
    pub fn pop_due(&mut self, now: Duration) -> Option<Expired<K>> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline <= now => {
                let Reverse(entry) = self.heap.pop().unwrap();
                Some(Expired {
                    kind: entry.kind,
                    key: entry.key,
                    deadline: entry.deadline,
                })
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<K: Eq + Clone> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-kind record of the deadline most recently armed for one object.
/// `None` means the kind is not armed; a heap entry with any other deadline
/// is dead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmedSlots {
    retransmission: Option<Duration>,
    time_wait: Option<Duration>,
    delayed_ack: Option<Duration>,
    connect_timeout: Option<Duration>,
    keepalive: Option<Duration>,
}

impl ArmedSlots {
    pub fn get(&self, kind: TimerKind) -> Option<Duration> {
        match kind {
            TimerKind::Retransmission => self.retransmission,
            TimerKind::TimeWait => self.time_wait,
            TimerKind::DelayedAck => self.delayed_ack,
            TimerKind::ConnectTimeout => self.connect_timeout,
            TimerKind::Keepalive => self.keepalive,
        }
    }

    pub fn set(&mut self, kind: TimerKind, deadline: Option<Duration>) {
        let slot = match kind {
            TimerKind::Retransmission => &mut self.retransmission,
            TimerKind::TimeWait => &mut self.time_wait,
            TimerKind::DelayedAck => &mut self.delayed_ack,
            TimerKind::ConnectTimeout => &mut self.connect_timeout,
            TimerKind::Keepalive => &mut self.keepalive,
        };
        *slot = deadline;
    }

    /// Whether a popped entry is the one currently armed.
    pub fn is_live(&self, kind: TimerKind, deadline: Duration) -> bool {
        self.get(kind) == Some(deadline)
    }
}
