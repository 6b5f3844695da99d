//! The Transmission Control Block: per-connection RFC 793 state and segment
//! processing, with RFC 6298 retransmission timing and NewReno congestion
//! control.
//!
//! A [`Tcb`] is sans-I/O. Segments go in through [`Tcb::segment_arrives`],
//! outbound segments come back out of [`Tcb::take_segments`], in-order
//! payload is drained with [`Tcb::take_delivered`], and timer arm/cancel
//! requests with [`Tcb::take_timer_ops`]. Time is whatever `Duration` the
//! caller passes in, so every scenario is reproducible in tests.
//!
//! The CLOSED and LISTEN states have no block of their own and are handled
//! by the freestanding [`segment_arrives_closed`] and
//! [`segment_arrives_listen`] functions.

use super::congestion::{AckSignal, NewReno};
use super::modular::{seq_gt, seq_in_window, seq_leq, seq_lt};
use super::rtt::RttEstimator;
use crate::config::TcpTuning;
use crate::timer::TimerKind;
use crate::wire::tcp::{serialize, TcpHeader, TcpHeaderBuilder, TcpOptions};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;


/// Window we advertise to the peer.
pub const RECEIVE_WINDOW: u16 = 8192;

/// How long a pure ACK for in-order data may be deferred, hoping to coalesce
/// with more data or piggyback on an outgoing segment.
const ACK_DELAY: Duration = Duration::from_millis(200);

/// Cadence of the per-connection idle sweep.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(75);

/// Fallback MSS when the peer offers none.
const DEFAULT_PEER_MSS: u16 = 536;

/// One side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// The four-tuple identifying one flow over the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}

/// Connection states past LISTEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Active open: our SYN is out.
    SynSent,
    /// Passive open: SYN seen, our SYN+ACK is out.
    SynReceived,
    /// Data transfer.
    Established,
    /// We closed first; FIN sent, nothing acknowledged yet.
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's.
    FinWait2,
    /// Peer closed first; we may still send.
    CloseWait,
    /// Both sides closed simultaneously; waiting for our FIN's ACK.
    Closing,
    /// Peer closed, then we closed; waiting for the final ACK.
    LastAck,
    /// Lingering so stray segments die off the wire.
    TimeWait,
}

impl State {
    /// States in which the stream proxy may be live. Leaving this set tears
    /// the proxy down.
    pub fn proxy_alive(self) -> bool {
        matches!(self, State::Established | State::CloseWait)
    }
}

/// How this block came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// We answered a SYN (host mode).
    Listen,
    /// We sent the SYN (client forwarder).
    Open,
}

/// An outbound segment: a finished header plus its payload.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Bytes,
}

impl Segment {
    pub fn new(header: TcpHeader, text: Bytes) -> Self {
        Self { header, text }
    }

    /// Sequence space the segment occupies, control bits included.
    pub fn seg_len(&self) -> u32 {
        self.text.len() as u32 + self.header.ctl.syn() as u32 + self.header.ctl.fin() as u32
    }

    /// First sequence number past this segment.
    pub fn seq_end(&self) -> u32 {
        self.header.seq.wrapping_add(self.seg_len())
    }

    pub fn to_bytes(&self) -> Bytes {
        serialize(&self.header, &self.text)
    }
}

/// A segment on the retransmission queue.
#[derive(Debug, Clone)]
struct Transmit {
    segment: Segment,
    /// When the segment first went on the wire; None until then. Only
    /// segments sent exactly once contribute RTT samples.
    first_sent: Option<Duration>,
    retransmit_count: u32,
    needs_transmit: bool,
}

impl Transmit {
    fn new(segment: Segment) -> Self {
        Self {
            segment,
            first_sent: None,
            retransmit_count: 0,
            needs_transmit: true,
        }
    }
}

/// An out-of-order range parked until the gap before it fills.
#[derive(Debug, Clone)]
struct OooSegment {
    seq_start: u32,
    seq_end: u32,
    text: Bytes,
}

/// A timer arm (`deadline` set) or cancel request for the owning scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerOp {
    pub kind: TimerKind,
    pub deadline: Option<Duration>,
}

/// Result of feeding a segment in.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentArrivesResult {
    /// Processed; the connection lives on.
    Ok,
    /// The connection is finished and the block should be deleted.
    Close,
    /// The connection was reset, by the peer or by our own RST.
    Reset,
}

/// Result of a retransmission timer firing.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtoOutcome {
    /// The oldest segment was queued for retransmission.
    Retransmit,
    /// The retry budget is exhausted; the connection was aborted and a RST
    /// queued.
    Abort,
}

/// RFC 793 send sequence space.
#[derive(Debug, Clone, Copy, Default)]
struct SendSequenceSpace {
    /// Oldest unacknowledged sequence number.
    una: u32,
    /// Next sequence number to send.
    nxt: u32,
    /// Peer's advertised window.
    wnd: u16,
    /// Sequence number of the last window update.
    wl1: u32,
    /// Acknowledgment number of the last window update.
    wl2: u32,
    /// Initial send sequence number.
    iss: u32,
}

/// RFC 793 receive sequence space.
#[derive(Debug, Clone, Copy)]
struct ReceiveSequenceSpace {
    /// Initial receive sequence number.
    irs: u32,
    /// Next in-order sequence number expected.
    nxt: u32,
    /// Window we advertise.
    wnd: u16,
}

impl Default for ReceiveSequenceSpace {
    fn default() -> Self {
        Self {
            irs: 0,
            nxt: 0,
            wnd: RECEIVE_WINDOW,
        }
    }
}

/// The control block itself.
#[derive(Debug)]
pub struct Tcb {
    id: FlowId,
    state: State,
    initiation: Initiation,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    mss: u16,
    peer_mss: u16,
    rtt: RttEstimator,
    congestion: NewReno,
    /// Outbound bytes not yet segmentized.
    send_queue: BytesMut,
    /// Unacknowledged segments, oldest first.
    retransmit: VecDeque<Transmit>,
    /// Headers sent at most once, e.g. pure ACKs and RSTs.
    oneshot: Vec<TcpHeader>,
    /// Out-of-order ranges sorted by starting sequence number.
    ooo: Vec<OooSegment>,
    /// In-order payload awaiting the proxy.
    delivered: VecDeque<Bytes>,
    /// Bytes newly acknowledged since the owner last drained them; feeds the
    /// proxy's send-credit.
    acked_bytes: u32,
    /// A FIN is owed to the peer once the send queue drains.
    fin_queued: bool,
    /// Our FIN has been sequenced.
    fin_sent: bool,
    /// Consecutive retransmission timeouts.
    rto_expiries: u32,
    /// A delayed ACK is pending.
    ack_pending: bool,
    /// Mirror of whether a retransmission timer is armed with the scheduler.
    rto_armed: bool,
    timer_ops: Vec<TimerOp>,
    tuning: TcpTuning,
    pub last_activity: Duration,
}

impl Tcb {
    fn new(
        id: FlowId,
        initiation: Initiation,
        state: State,
        snd: SendSequenceSpace,
        rcv: ReceiveSequenceSpace,
        tuning: &TcpTuning,
        now: Duration,
    ) -> Self {
        Self {
            id,
            state,
            initiation,
            snd,
            rcv,
            mss: tuning.mss,
            peer_mss: DEFAULT_PEER_MSS,
            rtt: RttEstimator::new(),
            congestion: NewReno::new(tuning.mss as u32, tuning.initial_cwnd, tuning.ssthresh),
            send_queue: BytesMut::new(),
            retransmit: VecDeque::new(),
            oneshot: Vec::new(),
            ooo: Vec::new(),
            delivered: VecDeque::new(),
            acked_bytes: 0,
            fin_queued: false,
            fin_sent: false,
            rto_expiries: 0,
            ack_pending: false,
            rto_armed: false,
            timer_ops: Vec::new(),
            tuning: tuning.clone(),
            last_activity: now,
        }
    }

    /// Active open: create the block in SYN-SENT with the SYN queued.
    pub fn open(id: FlowId, iss: u32, tuning: &TcpTuning, now: Duration) -> Self {
        let mut tcb = Self::new(
            id,
            Initiation::Open,
            State::SynSent,
            SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss.wrapping_add(1),
                ..Default::default()
            },
            ReceiveSequenceSpace::default(),
            tuning,
            now,
        );
        let syn = tcb
            .header_builder(iss)
            .syn()
            .wnd(tcb.rcv.wnd)
            .mss(tcb.mss);
        tcb.enqueue_control(syn);
        tcb.arm(TimerKind::ConnectTimeout, now + tuning.connect_timeout);
        tcb
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn initiation(&self) -> Initiation {
        self.initiation
    }

    /// Bytes in flight is exactly the payload length sitting on the
    /// retransmission queue.
    pub fn bytes_in_flight(&self) -> u32 {
        self.retransmit
            .iter()
            .map(|t| t.segment.text.len() as u32)
            .sum()
    }

    pub fn snd_una(&self) -> u32 {
        self.snd.una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd.nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv.nxt
    }

    pub fn peer_mss(&self) -> u16 {
        self.peer_mss
    }

    pub fn congestion_window(&self) -> u32 {
        self.congestion.window()
    }

    /// Queue application bytes toward the peer.
    pub fn send(&mut self, data: &[u8]) {
        match self.state {
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => {
                self.send_queue.put_slice(data);
            }
            _ => {
                tracing::debug!(id = %self.id, state = ?self.state, "dropping send on closing connection");
            }
        }
    }

    /// Orderly close from our side: FIN after the send queue drains.
    pub fn close(&mut self) {
        match self.state {
            State::SynReceived | State::Established => {
                self.state = State::FinWait1;
                self.fin_queued = true;
            }
            State::CloseWait => {
                self.state = State::LastAck;
                self.fin_queued = true;
            }
            _ => {}
        }
    }

    /// Abort: queue a RST and drop all buffered state. The caller deletes
    /// the block after flushing segments.
    pub fn abort(&mut self) {
        let rst = self.header_builder(self.snd.nxt).rst().wnd(self.rcv.wnd);
        self.retransmit.clear();
        self.send_queue.clear();
        self.ooo.clear();
        self.delivered.clear();
        self.fin_queued = false;
        self.enqueue_control(rst);
        self.cancel(TimerKind::Retransmission);
        self.cancel(TimerKind::DelayedAck);
    }

    /// Whether in-order payload is waiting to be drained.
    pub fn has_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }

    /// In-order payload accepted since the last drain.
    pub fn take_delivered(&mut self) -> Vec<Bytes> {
        self.delivered.drain(..).collect()
    }

    /// Bytes acknowledged since the last drain; releases proxy send-credit.
    pub fn take_acked_bytes(&mut self) -> u32 {
        std::mem::take(&mut self.acked_bytes)
    }

    /// Timer updates requested since the last drain.
    pub fn take_timer_ops(&mut self) -> Vec<TimerOp> {
        std::mem::take(&mut self.timer_ops)
    }

    /// Process one inbound segment.
    pub fn segment_arrives(
        &mut self,
        seg: &TcpHeader,
        text: Bytes,
        now: Duration,
    ) -> SegmentArrivesResult {
        self.last_activity = now;
        let seg_len = text.len() as u32 + seg.ctl.syn() as u32 + seg.ctl.fin() as u32;

        if self.state == State::SynSent {
            return self.segment_in_syn_sent(seg, now);
        }

        if self.state == State::TimeWait {
            // The only interesting arrival is a retransmitted FIN; ACK it
            // and restart the 2·MSL clock either way.
            if seg.ctl.fin() {
                self.queue_ack();
            }
            self.arm(TimerKind::TimeWait, now + self.tuning.time_wait);
            return SegmentArrivesResult::Ok;
        }

        // First: sequence acceptability.
        if !self.seq_acceptable(seg.seq, seg_len) {
            if !seg.ctl.rst() {
                self.queue_ack();
            }
            return SegmentArrivesResult::Ok;
        }

        // Second: RST tears the connection down.
        if seg.ctl.rst() {
            tracing::debug!(id = %self.id, state = ?self.state, "connection reset by peer");
            return match self.state {
                State::SynReceived if self.initiation == Initiation::Listen => {
                    SegmentArrivesResult::Close
                }
                _ => SegmentArrivesResult::Reset,
            };
        }

        // Third: a SYN in a synchronized state draws a challenge ACK.
        if seg.ctl.syn() {
            self.queue_ack();
            return SegmentArrivesResult::Ok;
        }

        // Fourth: ACK processing. Segments without ACK are dropped.
        if !seg.ctl.ack() {
            return SegmentArrivesResult::Ok;
        }
        match self.process_ack(seg, now) {
            AckDisposition::Continue => {}
            AckDisposition::Drop => return SegmentArrivesResult::Ok,
            AckDisposition::Close => return SegmentArrivesResult::Close,
        }

        // Fifth: segment text.
        if !text.is_empty() {
            match self.state {
                State::Established | State::FinWait1 | State::FinWait2 => {
                    self.process_text(seg.seq, text, now);
                }
                _ => {
                    // Past CLOSE-WAIT the peer promised not to send.
                }
            }
        }

        // Sixth: FIN.
        if seg.ctl.fin() {
            self.process_fin(seg, seg_len, now);
        }

        SegmentArrivesResult::Ok
    }

    /// SYN-SENT handling: no sequence check applies yet.
    fn segment_in_syn_sent(&mut self, seg: &TcpHeader, now: Duration) -> SegmentArrivesResult {
        if seg.ctl.ack() {
            // The ACK must cover our SYN: in (ISS, SND.NXT].
            if seq_leq(seg.ack, self.snd.iss) || seq_gt(seg.ack, self.snd.nxt) {
                if !seg.ctl.rst() {
                    let rst = self.header_builder(seg.ack).rst().wnd(self.rcv.wnd);
                    self.push_oneshot(rst, &[]);
                }
                return SegmentArrivesResult::Ok;
            }
        }

        if seg.ctl.rst() {
            return if seg.ctl.ack() {
                tracing::debug!(id = %self.id, "connection refused");
                SegmentArrivesResult::Reset
            } else {
                SegmentArrivesResult::Ok
            };
        }

        if !seg.ctl.syn() {
            return SegmentArrivesResult::Ok;
        }

        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);
        self.record_peer_options(seg);

        if seg.ctl.ack() {
            self.snd.una = seg.ack;
            self.drop_acked(seg.ack, now);
            self.snd.wnd = seg.window;
            self.snd.wl1 = seg.seq;
            self.snd.wl2 = seg.ack;
            self.enter_established(now);
            self.queue_ack();
        } else {
            // Simultaneous open: re-issue our SYN as SYN+ACK.
            self.retransmit.clear();
            self.state = State::SynReceived;
            let syn_ack = self
                .header_builder(self.snd.iss)
                .syn()
                .ack(self.rcv.nxt)
                .wnd(self.rcv.wnd)
                .mss(self.mss);
            self.enqueue_control(syn_ack);
        }
        SegmentArrivesResult::Ok
    }

    /// ACK bit processing for synchronized states.
    fn process_ack(&mut self, seg: &TcpHeader, now: Duration) -> AckDisposition {
        if self.state == State::SynReceived {
            if seq_leq(self.snd.una, seg.ack) && seq_leq(seg.ack, self.snd.nxt) {
                self.snd.wnd = seg.window;
                self.snd.wl1 = seg.seq;
                self.snd.wl2 = seg.ack;
                if seq_lt(self.snd.una, seg.ack) {
                    self.advance_una(seg, now);
                }
                self.enter_established(now);
                return AckDisposition::Continue;
            }
            let rst = self.header_builder(seg.ack).rst().wnd(self.rcv.wnd);
            self.push_oneshot(rst, &[]);
            return AckDisposition::Drop;
        }

        if seq_lt(self.snd.una, seg.ack) && seq_leq(seg.ack, self.snd.nxt) {
            self.advance_una(seg, now);
        } else if seg.ack == self.snd.una {
            // Pure duplicate? Only if it carries nothing and changes nothing
            // while we have data outstanding.
            let window_unchanged = seg.window == self.snd.wnd;
            if window_unchanged && !self.retransmit.is_empty() {
                if self.congestion.on_duplicate_ack(self.snd.nxt) == AckSignal::FastRetransmit {
                    tracing::debug!(id = %self.id, "fast retransmit");
                    self.mark_oldest_for_retransmit();
                }
            } else if !window_unchanged {
                self.update_send_window(seg);
            }
        } else if seq_gt(seg.ack, self.snd.nxt) {
            // ACK for data never sent: challenge.
            self.queue_ack();
            return AckDisposition::Drop;
        }

        // Close-sequence transitions hang off whether our FIN is acked.
        match self.state {
            State::FinWait1 => {
                if self.fin_acked() {
                    self.state = State::FinWait2;
                }
            }
            State::Closing => {
                if self.fin_acked() {
                    self.enter_time_wait(now);
                }
            }
            State::LastAck => {
                if self.fin_acked() {
                    return AckDisposition::Close;
                }
            }
            _ => {}
        }
        AckDisposition::Continue
    }

    /// An acceptable ACK moved `snd_una` forward.
    fn advance_una(&mut self, seg: &TcpHeader, now: Duration) {
        let acked = self.drop_acked(seg.ack, now);
        self.snd.una = seg.ack;
        self.update_send_window(seg);
        self.acked_bytes += acked;
        self.rto_expiries = 0;
        if self.congestion.on_new_ack(acked, seg.ack) == AckSignal::PartialAck {
            // NewReno: the partial ACK exposes the next hole.
            self.mark_oldest_for_retransmit();
        }
        if self.retransmit.is_empty() {
            self.cancel(TimerKind::Retransmission);
        } else {
            // Outstanding data remains: restart the timer for it.
            self.arm(TimerKind::Retransmission, now + self.rtt.rto());
        }
    }

    fn update_send_window(&mut self, seg: &TcpHeader) {
        if seq_lt(self.snd.wl1, seg.seq)
            || (self.snd.wl1 == seg.seq && seq_leq(self.snd.wl2, seg.ack))
        {
            self.snd.wnd = seg.window;
            self.snd.wl1 = seg.seq;
            self.snd.wl2 = seg.ack;
        }
    }

    /// Remove fully-acknowledged segments from the retransmission queue and
    /// feed the RTT estimator. Returns payload bytes acknowledged.
    fn drop_acked(&mut self, ack: u32, now: Duration) -> u32 {
        let mut acked_bytes = 0u32;
        let mut sample = None;
        while let Some(front) = self.retransmit.front() {
            if seq_leq(front.segment.seq_end(), ack) {
                // Karn's rule: only never-retransmitted segments sample.
                if front.retransmit_count == 0 {
                    if let Some(first_sent) = front.first_sent {
                        sample = Some(now.saturating_sub(first_sent));
                    }
                }
                acked_bytes += front.segment.text.len() as u32;
                self.retransmit.pop_front();
            } else {
                break;
            }
        }
        if let Some(sample) = sample {
            self.rtt.update(sample);
        }
        acked_bytes
    }

    /// Payload processing for the data-transfer states.
    fn process_text(&mut self, seq: u32, text: Bytes, now: Duration) {
        if seq == self.rcv.nxt {
            self.accept_in_order(text, now);
        } else if seq_lt(seq, self.rcv.nxt) {
            // Retransmission overlapping what we already have: trim the
            // prefix once; any residue is in-order data.
            let overlap = self.rcv.nxt.wrapping_sub(seq) as usize;
            if overlap < text.len() {
                self.accept_in_order(text.slice(overlap..), now);
            } else {
                // Complete duplicate: re-ACK so the peer can move on.
                self.queue_ack();
            }
        } else {
            // A gap precedes this segment: park it and signal the hole with
            // a duplicate ACK.
            self.insert_out_of_order(seq, text);
            self.queue_ack();
        }
    }

    /// Accept data starting exactly at `rcv_nxt`, then drain whatever the
    /// out-of-order buffer can now contribute.
    fn accept_in_order(&mut self, text: Bytes, now: Duration) {
        self.rcv.nxt = self.rcv.nxt.wrapping_add(text.len() as u32);
        self.delivered.push_back(text);
        self.drain_out_of_order();
        self.schedule_ack(now);
    }

    fn insert_out_of_order(&mut self, seq: u32, text: Bytes) {
        let seq_end = seq.wrapping_add(text.len() as u32);
        let at = self
            .ooo
            .iter()
            .position(|existing| seq_lt(seq, existing.seq_start))
            .unwrap_or(self.ooo.len());
        // Identical replays of a parked segment are common under loss; keep
        // one copy.
        if self
            .ooo
            .iter()
            .any(|existing| existing.seq_start == seq && existing.seq_end == seq_end)
        {
            return;
        }
        self.ooo.insert(
            at,
            OooSegment {
                seq_start: seq,
                seq_end,
                text,
            },
        );
    }

    /// Pull newly-contiguous ranges out of the out-of-order buffer. On exit
    /// no buffered range starts below `rcv_nxt`.
    fn drain_out_of_order(&mut self) {
        while let Some(first) = self.ooo.first() {
            if seq_gt(first.seq_start, self.rcv.nxt) {
                break;
            }
            let first = self.ooo.remove(0);
            if seq_leq(first.seq_end, self.rcv.nxt) {
                // Entirely duplicate.
                continue;
            }
            let skip = self.rcv.nxt.wrapping_sub(first.seq_start) as usize;
            let text = first.text.slice(skip..);
            self.rcv.nxt = first.seq_end;
            self.delivered.push_back(text);
        }
    }

    /// FIN processing once data before it has been handled.
    fn process_fin(&mut self, seg: &TcpHeader, seg_len: u32, now: Duration) {
        let fin_seq = seg.seq.wrapping_add(seg_len).wrapping_sub(1);
        if fin_seq != self.rcv.nxt {
            // Data is still missing ahead of the FIN; the peer will
            // retransmit it all.
            return;
        }
        self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
        self.queue_ack();
        match self.state {
            State::SynReceived | State::Established => {
                tracing::debug!(id = %self.id, "peer sent FIN");
                self.state = State::CloseWait;
            }
            State::FinWait1 => {
                if self.fin_acked() {
                    self.enter_time_wait(now);
                } else {
                    self.state = State::Closing;
                }
            }
            State::FinWait2 => {
                self.enter_time_wait(now);
            }
            _ => {}
        }
    }

    /// Retransmission timer fired.
    pub fn on_retransmission_timeout(&mut self, now: Duration) -> RtoOutcome {
        self.rto_armed = false;
        if self.retransmit.is_empty() {
            return RtoOutcome::Retransmit;
        }
        self.rto_expiries += 1;
        if self.rto_expiries > self.tuning.max_retransmits {
            tracing::warn!(
                id = %self.id,
                tries = self.rto_expiries,
                "retransmission budget exhausted"
            );
            self.abort();
            return RtoOutcome::Abort;
        }
        self.mark_oldest_for_retransmit();
        self.rtt.backoff();
        self.congestion.on_timeout();
        self.arm(TimerKind::Retransmission, now + self.rtt.rto());
        RtoOutcome::Retransmit
    }

    /// Delayed-ACK timer fired.
    pub fn on_delayed_ack(&mut self) {
        if self.ack_pending {
            self.queue_ack();
        }
    }

    /// Connect-guard timer fired. True if the connection should be aborted.
    pub fn on_connect_timeout(&self) -> bool {
        matches!(self.state, State::SynSent | State::SynReceived)
    }

    /// Idle-sweep timer fired; returns the next deadline if the sweep should
    /// continue.
    pub fn on_keepalive(&mut self, now: Duration) -> Option<Duration> {
        if !self.state.proxy_alive() {
            return None;
        }
        let idle = now.saturating_sub(self.last_activity);
        if idle >= KEEPALIVE_INTERVAL {
            tracing::debug!(id = %self.id, idle_secs = idle.as_secs(), "flow idle");
        }
        Some(now + KEEPALIVE_INTERVAL)
    }

    /// Collect everything ready to transmit: fresh data within the send
    /// window, a queued FIN once the data drains, pure ACKs, and segments
    /// due for retransmission.
    pub fn take_segments(&mut self, now: Duration) -> Vec<Segment> {
        self.pump_data();
        self.pump_fin();

        let mut out: Vec<Segment> = self
            .oneshot
            .drain(..)
            .map(|header| Segment::new(header, Bytes::new()))
            .collect();

        let mut armed_retransmittable = false;
        for transmit in self.retransmit.iter_mut() {
            if transmit.needs_transmit {
                if transmit.first_sent.is_none() {
                    transmit.first_sent = Some(now);
                }
                transmit.needs_transmit = false;
                out.push(transmit.segment.clone());
                armed_retransmittable = true;
            }
        }
        if armed_retransmittable && !self.rto_armed {
            self.arm(TimerKind::Retransmission, now + self.rtt.rto());
        }

        // Any segment with an ACK satisfies a pending delayed ACK.
        if self.ack_pending && out.iter().any(|segment| segment.header.ctl.ack()) {
            self.ack_pending = false;
            self.cancel(TimerKind::DelayedAck);
        }
        out
    }

    /// Segmentize queued data within the effective send window.
    fn pump_data(&mut self) {
        if !matches!(
            self.state,
            State::Established | State::CloseWait | State::FinWait1 | State::LastAck
        ) {
            return;
        }
        let mss = self.congestion.mss() as usize;
        loop {
            if self.send_queue.is_empty() {
                break;
            }
            let window = (self.snd.wnd as u32).min(self.congestion.window());
            let budget = window.saturating_sub(self.bytes_in_flight()) as usize;
            let take = budget.min(mss).min(self.send_queue.len());
            if take == 0 {
                break;
            }
            let text = self.send_queue.split_to(take).freeze();
            let header = self
                .header_builder(self.snd.nxt)
                .psh()
                .ack(self.rcv.nxt)
                .wnd(self.rcv.wnd)
                .build(self.id.local.addr, self.id.remote.addr, &text);
            self.snd.nxt = self.snd.nxt.wrapping_add(take as u32);
            self.retransmit.push_back(Transmit::new(Segment::new(header, text)));
        }
    }

    /// Sequence the FIN once all queued data has been segmentized.
    fn pump_fin(&mut self) {
        if !self.fin_queued || !self.send_queue.is_empty() {
            return;
        }
        self.fin_queued = false;
        self.fin_sent = true;
        let fin = self
            .header_builder(self.snd.nxt)
            .fin()
            .ack(self.rcv.nxt)
            .wnd(self.rcv.wnd);
        self.enqueue_control(fin);
    }

    /// RFC 793 segment acceptability against the receive window.
    fn seq_acceptable(&self, seq: u32, seg_len: u32) -> bool {
        let wnd = self.rcv.wnd as u32;
        if seg_len == 0 {
            if wnd == 0 {
                seq == self.rcv.nxt
            } else {
                seq_in_window(seq, self.rcv.nxt, wnd)
            }
        } else if wnd == 0 {
            false
        } else {
            seq_in_window(seq, self.rcv.nxt, wnd)
                || seq_in_window(seq.wrapping_add(seg_len).wrapping_sub(1), self.rcv.nxt, wnd)
        }
    }

    fn fin_acked(&self) -> bool {
        self.fin_sent && self.snd.una == self.snd.nxt
    }

    fn enter_established(&mut self, now: Duration) {
        tracing::debug!(id = %self.id, "connection established");
        self.state = State::Established;
        self.cancel(TimerKind::ConnectTimeout);
        self.arm(TimerKind::Keepalive, now + KEEPALIVE_INTERVAL);
        if self.retransmit.is_empty() {
            self.cancel(TimerKind::Retransmission);
        }
    }

    fn enter_time_wait(&mut self, now: Duration) {
        self.state = State::TimeWait;
        self.cancel(TimerKind::Retransmission);
        self.arm(TimerKind::TimeWait, now + self.tuning.time_wait);
    }

    fn record_peer_options(&mut self, seg: &TcpHeader) {
        let options = TcpOptions::parse(&seg.options);
        if let Some(mss) = options.mss {
            self.peer_mss = mss;
        }
        self.congestion.set_mss(self.mss.min(self.peer_mss) as u32);
    }

    fn mark_oldest_for_retransmit(&mut self) {
        if let Some(oldest) = self.retransmit.front_mut() {
            oldest.needs_transmit = true;
            oldest.retransmit_count += 1;
        }
    }

    /// Queue an immediate ACK at the current receive edge, superseding any
    /// delayed ACK.
    fn queue_ack(&mut self) {
        let ack = self
            .header_builder(self.snd.nxt)
            .ack(self.rcv.nxt)
            .wnd(self.rcv.wnd);
        self.push_oneshot(ack, &[]);
        if self.ack_pending {
            self.ack_pending = false;
            self.cancel(TimerKind::DelayedAck);
        }
    }

    /// Defer an ACK briefly; a second in-order arrival flushes immediately,
    /// acknowledging at least every other segment.
    fn schedule_ack(&mut self, now: Duration) {
        if self.ack_pending {
            self.queue_ack();
        } else {
            self.ack_pending = true;
            self.arm(TimerKind::DelayedAck, now + ACK_DELAY);
        }
    }

    fn header_builder(&self, seq: u32) -> TcpHeaderBuilder {
        TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
    }

    /// Finish a payload-less header and queue it: SYN and FIN go on the
    /// retransmission queue, everything else is fire-and-forget.
    fn enqueue_control(&mut self, builder: TcpHeaderBuilder) {
        let header = builder.build(self.id.local.addr, self.id.remote.addr, &[]);
        if header.ctl.syn() || header.ctl.fin() {
            if header.ctl.fin() {
                self.snd.nxt = self.snd.nxt.wrapping_add(1);
            }
            self.retransmit
                .push_back(Transmit::new(Segment::new(header, Bytes::new())));
        } else {
            self.oneshot.push(header);
        }
    }

    fn push_oneshot(&mut self, builder: TcpHeaderBuilder, payload: &[u8]) {
        let header = builder.build(self.id.local.addr, self.id.remote.addr, payload);
        self.oneshot.push(header);
    }

    fn arm(&mut self, kind: TimerKind, deadline: Duration) {
        if kind == TimerKind::Retransmission {
            self.rto_armed = true;
        }
        self.timer_ops.push(TimerOp {
            kind,
            deadline: Some(deadline),
        });
    }

    fn cancel(&mut self, kind: TimerKind) {
        if kind == TimerKind::Retransmission {
            self.rto_armed = false;
        }
        self.timer_ops.push(TimerOp {
            kind,
            deadline: None,
        });
    }
}

/// What ACK processing decided about the rest of the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckDisposition {
    Continue,
    Drop,
    Close,
}

/// A segment arrived for a connection in CLOSED, i.e. one we know nothing
/// about. Everything but a RST draws a RST.
pub fn segment_arrives_closed(
    seg: &TcpHeader,
    text_len: u32,
    local: Ipv4Addr,
    remote: Ipv4Addr,
) -> Option<TcpHeader> {
    if seg.ctl.rst() {
        return None;
    }
    let builder = if seg.ctl.ack() {
        TcpHeaderBuilder::new(seg.dst_port, seg.src_port, seg.ack).rst()
    } else {
        let seg_len = text_len + seg.ctl.syn() as u32 + seg.ctl.fin() as u32;
        TcpHeaderBuilder::new(seg.dst_port, seg.src_port, 0)
            .rst()
            .ack(seg.seq.wrapping_add(seg_len))
    };
    Some(builder.build(local, remote, &[]))
}

/// Outcome of a segment arriving on a listening port.
#[must_use]
#[derive(Debug)]
pub enum ListenResult {
    /// A connection block was created in SYN-RECEIVED with the SYN+ACK
    /// queued.
    Tcb(Box<Tcb>),
    /// The segment only warranted a reply.
    Response(TcpHeader),
}

/// A segment arrived for a port we serve but no existing connection.
pub fn segment_arrives_listen(
    seg: &TcpHeader,
    id: FlowId,
    iss: u32,
    tuning: &TcpTuning,
    now: Duration,
) -> Option<ListenResult> {
    if seg.ctl.rst() {
        return None;
    }
    if seg.ctl.ack() {
        // Nothing to acknowledge on a fresh connection.
        let header = TcpHeaderBuilder::new(id.local.port, id.remote.port, seg.ack)
            .rst()
            .build(id.local.addr, id.remote.addr, &[]);
        return Some(ListenResult::Response(header));
    }
    if !seg.ctl.syn() {
        return None;
    }

    let rcv_nxt = seg.seq.wrapping_add(1);
    let mut tcb = Tcb::new(
        id,
        Initiation::Listen,
        State::SynReceived,
        SendSequenceSpace {
            iss,
            una: iss,
            nxt: iss.wrapping_add(1),
            wnd: seg.window,
            wl1: seg.seq,
            wl2: seg.ack,
        },
        ReceiveSequenceSpace {
            irs: seg.seq,
            nxt: rcv_nxt,
            ..Default::default()
        },
        tuning,
        now,
    );
    tcb.record_peer_options(seg);
    let syn_ack = tcb
        .header_builder(iss)
        .syn()
        .ack(rcv_nxt)
        .wnd(tcb.rcv.wnd)
        .mss(tcb.mss);
    tcb.enqueue_control(syn_ack);
    tcb.arm(TimerKind::ConnectTimeout, now + tuning.connect_timeout);
    Some(ListenResult::Tcb(Box::new(tcb)))
}
