//! The TCP engine: connection table, segment demultiplexing, timer pump, and
//! egress assembly.
//!
//! [`TcpStack`] owns every [`Tcb`] plus the timer heap that drives them. It
//! is called only from the bridge task, so the table needs no locking; the
//! proxy and forwarder tasks reach it through the bridge's event channel.
//! Work the stack wants done in the async world (transmitting packets,
//! opening service sockets, starting proxies) comes out as [`Action`]s.

pub mod congestion;
pub mod modular;
pub mod rtt;
pub mod tcb;

use crate::config::{Config, Role};
use crate::stats::{self, LinkStats};
use crate::timer::{ArmedSlots, TimerKind, TimerQueue};
use crate::wire::{ipv4, tcp};
use bytes::Bytes;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use self::tcb::{
    segment_arrives_closed, segment_arrives_listen, Endpoint, FlowId, Initiation, ListenResult,
    RtoOutcome, SegmentArrivesResult, Tcb,
};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

/// Synthetic source ports for client-initiated flows.
const SYNTHETIC_PORT_RANGE: std::ops::Range<u16> = 30000..60000;

/// Work for the bridge to carry out after a stack call.
#[derive(Debug)]
pub enum Action {
    /// A complete IPv4 packet to frame and write to the serial link.
    Transmit(Bytes),
    /// First in-order data arrived on a host-mode flow: open the mapped
    /// service socket and attach a proxy.
    OpenService { id: FlowId, port: u16 },
    /// A client-initiated flow reached ESTABLISHED: attach the accepted
    /// socket's proxy.
    ClientEstablished { id: FlowId },
    /// In-order payload for the flow's proxy queue.
    Deliver { id: FlowId, data: Bytes },
    /// The peer sent FIN: no more data will arrive for the service; close
    /// the write side after the queue drains.
    PeerFin { id: FlowId },
    /// The flow left the data-transfer states or was removed: cancel the
    /// proxy pair and drop its handles.
    FlowClosed { id: FlowId, reset: bool },
}

/// Per-flow bookkeeping the TCB itself does not carry.
struct Flow {
    tcb: Tcb,
    armed: ArmedSlots,
    /// Host mode: the service-open action has been emitted.
    service_requested: bool,
    /// A proxy pair is attached and deliveries flow.
    proxy_attached: bool,
    /// The PeerFin action has been emitted.
    peer_fin_notified: bool,
    /// The FlowClosed action has been emitted.
    teardown_notified: bool,
    /// Client mode: the accepted local socket, parked until ESTABLISHED.
    client_socket: Option<TcpStream>,
    /// Send-credit replenished as the peer acknowledges data.
    credit: Option<Arc<Semaphore>>,
}

impl Flow {
    fn new(tcb: Tcb) -> Self {
        Self {
            tcb,
            armed: ArmedSlots::default(),
            service_requested: false,
            proxy_attached: false,
            peer_fin_notified: false,
            teardown_notified: false,
            client_socket: None,
            credit: None,
        }
    }
}

/// The engine. One per serial session.
pub struct TcpStack {
    config: Arc<Config>,
    flows: FxHashMap<FlowId, Flow>,
    timers: TimerQueue<FlowId>,
    actions: Vec<Action>,
    ip_id: u16,
    rng: SmallRng,
    stats: Arc<LinkStats>,
}

impl TcpStack {
    pub fn new(config: Arc<Config>, stats: Arc<LinkStats>) -> Self {
        Self {
            config,
            flows: FxHashMap::default(),
            timers: TimerQueue::new(),
            actions: Vec::new(),
            ip_id: 0,
            rng: SmallRng::from_entropy(),
            stats,
        }
    }

    /// Actions accumulated since the last drain. The bridge applies them in
    /// order.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn flow_state(&self, id: &FlowId) -> Option<tcb::State> {
        self.flows.get(id).map(|flow| flow.tcb.state())
    }

    /// An IPv4 packet arrived over the link.
    pub fn handle_packet(&mut self, packet: &[u8], now: Duration) {
        let (header, payload) = match ipv4::parse(packet) {
            Ok(parsed) => parsed,
            Err(ipv4::Ipv4ParseError::InvalidChecksum) => {
                stats::bump(&self.stats.checksum_drops);
                return;
            }
            Err(error) => {
                tracing::debug!(%error, "dropping malformed IP packet");
                return;
            }
        };
        if header.protocol != ipv4::PROTOCOL_TCP {
            tracing::debug!(protocol = header.protocol, "dropping non-TCP packet");
            return;
        }
        if header.is_fragment() {
            tracing::debug!("dropping IP fragment");
            return;
        }

        let (seg, text) = match tcp::parse(payload, header.source, header.destination) {
            Ok(parsed) => parsed,
            Err(tcp::TcpParseError::InvalidChecksum) => {
                stats::bump(&self.stats.checksum_drops);
                return;
            }
            Err(error) => {
                tracing::debug!(%error, "dropping malformed TCP segment");
                return;
            }
        };
        stats::bump(&self.stats.segments_in);

        let id = FlowId {
            local: Endpoint {
                addr: header.destination,
                port: seg.dst_port,
            },
            remote: Endpoint {
                addr: header.source,
                port: seg.src_port,
            },
        };

        if self.flows.contains_key(&id) {
            self.segment_for_flow(id, &seg, text, now);
        } else {
            self.segment_without_flow(id, &seg, text, now);
        }
    }

    fn segment_for_flow(&mut self, id: FlowId, seg: &tcp::TcpHeader, text: Bytes, now: Duration) {
        let flow = self.flows.get_mut(&id).expect("flow checked");
        let result = flow.tcb.segment_arrives(seg, text, now);
        self.after_tcb(id, now);
        match result {
            SegmentArrivesResult::Ok => {}
            SegmentArrivesResult::Close => self.remove_flow(id, false),
            SegmentArrivesResult::Reset => self.remove_flow(id, true),
        }
    }

    /// No block matches: LISTEN semantics for a serviceable SYN in host
    /// mode, CLOSED semantics for everything else.
    fn segment_without_flow(
        &mut self,
        id: FlowId,
        seg: &tcp::TcpHeader,
        text: Bytes,
        now: Duration,
    ) {
        let fresh_syn = seg.ctl.syn() && !seg.ctl.ack();
        let serviceable = self.config.role == Role::Host
            && self.config.services.contains_key(&seg.dst_port);
        if fresh_syn && serviceable {
            let iss = self.rng.gen_range(1..=u32::MAX / 2);
            match segment_arrives_listen(seg, id, iss, &self.config.tcp, now) {
                Some(ListenResult::Tcb(tcb)) => {
                    tracing::info!(%id, "accepting connection");
                    stats::bump(&self.stats.connections_opened);
                    self.flows.insert(id, Flow::new(*tcb));
                    let _ = text; // a SYN's payload is not expected and not queued
                    self.after_tcb(id, now);
                }
                Some(ListenResult::Response(header)) => {
                    let packet = self.assemble(&tcb::Segment::new(header, Bytes::new()), id);
                    self.actions.push(Action::Transmit(packet));
                }
                None => {}
            }
        } else {
            if fresh_syn {
                tracing::debug!(%id, "refusing connection to unmapped port");
            }
            if let Some(header) =
                segment_arrives_closed(seg, text.len() as u32, id.local.addr, id.remote.addr)
            {
                let packet = self.assemble(&tcb::Segment::new(header, Bytes::new()), id);
                self.actions.push(Action::Transmit(packet));
            }
        }
    }

    /// Open a synthetic flow toward the peer for an accepted local socket
    /// (client mode). The SYN rides the normal egress and retransmission
    /// machinery.
    pub fn active_open(&mut self, remote_port: u16, socket: TcpStream, now: Duration) -> FlowId {
        let id = self.allocate_flow_id(remote_port);
        let iss = self.rng.gen_range(1..=u32::MAX / 2);
        let tcb = Tcb::open(id, iss, &self.config.tcp, now);
        let mut flow = Flow::new(tcb);
        flow.client_socket = Some(socket);
        tracing::info!(%id, "opening connection toward peer");
        stats::bump(&self.stats.connections_opened);
        self.flows.insert(id, flow);
        self.after_tcb(id, now);
        id
    }

    fn allocate_flow_id(&mut self, remote_port: u16) -> FlowId {
        loop {
            let port = self.rng.gen_range(SYNTHETIC_PORT_RANGE);
            let id = FlowId {
                local: Endpoint {
                    addr: self.config.local_ip,
                    port,
                },
                remote: Endpoint {
                    addr: self.config.remote_ip,
                    port: remote_port,
                },
            };
            if !self.flows.contains_key(&id) {
                return id;
            }
        }
    }

    /// Bytes read from the native socket: queue toward the peer.
    pub fn send_flow(&mut self, id: FlowId, data: &[u8], now: Duration) {
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.tcb.send(data);
            self.after_tcb(id, now);
        }
    }

    /// The native socket reached EOF: orderly close toward the peer.
    pub fn close_flow(&mut self, id: FlowId, now: Duration) {
        if let Some(flow) = self.flows.get_mut(&id) {
            tracing::debug!(%id, "service closed; sending FIN");
            flow.tcb.close();
            self.after_tcb(id, now);
        }
    }

    /// Abort with a RST and release the flow: connect failures, proxy
    /// errors, retry exhaustion.
    pub fn abort_flow(&mut self, id: FlowId, now: Duration) {
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.tcb.abort();
            self.after_tcb(id, now);
            self.remove_flow(id, true);
        }
    }

    /// A proxy pair is up for the flow; deliveries may start and ACK credit
    /// feeds its reader.
    pub fn attach_proxy(&mut self, id: FlowId, credit: Arc<Semaphore>, now: Duration) {
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.proxy_attached = true;
            flow.credit = Some(credit);
            self.after_tcb(id, now);
        }
    }

    /// Take the parked client socket once the flow is ESTABLISHED.
    pub fn take_client_socket(&mut self, id: FlowId) -> Option<TcpStream> {
        self.flows
            .get_mut(&id)
            .and_then(|flow| flow.client_socket.take())
    }

    /// Timer pump, run on the scheduler's cadence.
    pub fn on_tick(&mut self, now: Duration) {
        while let Some(expired) = self.timers.pop_due(now) {
            let id = expired.key;
            let Some(flow) = self.flows.get_mut(&id) else {
                continue;
            };
            if !flow.armed.is_live(expired.kind, expired.deadline) {
                // Cancelled or superseded; lazy removal.
                continue;
            }
            flow.armed.set(expired.kind, None);
            match expired.kind {
                TimerKind::Retransmission => match flow.tcb.on_retransmission_timeout(now) {
                    RtoOutcome::Retransmit => {
                        stats::bump(&self.stats.retransmits);
                        self.after_tcb(id, now);
                    }
                    RtoOutcome::Abort => {
                        self.after_tcb(id, now);
                        self.remove_flow(id, true);
                    }
                },
                TimerKind::TimeWait => {
                    tracing::debug!(%id, "TIME-WAIT expired");
                    self.remove_flow(id, false);
                }
                TimerKind::DelayedAck => {
                    flow.tcb.on_delayed_ack();
                    self.after_tcb(id, now);
                }
                TimerKind::ConnectTimeout => {
                    if flow.tcb.on_connect_timeout() {
                        tracing::debug!(%id, "handshake timed out");
                        self.abort_flow(id, now);
                    }
                }
                TimerKind::Keepalive => {
                    if let Some(next) = flow.tcb.on_keepalive(now) {
                        flow.armed.set(TimerKind::Keepalive, Some(next));
                        self.timers.arm(TimerKind::Keepalive, id, next);
                    }
                }
            }
        }
    }

    /// Session teardown: reset every live flow and emit the RSTs.
    pub fn abort_all(&mut self, now: Duration) {
        let ids: Vec<FlowId> = self.flows.keys().copied().collect();
        for id in ids {
            self.abort_flow(id, now);
        }
    }

    /// Post-processing after any TCB interaction: proxy lifecycle actions,
    /// deliveries, credit, egress, and timer maintenance.
    fn after_tcb(&mut self, id: FlowId, now: Duration) {
        let Some(flow) = self.flows.get_mut(&id) else {
            return;
        };
        let state = flow.tcb.state();

        // Host mode: the first in-order data opens the service socket.
        if flow.tcb.initiation() == Initiation::Listen
            && !flow.service_requested
            && flow.tcb.has_delivered()
        {
            flow.service_requested = true;
            self.actions.push(Action::OpenService {
                id,
                port: id.local.port,
            });
        }

        // Client mode: hand the parked socket over once established.
        if flow.tcb.initiation() == Initiation::Open
            && state == tcb::State::Established
            && flow.client_socket.is_some()
            && !flow.proxy_attached
            && !flow.service_requested
        {
            flow.service_requested = true;
            self.actions.push(Action::ClientEstablished { id });
        }

        if flow.proxy_attached {
            for data in flow.tcb.take_delivered() {
                self.actions.push(Action::Deliver { id, data });
            }
        }

        let acked = flow.tcb.take_acked_bytes();
        if acked > 0 {
            if let Some(credit) = &flow.credit {
                credit.add_permits(acked as usize);
            }
        }

        if state == tcb::State::CloseWait && !flow.peer_fin_notified {
            flow.peer_fin_notified = true;
            self.actions.push(Action::PeerFin { id });
        }

        if flow.proxy_attached && !state.proxy_alive() && !flow.teardown_notified {
            flow.teardown_notified = true;
            self.actions.push(Action::FlowClosed { id, reset: false });
        }

        for segment in flow.tcb.take_segments(now) {
            stats::bump(&self.stats.segments_out);
            self.ip_id = self.ip_id.wrapping_add(1);
            let packet = ipv4::build(
                id.local.addr,
                id.remote.addr,
                ipv4::PROTOCOL_TCP,
                self.ip_id,
                &segment.to_bytes(),
            );
            self.actions.push(Action::Transmit(packet));
        }

        for op in flow.tcb.take_timer_ops() {
            flow.armed.set(op.kind, op.deadline);
            if let Some(deadline) = op.deadline {
                self.timers.arm(op.kind, id, deadline);
            }
        }
    }

    fn remove_flow(&mut self, id: FlowId, reset: bool) {
        if let Some(flow) = self.flows.remove(&id) {
            tracing::info!(%id, reset, state = ?flow.tcb.state(), "flow removed");
            stats::bump(&self.stats.connections_closed);
            if !flow.teardown_notified {
                self.actions.push(Action::FlowClosed { id, reset });
            }
        }
    }

    /// Build the IPv4 packet for a segment that has no flow, e.g. a RST.
    fn assemble(&mut self, segment: &tcb::Segment, id: FlowId) -> Bytes {
        stats::bump(&self.stats.segments_out);
        ipv4::build(
            id.local.addr,
            id.remote.addr,
            ipv4::PROTOCOL_TCP,
            self.next_ip_id(),
            &segment.to_bytes(),
        )
    }

    fn next_ip_id(&mut self) -> u16 {
        self.ip_id = self.ip_id.wrapping_add(1);
        self.ip_id
    }
}
