//! LCP and IPCP negotiation and link keepalive (RFC 1661, RFC 1332).
//!
//! The negotiator is sans-I/O: callers feed it decoded frames and tick it
//! with the session clock; it hands back frames to transmit and events for
//! the bridge. One [`Ppp`] instance runs both control protocols, since IPCP
//! starts automatically when LCP opens and both die with the link.
//!
//! Authentication is not supported: an Auth-Protocol option is
//! Configure-Rejected, and PAP/CHAP packets draw an LCP Protocol-Reject.
//! Protocol- and Address/Control-Field-Compression are likewise never
//! proposed and always rejected, so the frames on the wire always match the
//! negotiated contract.

pub mod packet;

use crate::config::Config;
use bytes::Bytes;
use self::packet::{ipcp_opt, lcp_opt, proto, Code, ConfigOption, ControlPacket};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

/// Negotiation state of one control protocol, the subset of the RFC 1661
/// automaton this implementation moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppState {
    /// Lower layer up, nothing sent or received yet.
    Initial,
    /// Host side: waiting for the peer's first Configure-Request.
    Starting,
    /// Our Configure-Request is in flight.
    ReqSent,
    /// The peer acknowledged our request; theirs is still outstanding.
    AckRcvd,
    /// We acknowledged the peer's request; ours is still outstanding.
    AckSent,
    /// Both requests acknowledged.
    Opened,
    /// The protocol was taken down.
    Closed,
}

/// What the bridge needs to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppEvent {
    LcpOpened,
    /// Both protocols are open; IP traffic may now flow.
    IpcpOpened,
    /// The peer asked to terminate the link.
    LinkTerminated,
}

/// Frames to transmit and events raised by one negotiator call.
#[derive(Debug, Default)]
pub struct PppOutput {
    /// Complete PPP frames (header included), ready for the framer.
    pub frames: Vec<Bytes>,
    pub events: Vec<PppEvent>,
}

impl PppOutput {
    fn frame(&mut self, frame: Bytes) {
        self.frames.push(frame);
    }

    fn event(&mut self, event: PppEvent) {
        self.events.push(event);
    }
}

/// Configure-Request retransmission gave up.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{protocol} negotiation failed after {attempts} configure attempts")]
pub struct NegotiationError {
    pub protocol: &'static str,
    pub attempts: u32,
}

/// Book-keeping common to LCP and IPCP.
#[derive(Debug)]
struct Negotiation {
    name: &'static str,
    protocol: u16,
    state: PppState,
    next_identifier: u8,
    /// Identifiers of requests in flight, by send time.
    outstanding: FxHashMap<u8, Duration>,
    /// Configure attempts since the last acknowledgement.
    attempts: u32,
    /// Option kinds the peer Configure-Rejected; omitted from resends.
    rejected: Vec<u8>,
}

impl Negotiation {
    fn new(name: &'static str, protocol: u16) -> Self {
        Self {
            name,
            protocol,
            state: PppState::Initial,
            next_identifier: 0,
            outstanding: FxHashMap::default(),
            attempts: 0,
            rejected: Vec::new(),
        }
    }

    fn next_identifier(&mut self) -> u8 {
        self.next_identifier = self.next_identifier.wrapping_add(1);
        self.next_identifier
    }

    /// Record our own Configure-Request going out.
    fn note_request(&mut self, identifier: u8, now: Duration) {
        self.outstanding.insert(identifier, now);
        self.attempts += 1;
        if self.state == PppState::Initial || self.state == PppState::Starting {
            self.state = PppState::ReqSent;
        }
    }

    /// Whether a response identifier matches a request of ours.
    fn take_outstanding(&mut self, identifier: u8) -> bool {
        self.outstanding.remove(&identifier).is_some()
    }

    /// State change when we send a Configure-Ack. Returns true if the
    /// protocol just opened.
    fn ack_sent(&mut self) -> bool {
        match self.state {
            PppState::ReqSent => {
                self.state = PppState::AckSent;
                false
            }
            PppState::AckRcvd => {
                self.state = PppState::Opened;
                true
            }
            _ => false,
        }
    }

    /// State change when the peer acknowledges our request. Returns true if
    /// the protocol just opened.
    fn ack_received(&mut self) -> bool {
        self.attempts = 0;
        match self.state {
            PppState::ReqSent => {
                self.state = PppState::AckRcvd;
                false
            }
            PppState::AckSent => {
                self.state = PppState::Opened;
                true
            }
            _ => false,
        }
    }

    fn is_opened(&self) -> bool {
        self.state == PppState::Opened
    }

    /// The most recent outstanding send time, if any request is in flight.
    fn newest_outstanding(&self) -> Option<Duration> {
        self.outstanding.values().copied().max()
    }
}

/// The PPP negotiator for one serial session.
#[derive(Debug)]
pub struct Ppp {
    is_server: bool,
    lcp: Negotiation,
    ipcp: Negotiation,
    magic: u32,
    peer_magic: u32,
    mru: u16,
    peer_mru: u16,
    local_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
    echo_interval: Duration,
    restart_timer: Duration,
    max_configure: u32,
    last_echo: Duration,
    rng: SmallRng,
}

impl Ppp {
    pub fn new(config: &Config) -> Self {
        let mut rng = SmallRng::from_entropy();
        let magic = config
            .magic_number
            .unwrap_or_else(|| rng.gen_range(1..=u32::MAX));
        Self {
            is_server: config.role == crate::config::Role::Host,
            lcp: Negotiation::new("LCP", proto::LCP),
            ipcp: Negotiation::new("IPCP", proto::IPCP),
            magic,
            peer_magic: 0,
            mru: config.mru,
            peer_mru: config.mru,
            local_ip: config.local_ip,
            remote_ip: config.remote_ip,
            echo_interval: config.echo_interval,
            restart_timer: config.restart_timer,
            max_configure: config.max_configure,
            last_echo: Duration::ZERO,
            rng,
        }
    }

    /// Begin negotiation. The client fires the first Configure-Request; the
    /// host waits indefinitely for the client's.
    pub fn start(&mut self, now: Duration) -> PppOutput {
        let mut out = PppOutput::default();
        if self.is_server {
            tracing::info!("waiting for peer to start LCP negotiation");
            self.lcp.state = PppState::Starting;
        } else {
            tracing::info!(
                magic = %format_args!("{:#010x}", self.magic),
                "starting LCP negotiation"
            );
            let frame = self.configure_request(Protocol::Lcp, now);
            out.frame(frame);
        }
        out
    }

    /// IP traffic is processed only when both LCP and IPCP are open.
    pub fn ready_for_ip(&self) -> bool {
        self.lcp.is_opened() && self.ipcp.is_opened()
    }

    pub fn lcp_state(&self) -> PppState {
        self.lcp.state
    }

    pub fn ipcp_state(&self) -> PppState {
        self.ipcp.state
    }

    /// The MRU the peer asked us to respect.
    pub fn peer_mru(&self) -> u16 {
        self.peer_mru
    }

    /// Process one decoded control frame.
    pub fn handle_frame(&mut self, frame: &[u8], now: Duration) -> PppOutput {
        let mut out = PppOutput::default();
        let (protocol, packet) = match ControlPacket::parse(frame) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::debug!(%error, "dropping malformed control frame");
                return out;
            }
        };
        match protocol {
            proto::LCP => self.handle_lcp(packet, now, &mut out),
            proto::IPCP => {
                if self.lcp.is_opened() {
                    self.handle_ipcp(packet, now, &mut out);
                } else {
                    tracing::warn!("IPCP packet before LCP is open; dropping");
                }
            }
            proto::PAP | proto::CHAP => {
                tracing::debug!(
                    protocol = %format_args!("{protocol:#06x}"),
                    "rejecting authentication protocol"
                );
                out.frame(self.protocol_reject(protocol, frame));
            }
            other => {
                tracing::debug!(
                    protocol = %format_args!("{other:#06x}"),
                    "ignoring unsupported protocol"
                );
            }
        }
        out
    }

    /// Drive retransmission and keepalive. Called on a one-second cadence.
    pub fn on_tick(&mut self, now: Duration) -> Result<PppOutput, NegotiationError> {
        let mut out = PppOutput::default();
        let restart_timer = self.restart_timer;
        let max_configure = self.max_configure;
        for which in [Protocol::Lcp, Protocol::Ipcp] {
            let nego = self.negotiation(which);
            let due = match nego.newest_outstanding() {
                Some(sent) => now.saturating_sub(sent) >= restart_timer,
                None => false,
            };
            if !due {
                continue;
            }
            if nego.attempts > max_configure {
                let error = NegotiationError {
                    protocol: nego.name,
                    attempts: nego.attempts,
                };
                tracing::error!(%error, "negotiation abandoned");
                return Err(error);
            }
            nego.outstanding.clear();
            tracing::debug!(
                protocol = nego.name,
                "configure-request timed out; resending"
            );
            let frame = self.configure_request(which, now);
            out.frame(frame);
        }

        if self.lcp.is_opened() && now.saturating_sub(self.last_echo) >= self.echo_interval {
            self.last_echo = now;
            let identifier = self.lcp.next_identifier();
            let echo = ControlPacket::new(Code::EchoRequest, identifier, self.magic.to_be_bytes().to_vec());
            tracing::debug!(identifier, "sending LCP echo-request");
            out.frame(echo.to_frame(proto::LCP));
        }
        Ok(out)
    }

    fn negotiation(&mut self, which: Protocol) -> &mut Negotiation {
        match which {
            Protocol::Lcp => &mut self.lcp,
            Protocol::Ipcp => &mut self.ipcp,
        }
    }

    /// Build and record our Configure-Request for one protocol.
    fn configure_request(&mut self, which: Protocol, now: Duration) -> Bytes {
        let mut options = match which {
            Protocol::Lcp => vec![
                ConfigOption::u32_value(lcp_opt::MAGIC_NUMBER, self.magic),
                ConfigOption::u16_value(lcp_opt::MRU, self.mru),
            ],
            Protocol::Ipcp => vec![ConfigOption::new(
                ipcp_opt::IP_ADDRESS,
                self.local_ip.octets().to_vec(),
            )],
        };
        let nego = self.negotiation(which);
        options.retain(|option| !nego.rejected.contains(&option.kind));
        let identifier = nego.next_identifier();
        nego.note_request(identifier, now);
        tracing::debug!(protocol = nego.name, identifier, "sending configure-request");
        let protocol = nego.protocol;
        ControlPacket::with_options(Code::ConfigureRequest, identifier, &options).to_frame(protocol)
    }

    fn handle_lcp(&mut self, packet: ControlPacket, now: Duration, out: &mut PppOutput) {
        match packet.code {
            Code::ConfigureRequest => self.lcp_request(packet, now, out),
            Code::ConfigureAck => {
                if self.lcp.take_outstanding(packet.identifier) {
                    if self.lcp.ack_received() {
                        tracing::info!("LCP opened");
                        out.event(PppEvent::LcpOpened);
                    }
                } else {
                    tracing::debug!(identifier = packet.identifier, "stale LCP configure-ack");
                }
            }
            Code::ConfigureNak => {
                if self.lcp.take_outstanding(packet.identifier) {
                    self.apply_lcp_hints(&packet);
                    let frame = self.configure_request(Protocol::Lcp, now);
                    out.frame(frame);
                }
            }
            Code::ConfigureReject => {
                if self.lcp.take_outstanding(packet.identifier) {
                    self.note_rejected(Protocol::Lcp, &packet);
                    let frame = self.configure_request(Protocol::Lcp, now);
                    out.frame(frame);
                }
            }
            Code::EchoRequest => {
                if self.lcp.is_opened() {
                    tracing::debug!(identifier = packet.identifier, "answering LCP echo-request");
                    let reply = ControlPacket::new(
                        Code::EchoReply,
                        packet.identifier,
                        self.magic.to_be_bytes().to_vec(),
                    );
                    out.frame(reply.to_frame(proto::LCP));
                } else {
                    tracing::debug!("echo-request before LCP open; dropping");
                }
            }
            Code::EchoReply => {
                if let Ok(magic) = <[u8; 4]>::try_from(packet.data.get(..4).unwrap_or_default()) {
                    let magic = u32::from_be_bytes(magic);
                    if self.peer_magic != 0 && magic != self.peer_magic {
                        tracing::warn!(
                            expected = %format_args!("{:#010x}", self.peer_magic),
                            got = %format_args!("{magic:#010x}"),
                            "echo-reply magic mismatch"
                        );
                    }
                }
            }
            Code::TerminateRequest => {
                tracing::info!("peer requested link termination");
                let ack = ControlPacket::new(Code::TerminateAck, packet.identifier, Bytes::new());
                out.frame(ack.to_frame(proto::LCP));
                self.lcp.state = PppState::Closed;
                self.ipcp.state = PppState::Closed;
                out.event(PppEvent::LinkTerminated);
            }
            Code::TerminateAck | Code::CodeReject | Code::ProtocolReject | Code::DiscardRequest => {
                tracing::debug!(code = ?packet.code, "LCP control code noted");
            }
        }
        // IPCP rides up as soon as LCP is open.
        if self.lcp.is_opened() && self.ipcp.state == PppState::Initial {
            let frame = self.configure_request(Protocol::Ipcp, now);
            out.frame(frame);
        }
    }

    fn handle_ipcp(&mut self, packet: ControlPacket, now: Duration, out: &mut PppOutput) {
        match packet.code {
            Code::ConfigureRequest => self.ipcp_request(packet, out),
            Code::ConfigureAck => {
                if self.ipcp.take_outstanding(packet.identifier) {
                    if self.ipcp.ack_received() {
                        tracing::info!("IPCP opened; IP layer ready");
                        out.event(PppEvent::IpcpOpened);
                    }
                }
            }
            Code::ConfigureNak => {
                if self.ipcp.take_outstanding(packet.identifier) {
                    // The peer may suggest a different address for us, but
                    // the configured addressing is authoritative for the
                    // stack, so the hint is only logged.
                    if let Ok(options) = packet.options() {
                        for option in options {
                            if option.kind == ipcp_opt::IP_ADDRESS {
                                tracing::debug!(hint = ?option.data, "peer naked our IP address");
                            }
                        }
                    }
                    let frame = self.configure_request(Protocol::Ipcp, now);
                    out.frame(frame);
                }
            }
            Code::ConfigureReject => {
                if self.ipcp.take_outstanding(packet.identifier) {
                    self.note_rejected(Protocol::Ipcp, &packet);
                    let frame = self.configure_request(Protocol::Ipcp, now);
                    out.frame(frame);
                }
            }
            Code::TerminateRequest => {
                let ack = ControlPacket::new(Code::TerminateAck, packet.identifier, Bytes::new());
                out.frame(ack.to_frame(proto::IPCP));
                self.ipcp.state = PppState::Closed;
            }
            other => {
                tracing::debug!(code = ?other, "ignoring IPCP code");
            }
        }
    }

    /// Evaluate a peer LCP Configure-Request and respond.
    fn lcp_request(&mut self, packet: ControlPacket, now: Duration, out: &mut PppOutput) {
        let options = match packet.options() {
            Ok(options) => options,
            Err(error) => {
                tracing::debug!(%error, "dropping LCP configure-request");
                return;
            }
        };

        // A host that was waiting now knows the client is there. Our own
        // request is built first, so the state machine sees it as sent, but
        // it goes on the wire after the reply below.
        let own_request = if self.is_server && self.lcp.state == PppState::Starting {
            Some(self.configure_request(Protocol::Lcp, now))
        } else {
            None
        };

        let mut rejected = Vec::new();
        let mut naked = Vec::new();
        for option in &options {
            match option.kind {
                lcp_opt::MAGIC_NUMBER => match option.as_u32() {
                    Some(magic) if magic == self.magic => {
                        // Magic collision: suggest a fresh value.
                        tracing::warn!("magic number collision; naking");
                        let fresh = self.rng.gen_range(1..=u32::MAX);
                        naked.push(ConfigOption::u32_value(lcp_opt::MAGIC_NUMBER, fresh));
                    }
                    Some(magic) => self.peer_magic = magic,
                    None => rejected.push(option.clone()),
                },
                lcp_opt::MRU => match option.as_u16() {
                    Some(mru) if mru >= 68 => self.peer_mru = mru,
                    Some(_) => naked.push(ConfigOption::u16_value(lcp_opt::MRU, 1500)),
                    None => rejected.push(option.clone()),
                },
                lcp_opt::AUTH_PROTOCOL => {
                    tracing::debug!("rejecting authentication option");
                    rejected.push(option.clone());
                }
                lcp_opt::PROTOCOL_COMPRESSION | lcp_opt::ADDRESS_CONTROL_COMPRESSION => {
                    // We never compress on transmit, so do not agree to it.
                    rejected.push(option.clone());
                }
                kind => {
                    tracing::debug!(kind, "rejecting unknown LCP option");
                    rejected.push(option.clone());
                }
            }
        }

        let reply = if !rejected.is_empty() {
            ControlPacket::with_options(Code::ConfigureReject, packet.identifier, &rejected)
        } else if !naked.is_empty() {
            ControlPacket::with_options(Code::ConfigureNak, packet.identifier, &naked)
        } else {
            if self.lcp.ack_sent() {
                tracing::info!("LCP opened");
                out.event(PppEvent::LcpOpened);
            }
            ControlPacket::with_options(Code::ConfigureAck, packet.identifier, &options)
        };
        out.frame(reply.to_frame(proto::LCP));

        if let Some(frame) = own_request {
            out.frame(frame);
        }
    }

    /// Evaluate a peer IPCP Configure-Request and respond.
    fn ipcp_request(&mut self, packet: ControlPacket, out: &mut PppOutput) {
        let options = match packet.options() {
            Ok(options) => options,
            Err(error) => {
                tracing::debug!(%error, "dropping IPCP configure-request");
                return;
            }
        };

        let mut rejected = Vec::new();
        let mut naked = Vec::new();
        for option in &options {
            match option.kind {
                ipcp_opt::IP_ADDRESS => {
                    if option.data.len() == 4 {
                        let requested = Ipv4Addr::new(
                            option.data[0],
                            option.data[1],
                            option.data[2],
                            option.data[3],
                        );
                        if requested != self.remote_ip {
                            tracing::debug!(%requested, assigned = %self.remote_ip, "naking peer address");
                            naked.push(ConfigOption::new(
                                ipcp_opt::IP_ADDRESS,
                                self.remote_ip.octets().to_vec(),
                            ));
                        }
                    } else {
                        rejected.push(option.clone());
                    }
                }
                ipcp_opt::IP_COMPRESSION
                | ipcp_opt::PRIMARY_DNS
                | ipcp_opt::SECONDARY_DNS => rejected.push(option.clone()),
                kind => {
                    tracing::debug!(kind, "rejecting unknown IPCP option");
                    rejected.push(option.clone());
                }
            }
        }

        let reply = if !rejected.is_empty() {
            ControlPacket::with_options(Code::ConfigureReject, packet.identifier, &rejected)
        } else if !naked.is_empty() {
            ControlPacket::with_options(Code::ConfigureNak, packet.identifier, &naked)
        } else {
            if self.ipcp.ack_sent() {
                tracing::info!("IPCP opened; IP layer ready");
                out.event(PppEvent::IpcpOpened);
            }
            ControlPacket::with_options(Code::ConfigureAck, packet.identifier, &options)
        };
        out.frame(reply.to_frame(proto::IPCP));
    }

    /// Adopt the parameters a Configure-Nak suggests.
    fn apply_lcp_hints(&mut self, packet: &ControlPacket) {
        let Ok(options) = packet.options() else {
            return;
        };
        for option in options {
            match option.kind {
                lcp_opt::MAGIC_NUMBER => {
                    if let Some(magic) = option.as_u32() {
                        tracing::debug!(
                            magic = %format_args!("{magic:#010x}"),
                            "adopting naked magic number"
                        );
                        self.magic = magic;
                    }
                }
                lcp_opt::MRU => {
                    if let Some(mru) = option.as_u16() {
                        tracing::debug!(mru, "adopting naked MRU");
                        self.mru = mru;
                    }
                }
                _ => {}
            }
        }
    }

    fn note_rejected(&mut self, which: Protocol, packet: &ControlPacket) {
        let Ok(options) = packet.options() else {
            return;
        };
        let nego = self.negotiation(which);
        for option in options {
            tracing::debug!(protocol = nego.name, kind = option.kind, "peer rejected option");
            if !nego.rejected.contains(&option.kind) {
                nego.rejected.push(option.kind);
            }
        }
    }

    /// Build an LCP Protocol-Reject for an unsupported protocol's frame.
    fn protocol_reject(&mut self, protocol: u16, frame: &[u8]) -> Bytes {
        let mut data = protocol.to_be_bytes().to_vec();
        // Include the offending information field, bounded to keep the
        // reject inside the peer's MRU.
        let info = &frame[4.min(frame.len())..];
        data.extend_from_slice(&info[..info.len().min(64)]);
        let identifier = self.lcp.next_identifier();
        ControlPacket::new(Code::ProtocolReject, identifier, data).to_frame(proto::LCP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Lcp,
    Ipcp,
}
