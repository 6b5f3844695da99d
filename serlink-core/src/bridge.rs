//! The bridge: owner of the serial endpoint and driver of everything else.
//!
//! One [`Bridge::run`] call is one serial session. The loop reads serial
//! bytes, decodes frames, and dispatches by PPP protocol number: LCP/IPCP to
//! the negotiator, IP (once both are open) to the TCP stack. Two cadences
//! ride the same loop: a one-second PPP tick for negotiation retries and
//! echo keepalive, and a 100 ms TCP tick that pumps the timer heap. Proxy
//! and forwarder tasks talk back through one event channel; all serial
//! writes and all stack access stay on this task.

use crate::config::{Config, Role};
use crate::forwarder;
use crate::framing::{FrameDecoder, FrameEncoder};
use crate::ppp::packet::{self, proto};
use crate::ppp::{NegotiationError, Ppp, PppEvent, PppOutput};
use crate::proxy::{self, ProxyHandle};
use crate::shutdown::{FlowEnd, SessionEnd, SessionShutdown};
use crate::stats::{self, LinkStats};
use crate::tcp::tcb::FlowId;
use crate::tcp::{Action, TcpStack};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Depth of the proxy/forwarder event channel.
const EVENT_DEPTH: usize = 64;

/// Log a counters summary this often, in TCP ticks.
const STATS_EVERY_TICKS: u32 = 600;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("serial transport failed: {0}")]
    Transport(#[from] std::io::Error),
    #[error("serial endpoint closed")]
    SerialClosed,
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// Traffic from the proxy pairs and forwarder listeners back to the bridge
/// loop.
#[derive(Debug)]
pub enum Event {
    /// Bytes the service wrote; to be segmentized toward the peer.
    FlowData { id: FlowId, data: Bytes },
    /// The service closed its sending side.
    FlowEof { id: FlowId },
    /// The service socket failed; reset the flow.
    FlowError { id: FlowId },
    /// Both proxy directions have exited.
    ProxyFinished { id: FlowId },
    /// A client connected to a forwarded local port.
    ForwardConnect { socket: TcpStream, remote_port: u16 },
}

/// A PPP-over-serial bridge session.
pub struct Bridge<S> {
    serial: S,
    config: Arc<Config>,
    stats: Arc<LinkStats>,
    shutdown: SessionShutdown,
}

impl<S: AsyncRead + AsyncWrite> Bridge<S> {
    pub fn new(serial: S, config: Config) -> Self {
        Self {
            serial,
            config: Arc::new(config),
            stats: Arc::new(LinkStats::new()),
            shutdown: SessionShutdown::new(),
        }
    }

    /// Counter block for this session; clone before `run`.
    pub fn stats(&self) -> Arc<LinkStats> {
        self.stats.clone()
    }

    /// Handle for external teardown (e.g. a signal handler).
    pub fn shutdown_handle(&self) -> SessionShutdown {
        self.shutdown.clone()
    }

    /// Run the session to completion. Returns `Ok` on orderly teardown (peer
    /// terminate or external shutdown); errors are session-fatal transport
    /// or negotiation failures.
    pub async fn run(self) -> Result<(), BridgeError> {
        let (mut reader, writer) = tokio::io::split(self.serial);
        let (events_tx, events_rx) = mpsc::channel(EVENT_DEPTH);
        let mut session = Session {
            writer,
            encoder: FrameEncoder::new(),
            ppp: Ppp::new(&self.config),
            stack: TcpStack::new(self.config.clone(), self.stats.clone()),
            proxies: FxHashMap::default(),
            forwarders: Vec::new(),
            events_tx,
            events_rx,
            config: self.config.clone(),
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
            started: Instant::now(),
        };

        tracing::info!(
            role = ?self.config.role,
            local = %self.config.local_ip,
            remote = %self.config.remote_ip,
            "bridge session starting"
        );

        let mut decoder = FrameDecoder::new();
        let mut read_buf = [0u8; 1024];
        let mut ppp_tick = tokio::time::interval(Duration::from_secs(1));
        ppp_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tcp_tick = tokio::time::interval(Duration::from_millis(100));
        tcp_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tick_count = 0u32;
        let shutdown = self.shutdown.clone();

        enum Step {
            Serial(usize),
            SerialClosed,
            SerialError(std::io::Error),
            Event(Option<Event>),
            PppTick,
            TcpTick,
            Shutdown,
        }

        let opening = session.ppp.start(session.now());
        let mut outcome = session.handle_ppp_output(opening).await.map(|_| ());

        while outcome.is_ok() {
            let step = tokio::select! {
                read = reader.read(&mut read_buf) => match read {
                    Ok(0) => Step::SerialClosed,
                    Ok(n) => Step::Serial(n),
                    Err(error) => Step::SerialError(error),
                },
                event = session.events_rx.recv() => Step::Event(event),
                _ = ppp_tick.tick() => Step::PppTick,
                _ = tcp_tick.tick() => Step::TcpTick,
                _ = shutdown.stopped() => Step::Shutdown,
            };

            let status = match step {
                Step::Serial(n) => session.handle_serial(&read_buf[..n], &mut decoder).await,
                Step::SerialClosed => {
                    tracing::info!("serial endpoint closed");
                    Err(BridgeError::SerialClosed)
                }
                Step::SerialError(error) => {
                    tracing::error!(%error, "serial read failed");
                    Err(BridgeError::Transport(error))
                }
                Step::Event(Some(event)) => session.handle_event(event).await,
                // Unreachable while the session holds a sender clone.
                Step::Event(None) => Ok(LinkStatus::Running),
                Step::PppTick => session.ppp_tick().await,
                Step::TcpTick => {
                    tick_count = tick_count.wrapping_add(1);
                    if tick_count % STATS_EVERY_TICKS == 0 {
                        let snapshot = session.stats.snapshot();
                        tracing::info!(?snapshot, "link counters");
                    }
                    session.tcp_tick().await
                }
                Step::Shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
            };

            match status {
                Ok(LinkStatus::Running) => {}
                Ok(LinkStatus::Terminated) => {
                    tracing::info!("link terminated by peer");
                    break;
                }
                Err(error) => outcome = Err(error),
            }
        }

        session.teardown().await;
        if let Err(BridgeError::Negotiation(_)) = &outcome {
            stats::bump(&self.stats.negotiation_failures);
        }
        outcome
    }
}

/// Whether the link should keep running after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Running,
    Terminated,
}

/// Mutable state of one running session, separated from `Bridge` so the
/// select loop can borrow the serial reader independently.
struct Session<S> {
    writer: WriteHalf<S>,
    encoder: FrameEncoder,
    ppp: Ppp,
    stack: TcpStack,
    proxies: FxHashMap<FlowId, ProxyHandle>,
    forwarders: Vec<JoinHandle<()>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    config: Arc<Config>,
    stats: Arc<LinkStats>,
    shutdown: SessionShutdown,
    started: Instant,
}

impl<S: AsyncRead + AsyncWrite> Session<S> {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    /// Frame and write one PPP payload.
    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), BridgeError> {
        let framed = self.encoder.encode(payload);
        self.writer.write_all(&framed).await?;
        self.writer.flush().await?;
        stats::bump(&self.stats.frames_out);
        stats::add(&self.stats.bytes_out, framed.len() as u64);
        Ok(())
    }

    /// Decode a chunk of serial input and dispatch every complete frame.
    async fn handle_serial(
        &mut self,
        data: &[u8],
        decoder: &mut FrameDecoder,
    ) -> Result<LinkStatus, BridgeError> {
        stats::add(&self.stats.bytes_in, data.len() as u64);
        let mut frames = Vec::new();
        let mut errors = Vec::new();
        decoder.decode(data, &mut frames, &mut errors);
        for error in errors {
            tracing::debug!(%error, "framing error");
            stats::bump(&self.stats.framing_errors);
        }
        for frame in frames {
            stats::bump(&self.stats.frames_in);
            if self.dispatch_frame(&frame).await? == LinkStatus::Terminated {
                return Ok(LinkStatus::Terminated);
            }
        }
        Ok(LinkStatus::Running)
    }

    async fn dispatch_frame(&mut self, frame: &[u8]) -> Result<LinkStatus, BridgeError> {
        match packet::frame_protocol(frame) {
            Some(proto::IP) => {
                if self.ppp.ready_for_ip() {
                    let now = self.now();
                    self.stack.handle_packet(&frame[4..], now);
                    self.apply_stack_actions().await?;
                } else {
                    tracing::debug!("IP frame before negotiation completed; dropping");
                }
                Ok(LinkStatus::Running)
            }
            Some(_) => {
                let now = self.now();
                let output = self.ppp.handle_frame(frame, now);
                self.handle_ppp_output(output).await
            }
            None => {
                tracing::debug!("frame without a valid PPP header; dropping");
                Ok(LinkStatus::Running)
            }
        }
    }

    /// Write the negotiator's frames and react to its events.
    async fn handle_ppp_output(&mut self, output: PppOutput) -> Result<LinkStatus, BridgeError> {
        for frame in &output.frames {
            self.write_frame(frame).await?;
        }
        for event in output.events {
            match event {
                PppEvent::LcpOpened => {}
                PppEvent::IpcpOpened => {
                    tracing::info!("IP layer up");
                    if self.config.role == Role::Client && self.forwarders.is_empty() {
                        self.forwarders = forwarder::spawn_listeners(
                            &self.config,
                            self.events_tx.clone(),
                            self.shutdown.clone(),
                        );
                    }
                }
                PppEvent::LinkTerminated => {
                    return Ok(LinkStatus::Terminated);
                }
            }
        }
        Ok(LinkStatus::Running)
    }

    async fn ppp_tick(&mut self) -> Result<LinkStatus, BridgeError> {
        let now = self.now();
        let output = self.ppp.on_tick(now)?;
        self.handle_ppp_output(output).await
    }

    async fn tcp_tick(&mut self) -> Result<LinkStatus, BridgeError> {
        let now = self.now();
        self.stack.on_tick(now);
        self.apply_stack_actions().await?;
        Ok(LinkStatus::Running)
    }

    async fn handle_event(&mut self, event: Event) -> Result<LinkStatus, BridgeError> {
        let now = self.now();
        match event {
            Event::FlowData { id, data } => {
                self.stack.send_flow(id, &data, now);
            }
            Event::FlowEof { id } => {
                self.stack.close_flow(id, now);
            }
            Event::FlowError { id } => {
                self.stack.abort_flow(id, now);
            }
            Event::ProxyFinished { id } => {
                self.proxies.remove(&id);
            }
            Event::ForwardConnect {
                socket,
                remote_port,
            } => {
                self.stack.active_open(remote_port, socket, now);
            }
        }
        self.apply_stack_actions().await?;
        Ok(LinkStatus::Running)
    }

    /// Drain and execute stack actions until none remain. Opening sockets
    /// and attaching proxies generate further actions, hence the loop.
    async fn apply_stack_actions(&mut self) -> Result<(), BridgeError> {
        loop {
            let actions = self.stack.take_actions();
            if actions.is_empty() {
                return Ok(());
            }
            for action in actions {
                match action {
                    Action::Transmit(ip_packet) => {
                        let frame = packet::ip_frame(&ip_packet);
                        self.write_frame(&frame).await?;
                    }
                    Action::OpenService { id, port } => {
                        self.open_service(id, port).await;
                    }
                    Action::ClientEstablished { id } => {
                        let now = self.now();
                        if let Some(socket) = self.stack.take_client_socket(id) {
                            self.attach(id, socket);
                        } else {
                            tracing::warn!(%id, "established flow has no parked socket");
                            self.stack.abort_flow(id, now);
                        }
                    }
                    Action::Deliver { id, data } => {
                        let queue = self
                            .proxies
                            .get(&id)
                            .and_then(|proxy| proxy.queue.clone());
                        if let Some(queue) = queue {
                            // A full queue blocks the loop until the service
                            // drains; that is the back-pressure path.
                            if queue.send(data).await.is_err() {
                                tracing::debug!(%id, "proxy queue closed; dropping delivery");
                            }
                        }
                    }
                    Action::PeerFin { id } => {
                        if let Some(proxy) = self.proxies.get_mut(&id) {
                            proxy.close_write();
                        }
                    }
                    Action::FlowClosed { id, reset } => {
                        tracing::debug!(%id, reset, "flow closed");
                        if let Some(proxy) = self.proxies.remove(&id) {
                            proxy.shutdown.raise(FlowEnd::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Host mode: connect the mapped service for a flow's first data.
    async fn open_service(&mut self, id: FlowId, port: u16) {
        let now = self.now();
        let Some(target) = self.config.services.get(&port).cloned() else {
            tracing::warn!(port, "no service mapping; resetting flow");
            self.stack.abort_flow(id, now);
            return;
        };
        tracing::info!(%id, host = %target.host, port = target.port, "opening service socket");
        match proxy::connect_service(&self.config, &target).await {
            Ok(socket) => self.attach(id, socket),
            Err(error) => {
                tracing::warn!(%id, %error, "service connect failed; resetting flow");
                let now = self.now();
                self.stack.abort_flow(id, now);
            }
        }
    }

    fn attach(&mut self, id: FlowId, socket: TcpStream) {
        let now = self.now();
        let handle = proxy::spawn(id, socket, self.events_tx.clone());
        self.stack.attach_proxy(id, handle.credit.clone(), now);
        self.proxies.insert(id, handle);
    }

    /// Orderly end of session: reset flows, stop helpers, flush the wire.
    async fn teardown(&mut self) {
        let now = self.now();
        self.stack.abort_all(now);
        let _ = self.apply_stack_actions().await;
        for (_, proxy) in self.proxies.drain() {
            proxy.shutdown.raise(FlowEnd::SessionClosing);
        }
        self.shutdown.raise(SessionEnd::LinkDown);
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        let _ = self.writer.flush().await;
        let _ = self.writer.shutdown().await;
        tracing::info!("bridge session ended");
    }
}
