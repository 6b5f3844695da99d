//! End-to-end sessions over an in-memory serial link.
//!
//! The test plays the remote peer by speaking raw PPP frames into one end of
//! a duplex pipe while a [`Bridge`] runs on the other, with a loopback TCP
//! listener standing in for the proxied service.

use bytes::Bytes;
use serlink_core::config::{Config, ServiceTarget};
use serlink_core::framing::{FrameDecoder, FrameEncoder};
use serlink_core::ppp::packet::{self, ipcp_opt, lcp_opt, proto, Code, ConfigOption, ControlPacket};
use serlink_core::shutdown::SessionEnd;
use serlink_core::wire::{ipv4, tcp};
use serlink_core::Bridge;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// The far end of the serial link, as raw frames.
struct Peer {
    stream: DuplexStream,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    pending: VecDeque<Bytes>,
    ip_id: u16,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            encoder: FrameEncoder::new(),
            pending: VecDeque::new(),
            ip_id: 0,
        }
    }

    async fn send_frame(&mut self, payload: &[u8]) {
        let framed = self.encoder.encode(payload);
        self.stream.write_all(&framed).await.unwrap();
    }

    async fn next_frame(&mut self) -> Bytes {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return frame;
            }
            let mut buf = [0u8; 2048];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("peer timed out waiting for a frame")
                .expect("serial pipe failed");
            assert_ne!(n, 0, "bridge closed the pipe unexpectedly");
            let mut frames = Vec::new();
            let mut errors = Vec::new();
            self.decoder.decode(&buf[..n], &mut frames, &mut errors);
            assert!(errors.is_empty(), "framing errors from the bridge: {errors:?}");
            self.pending.extend(frames);
        }
    }

    /// Next control packet for `protocol`, skipping unrelated frames.
    async fn next_control(&mut self, protocol: u16) -> ControlPacket {
        loop {
            let frame = self.next_frame().await;
            if packet::frame_protocol(&frame) == Some(protocol) {
                let (_, parsed) = ControlPacket::parse(&frame).unwrap();
                return parsed;
            }
        }
    }

    /// Next IP frame, parsed down to the TCP header and payload.
    async fn next_tcp(&mut self) -> (tcp::TcpHeader, Bytes) {
        loop {
            let frame = self.next_frame().await;
            if packet::frame_protocol(&frame) == Some(proto::IP) {
                let (ip, payload) = ipv4::parse(&frame[4..]).expect("valid IP from bridge");
                let (header, text) =
                    tcp::parse(payload, ip.source, ip.destination).expect("valid TCP from bridge");
                return (header, text);
            }
        }
    }

    /// Next TCP segment that carries payload, skipping pure ACKs.
    async fn next_tcp_data(&mut self) -> (tcp::TcpHeader, Bytes) {
        loop {
            let (header, text) = self.next_tcp().await;
            if !text.is_empty() {
                return (header, text);
            }
        }
    }

    async fn send_tcp(&mut self, src: Ipv4Addr, dst: Ipv4Addr, header: &tcp::TcpHeader, payload: &[u8]) {
        self.ip_id = self.ip_id.wrapping_add(1);
        let packet_bytes = ipv4::build(
            src,
            dst,
            ipv4::PROTOCOL_TCP,
            self.ip_id,
            &tcp::serialize(header, payload),
        );
        let frame = packet::ip_frame(&packet_bytes);
        self.send_frame(&frame).await;
    }

    /// Run the client side of LCP+IPCP against a host bridge until IP is up.
    async fn negotiate_as_client(&mut self) {
        // Our LCP Configure-Request.
        let options = [
            ConfigOption::u32_value(lcp_opt::MAGIC_NUMBER, 0xdead_beef),
            ConfigOption::u16_value(lcp_opt::MRU, 1500),
        ];
        let request = ControlPacket::with_options(Code::ConfigureRequest, 1, &options);
        self.send_frame(&request.to_frame(proto::LCP)).await;

        // Expect our Ack, then the host's own request, which we ack.
        let reply = self.next_control(proto::LCP).await;
        assert_eq!(reply.code, Code::ConfigureAck);
        assert_eq!(reply.identifier, 1);
        let host_request = self.next_control(proto::LCP).await;
        assert_eq!(host_request.code, Code::ConfigureRequest);
        let ack = ControlPacket::new(Code::ConfigureAck, host_request.identifier, host_request.data);
        self.send_frame(&ack.to_frame(proto::LCP)).await;

        // LCP is open on the host; it starts IPCP. Ack its request and send
        // our own.
        let host_ipcp = self.next_control(proto::IPCP).await;
        assert_eq!(host_ipcp.code, Code::ConfigureRequest);
        let ack = ControlPacket::new(Code::ConfigureAck, host_ipcp.identifier, host_ipcp.data);
        self.send_frame(&ack.to_frame(proto::IPCP)).await;

        let options = [ConfigOption::new(ipcp_opt::IP_ADDRESS, CLIENT_IP.octets().to_vec())];
        let request = ControlPacket::with_options(Code::ConfigureRequest, 1, &options);
        self.send_frame(&request.to_frame(proto::IPCP)).await;
        let reply = self.next_control(proto::IPCP).await;
        assert_eq!(reply.code, Code::ConfigureAck);
    }
}

fn peer_header(seq: u32) -> tcp::TcpHeaderBuilder {
    tcp::TcpHeaderBuilder::new(40000, 22, seq)
}

/// A loopback listener standing in for the proxied service: reads a greeting,
/// replies, then drains until EOF.
async fn spawn_service() -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut greeting = vec![0u8; 5];
        socket.read_exact(&mut greeting).await.unwrap();
        socket.write_all(b"world").await.unwrap();
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
        greeting
    });
    (port, task)
}

#[tokio::test]
async fn host_session_bridges_a_flow_end_to_end() {
    let (service_port, service) = spawn_service().await;

    let mut config = Config::host();
    config.services.insert(
        22,
        ServiceTarget {
            host: "127.0.0.1".into(),
            port: service_port,
        },
    );

    let (ours, theirs) = tokio::io::duplex(16 * 1024);
    let bridge = Bridge::new(theirs, config);
    let stats = bridge.stats();
    let shutdown = bridge.shutdown_handle();
    let session = tokio::spawn(bridge.run());

    let mut peer = Peer::new(ours);
    peer.negotiate_as_client().await;

    // Three-way handshake toward service port 22.
    let syn = peer_header(1000).syn().wnd(8192).mss(1460).build(CLIENT_IP, HOST_IP, &[]);
    peer.send_tcp(CLIENT_IP, HOST_IP, &syn, &[]).await;
    let (syn_ack, _) = peer.next_tcp().await;
    assert!(syn_ack.ctl.syn() && syn_ack.ctl.ack());
    assert_eq!(syn_ack.ack, 1001);
    let iss = syn_ack.seq;

    let ack = peer_header(1001).ack(iss.wrapping_add(1)).wnd(8192).build(CLIENT_IP, HOST_IP, &[]);
    peer.send_tcp(CLIENT_IP, HOST_IP, &ack, &[]).await;

    // Data toward the service; the bridge opens the loopback socket and
    // relays it.
    let data = peer_header(1001)
        .psh()
        .ack(iss.wrapping_add(1))
        .wnd(8192)
        .build(CLIENT_IP, HOST_IP, b"hello");
    peer.send_tcp(CLIENT_IP, HOST_IP, &data, b"hello").await;

    // The service's reply comes back as a data segment.
    let (reply, text) = peer.next_tcp_data().await;
    assert_eq!(&text[..], b"world");
    assert_eq!(reply.seq, iss.wrapping_add(1));
    assert_eq!(reply.ack, 1006);
    let ack = peer_header(1006)
        .ack(reply.seq.wrapping_add(text.len() as u32))
        .wnd(8192)
        .build(CLIENT_IP, HOST_IP, &[]);
    peer.send_tcp(CLIENT_IP, HOST_IP, &ack, &[]).await;

    // The service observed exactly the bytes we tunnelled.
    let greeting = timeout(Duration::from_secs(5), async {
        // Close our side so the service's drain finishes.
        let fin = peer_header(1006)
            .fin()
            .ack(reply.seq.wrapping_add(5))
            .wnd(8192)
            .build(CLIENT_IP, HOST_IP, &[]);
        peer.send_tcp(CLIENT_IP, HOST_IP, &fin, &[]).await;
        service.await.unwrap()
    })
    .await
    .unwrap();
    assert_eq!(greeting, b"hello");

    shutdown.raise(SessionEnd::Operator);
    let result = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
    assert!(result.is_ok(), "bridge ended with {result:?}");

    assert!(stats.frames_in.load(Ordering::Relaxed) > 0);
    assert!(stats.frames_out.load(Ordering::Relaxed) > 0);
    assert!(stats.segments_in.load(Ordering::Relaxed) >= 3);
    assert_eq!(stats.connections_opened.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn client_session_tunnels_a_local_connection() {
    // Find a free local port for the forwarder to own.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let forward_port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = Config::client();
    config.forwards.insert(forward_port, 22);

    let (ours, theirs) = tokio::io::duplex(16 * 1024);
    let bridge = Bridge::new(theirs, config);
    let shutdown = bridge.shutdown_handle();
    let session = tokio::spawn(bridge.run());

    let mut peer = Peer::new(ours);

    // The client fires the first Configure-Request; play the host side.
    let client_request = peer.next_control(proto::LCP).await;
    assert_eq!(client_request.code, Code::ConfigureRequest);
    let ack = ControlPacket::new(Code::ConfigureAck, client_request.identifier, client_request.data);
    peer.send_frame(&ack.to_frame(proto::LCP)).await;
    let options = [
        ConfigOption::u32_value(lcp_opt::MAGIC_NUMBER, 0x0102_0304),
        ConfigOption::u16_value(lcp_opt::MRU, 1500),
    ];
    let request = ControlPacket::with_options(Code::ConfigureRequest, 1, &options);
    peer.send_frame(&request.to_frame(proto::LCP)).await;
    let reply = peer.next_control(proto::LCP).await;
    assert_eq!(reply.code, Code::ConfigureAck);

    // IPCP both ways.
    let client_ipcp = peer.next_control(proto::IPCP).await;
    assert_eq!(client_ipcp.code, Code::ConfigureRequest);
    let ack = ControlPacket::new(Code::ConfigureAck, client_ipcp.identifier, client_ipcp.data);
    peer.send_frame(&ack.to_frame(proto::IPCP)).await;
    let options = [ConfigOption::new(ipcp_opt::IP_ADDRESS, HOST_IP.octets().to_vec())];
    let request = ControlPacket::with_options(Code::ConfigureRequest, 1, &options);
    peer.send_frame(&request.to_frame(proto::IPCP)).await;
    let reply = peer.next_control(proto::IPCP).await;
    assert_eq!(reply.code, Code::ConfigureAck);

    // The forwarder is up; connect to the local port. A synthetic SYN must
    // come through the link.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut local = TcpStream::connect(("127.0.0.1", forward_port)).await.unwrap();
    let (syn, _) = peer.next_tcp().await;
    assert!(syn.ctl.syn() && !syn.ctl.ack());
    assert_eq!(syn.dst_port, 22);
    let synthetic_port = syn.src_port;
    assert!((30000..60000).contains(&synthetic_port));

    // Complete the handshake from the host side.
    let syn_ack = tcp::TcpHeaderBuilder::new(22, synthetic_port, 9000)
        .syn()
        .ack(syn.seq.wrapping_add(1))
        .wnd(8192)
        .mss(1460)
        .build(HOST_IP, CLIENT_IP, &[]);
    peer.send_tcp(HOST_IP, CLIENT_IP, &syn_ack, &[]).await;
    let (ack, _) = peer.next_tcp().await;
    assert!(ack.ctl.ack() && !ack.ctl.syn());
    assert_eq!(ack.ack, 9001);

    // Local bytes tunnel out as TCP payload.
    local.write_all(b"ping").await.unwrap();
    let (data, text) = peer.next_tcp_data().await;
    assert_eq!(&text[..], b"ping");
    assert_eq!(data.seq, syn.seq.wrapping_add(1));

    // And payload from the host side lands on the local socket.
    let reply = tcp::TcpHeaderBuilder::new(22, synthetic_port, 9001)
        .psh()
        .ack(data.seq.wrapping_add(4))
        .wnd(8192)
        .build(HOST_IP, CLIENT_IP, b"pong");
    peer.send_tcp(HOST_IP, CLIENT_IP, &reply, b"pong").await;
    let mut answer = [0u8; 4];
    timeout(Duration::from_secs(5), local.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&answer, b"pong");

    shutdown.raise(SessionEnd::Operator);
    let result = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
    assert!(result.is_ok(), "bridge ended with {result:?}");
}
