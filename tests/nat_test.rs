//! NAT engine integration tests
//!
//! Drives the full engine through an in-memory duplex stream standing in
//! for the tun device: raw IPv4 packets go in, response packets come out.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

use tunlens::common::NullProtector;
use tunlens::config::Config;
use tunlens::event;
use tunlens::intercept::{MitmContext, RedirectMap};
use tunlens::packet::{self, build_tcp_packet, build_udp_packet, tcp_flags, Transport};
use tunlens::pcap;
use tunlens::proxy::{Engine, EngineHandle};
use tunlens::tls::CaManager;

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Splits the engine-side byte stream back into whole IP datagrams using
/// the total-length field (each engine write is one datagram).
struct FrameReader {
    stream: tokio::io::ReadHalf<DuplexStream>,
    pending: Vec<u8>,
}

impl FrameReader {
    fn new(stream: tokio::io::ReadHalf<DuplexStream>) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    async fn next_frame(&mut self) -> Vec<u8> {
        loop {
            if self.pending.len() >= 20 {
                let total = usize::from(u16::from_be_bytes([
                    self.pending[2],
                    self.pending[3],
                ]));
                if total >= 20 && self.pending.len() >= total {
                    let frame = self.pending[..total].to_vec();
                    self.pending.drain(..total);
                    return frame;
                }
            }
            let mut buf = vec![0u8; 4096];
            let n = self
                .stream
                .read(&mut buf)
                .await
                .expect("engine side closed unexpectedly");
            assert!(n > 0, "engine closed the device");
            self.pending.extend_from_slice(&buf[..n]);
        }
    }
}

async fn start_engine(
    config: Config,
    tap: Option<pcap::FrameSender>,
) -> (EngineHandle, DuplexStream, event::EventReceiver, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config;
    config.ca_store_path = dir.path().join("ca.p12");
    config.listen = "127.0.0.1:0".parse().unwrap();
    let config = Arc::new(config);

    let ca = Arc::new(CaManager::new(&config.ca_store_path, &config.ca_password));
    let (events, event_rx) = event::channel();
    let ctx = Arc::new(MitmContext::new(
        &config,
        ca,
        events,
        Arc::new(NullProtector),
    ));

    let mut engine = Engine::new(config, ctx, Arc::new(RedirectMap::new()));
    if let Some(tap) = tap {
        engine = engine.with_frame_tap(tap);
    }

    let (client_side, engine_side) = tokio::io::duplex(262144);
    let handle = engine.start(engine_side).await.unwrap();
    (handle, client_side, event_rx, dir)
}

#[tokio::test]
async fn test_udp_forwarding_and_eviction() {
    // Echo server standing in for the real network
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, peer)) = echo.recv_from(&mut buf).await else {
                break;
            };
            let _ = echo.send_to(&buf[..n], peer).await;
        }
    });

    let mut config = Config::default();
    config.udp_idle_timeout_secs = 1;

    let (tap_tx, mut tap_rx) = pcap::frame_tap();
    let (handle, device, _events, _dir) = start_engine(config, Some(tap_tx)).await;
    let (read_half, mut write_half) = tokio::io::split(device);
    let mut frames = FrameReader::new(read_half);

    let echo_ip = match echo_addr {
        SocketAddr::V4(v4) => *v4.ip(),
        _ => unreachable!(),
    };
    let request = build_udp_packet(
        (CLIENT_IP, 40000),
        (echo_ip, echo_addr.port()),
        b"ping",
    );
    write_half.write_all(&request).await.unwrap();

    // Echoed payload comes back as a response packet with swapped endpoints
    let frame = timeout(Duration::from_secs(5), frames.next_frame())
        .await
        .expect("no UDP response from engine");
    let parsed = packet::parse(&frame).expect("engine emitted unparseable packet");
    assert_eq!(parsed.src_ip, echo_ip);
    assert_eq!(parsed.dst_ip, CLIENT_IP);
    match parsed.transport {
        Transport::Udp(udp) => {
            assert_eq!(udp.src_port, echo_addr.port());
            assert_eq!(udp.dst_port, 40000);
            assert_eq!(udp.payload, b"ping");
        }
        _ => panic!("expected UDP response"),
    }

    // The response must verify at the checksum level
    assert_eq!(packet::internet_checksum(&frame[..20]), 0);

    assert_eq!(handle.tracker().udp_flow_count(), 1);

    // No traffic for longer than the idle window evicts the flow
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handle.tracker().udp_flow_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "UDP flow not evicted after idle timeout"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The frame tap saw both directions
    let mut tapped = Vec::new();
    while let Ok(frame) = tap_rx.try_recv() {
        tapped.push(frame);
    }
    assert!(tapped.iter().any(|f| f.data == request));
    assert!(tapped.iter().any(|f| f.data == frame));

    handle.stop().await;
}

#[tokio::test]
async fn test_tcp_flow_lifecycle_and_isolation() {
    // Echo server for the happy-path flow
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    let (handle, device, _events, _dir) = start_engine(Config::default(), None).await;
    let (read_half, mut write_half) = tokio::io::split(device);
    let mut frames = FrameReader::new(read_half);

    let server_ip = match server_addr {
        SocketAddr::V4(v4) => *v4.ip(),
        _ => unreachable!(),
    };

    // A real tun yields one datagram per read; the duplex test device is a
    // byte stream, so sequential packets are spaced out to keep the engine
    // from coalescing two datagrams into one read.
    async fn write_packet(
        half: &mut tokio::io::WriteHalf<DuplexStream>,
        packet: &[u8],
    ) {
        half.write_all(packet).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Flow A: SYN towards a closed port. The connect fails, the flow is
    // dropped, and no packet comes back for it.
    let dead = build_tcp_packet(
        (CLIENT_IP, 50001),
        (server_ip, 1),
        5000,
        0,
        tcp_flags::SYN,
        65535,
        &[],
    );
    write_packet(&mut write_half, &dead).await;

    // Flow B: the real three-way handshake against the live server
    let client_isn: u32 = 9000;
    let syn = build_tcp_packet(
        (CLIENT_IP, 50002),
        (server_ip, server_addr.port()),
        client_isn,
        0,
        tcp_flags::SYN,
        65535,
        &[],
    );
    write_packet(&mut write_half, &syn).await;

    // The only SYN-ACK that arrives belongs to flow B
    let frame = timeout(Duration::from_secs(5), frames.next_frame())
        .await
        .expect("no SYN-ACK from engine");
    let parsed = packet::parse(&frame).unwrap();
    let synack = match parsed.transport {
        Transport::Tcp(tcp) => tcp,
        _ => panic!("expected TCP"),
    };
    assert_eq!(parsed.dst_ip, CLIENT_IP);
    assert_eq!(synack.dst_port, 50002, "SYN-ACK for the wrong flow");
    assert!(synack.has(tcp_flags::SYN) && synack.has(tcp_flags::ACK));
    assert_eq!(synack.ack, client_isn.wrapping_add(1));
    let server_isn = synack.seq;

    // Complete the handshake and push payload
    let ack = build_tcp_packet(
        (CLIENT_IP, 50002),
        (server_ip, server_addr.port()),
        client_isn.wrapping_add(1),
        server_isn.wrapping_add(1),
        tcp_flags::ACK,
        65535,
        &[],
    );
    write_packet(&mut write_half, &ack).await;

    let data = build_tcp_packet(
        (CLIENT_IP, 50002),
        (server_ip, server_addr.port()),
        client_isn.wrapping_add(1),
        server_isn.wrapping_add(1),
        tcp_flags::PSH | tcp_flags::ACK,
        65535,
        b"hello",
    );
    write_packet(&mut write_half, &data).await;

    // Expect the engine's pure ACK and the echoed payload, in any order
    let mut echoed: Option<Vec<u8>> = None;
    let mut acked = false;
    for _ in 0..4 {
        let frame = timeout(Duration::from_secs(5), frames.next_frame())
            .await
            .expect("engine stopped responding");
        let parsed = packet::parse(&frame).unwrap();
        let tcp = match parsed.transport {
            Transport::Tcp(tcp) => tcp,
            _ => continue,
        };
        if !tcp.payload.is_empty() {
            assert_eq!(tcp.seq, server_isn.wrapping_add(1));
            echoed = Some(tcp.payload.to_vec());
        } else if tcp.has(tcp_flags::ACK) && tcp.ack == client_isn.wrapping_add(6) {
            acked = true;
        }
        if echoed.is_some() && acked {
            break;
        }
    }
    assert_eq!(echoed.as_deref(), Some(&b"hello"[..]));
    assert!(acked, "payload was never acknowledged");

    // Only flow B is tracked
    assert_eq!(handle.tracker().tcp_flow_count(), 1);

    // FIN closes the flow; the table drains
    let fin = build_tcp_packet(
        (CLIENT_IP, 50002),
        (server_ip, server_addr.port()),
        client_isn.wrapping_add(6),
        server_isn.wrapping_add(6),
        tcp_flags::FIN | tcp_flags::ACK,
        65535,
        &[],
    );
    write_packet(&mut write_half, &fin).await;

    // Wait for the engine's own FIN (upstream saw EOF and closed), then
    // complete the close with a final ACK
    let mut engine_fin_seq = None;
    for _ in 0..4 {
        let frame = timeout(Duration::from_secs(5), frames.next_frame())
            .await
            .expect("no teardown packets from engine");
        let parsed = packet::parse(&frame).unwrap();
        if let Transport::Tcp(tcp) = parsed.transport {
            if tcp.has(tcp_flags::FIN) {
                engine_fin_seq = Some(tcp.seq);
                break;
            }
        }
    }
    let engine_fin_seq = engine_fin_seq.expect("engine never sent FIN");
    let last_ack = build_tcp_packet(
        (CLIENT_IP, 50002),
        (server_ip, server_addr.port()),
        client_isn.wrapping_add(7),
        engine_fin_seq.wrapping_add(1),
        tcp_flags::ACK,
        65535,
        &[],
    );
    write_packet(&mut write_half, &last_ack).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while handle.tracker().tcp_flow_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "TCP flow not removed after FIN"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    handle.stop().await;
}

#[tokio::test]
async fn test_tls_port_flow_is_redirected_not_forwarded() {
    // intercept_ports contains 443 by default; the destination is a public
    // address nothing in this test can reach, which proves the SYN-ACK
    // comes from the redirect into the local intercept listener.
    let (handle, device, _events, _dir) = start_engine(Config::default(), None).await;
    assert!(handle.intercept_addr().is_some());

    let (read_half, mut write_half) = tokio::io::split(device);
    let mut frames = FrameReader::new(read_half);

    let syn = build_tcp_packet(
        (CLIENT_IP, 50003),
        (Ipv4Addr::new(93, 184, 216, 34), 443),
        1234,
        0,
        tcp_flags::SYN,
        65535,
        &[],
    );
    write_half.write_all(&syn).await.unwrap();

    let frame = timeout(Duration::from_secs(5), frames.next_frame())
        .await
        .expect("redirected flow produced no SYN-ACK");
    let parsed = packet::parse(&frame).unwrap();
    match parsed.transport {
        Transport::Tcp(tcp) => {
            assert!(tcp.has(tcp_flags::SYN) && tcp.has(tcp_flags::ACK));
            assert_eq!(tcp.ack, 1235);
            assert_eq!(tcp.dst_port, 50003);
        }
        _ => panic!("expected TCP SYN-ACK"),
    }

    handle.stop().await;
}
