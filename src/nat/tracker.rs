//! Connection tracker / NAT engine
//!
//! Maps flow 5-tuples to live protected sockets and rewrites response
//! packets back towards the tun device. Each flow's outbound socket is
//! owned by exactly one task; the tun read loop communicates with it over
//! an mpsc channel and never blocks on a slow flow (full per-flow queues
//! drop the segment, the client retransmits).
//!
//! TCP flows destined for configured TLS ports are not forwarded directly:
//! their upstream connection is dialed into the intercept listener and the
//! original destination recorded in the redirect table.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpSocket;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::common::{
    bind_udp_protected, connect_tcp_protected, ArcProtector, ProxyError, Result,
};
use crate::intercept::RedirectMap;
use crate::packet::{
    build_tcp_packet, build_udp_packet, tcp_flags, ParsedPacket, TcpSegment,
    Transport, UdpDatagram,
};

use super::flow::{FlowKey, TcpState};

/// Advertised receive window
const TCP_WINDOW: u16 = 65535;
/// Payload bound per emitted segment (1500 MTU minus IP and TCP headers)
const TCP_MSS: usize = 1460;
/// Idle bound on an established TCP flow
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Idle bound once a FIN has been seen
const TCP_CLOSING_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-flow segment queue depth
const FLOW_QUEUE_DEPTH: usize = 64;

/// Tracker-specific configuration, distilled from the main config
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub udp_idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub intercept_ports: Vec<u16>,
}

struct TcpEvent {
    seq: u32,
    flags: u8,
    payload: Vec<u8>,
}

struct TcpFlowHandle {
    tx: mpsc::Sender<TcpEvent>,
    state: Arc<Mutex<TcpState>>,
}

struct UdpFlowHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

struct Shared {
    cfg: TrackerConfig,
    protector: ArcProtector,
    redirects: Arc<RedirectMap>,
    /// Bound address of the intercept listener; absent when interception
    /// is disabled (e.g. CA bootstrap failed)
    intercept_addr: Option<SocketAddr>,
    tun_tx: mpsc::Sender<Vec<u8>>,
    tcp_flows: DashMap<FlowKey, TcpFlowHandle>,
    udp_flows: DashMap<FlowKey, UdpFlowHandle>,
}

/// Flow table and per-packet dispatch
#[derive(Clone)]
pub struct ConnectionTracker {
    shared: Arc<Shared>,
}

impl ConnectionTracker {
    pub fn new(
        cfg: TrackerConfig,
        protector: ArcProtector,
        redirects: Arc<RedirectMap>,
        intercept_addr: Option<SocketAddr>,
        tun_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                protector,
                redirects,
                intercept_addr,
                tun_tx,
                tcp_flows: DashMap::new(),
                udp_flows: DashMap::new(),
            }),
        }
    }

    /// Dispatch one parsed packet from the tun device.
    ///
    /// Never blocks on a single flow and never fails: anything that cannot
    /// be handled is dropped.
    pub fn handle_packet(&self, packet: &ParsedPacket<'_>) {
        let Some(key) = FlowKey::from_packet(packet) else {
            trace!("dropping non-TCP/UDP packet (protocol {})", packet.protocol);
            return;
        };

        match packet.transport {
            Transport::Tcp(ref seg) => self.handle_tcp(key, seg),
            Transport::Udp(ref udp) => self.handle_udp(key, udp),
            Transport::Other => {}
        }
    }

    fn handle_tcp(&self, key: FlowKey, seg: &TcpSegment<'_>) {
        if let Some(handle) = self.shared.tcp_flows.get(&key) {
            let event = TcpEvent {
                seq: seg.seq,
                flags: seg.flags,
                payload: seg.payload.to_vec(),
            };
            if handle.tx.try_send(event).is_err() {
                trace!("flow {}: queue full or closing, segment dropped", key);
            }
            return;
        }

        // Only a bare SYN creates a flow; anything else for an unknown key
        // is a stray from a dead connection.
        if seg.has(tcp_flags::SYN) && !seg.has(tcp_flags::ACK) {
            self.spawn_tcp_flow(key, seg.seq);
        } else {
            trace!("segment for unknown flow {} dropped", key);
        }
    }

    fn spawn_tcp_flow(&self, key: FlowKey, client_isn: u32) {
        debug!("new TCP flow {}", key);
        let (tx, rx) = mpsc::channel(FLOW_QUEUE_DEPTH);
        let state = Arc::new(Mutex::new(TcpState::SynSent));
        self.shared.tcp_flows.insert(
            key,
            TcpFlowHandle {
                tx,
                state: Arc::clone(&state),
            },
        );

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_tcp_flow(Arc::clone(&shared), key, client_isn, state, rx).await;
            shared.tcp_flows.remove(&key);
            debug!("TCP flow {} closed", key);
        });
    }

    fn handle_udp(&self, key: FlowKey, udp: &UdpDatagram<'_>) {
        if let Some(handle) = self.shared.udp_flows.get(&key) {
            if handle.tx.try_send(udp.payload.to_vec()).is_err() {
                trace!("flow {}: queue full, datagram dropped", key);
            }
            return;
        }

        debug!("new UDP flow {}", key);
        let (tx, rx) = mpsc::channel(FLOW_QUEUE_DEPTH);
        // First datagram rides through the same channel the rest will use
        let _ = tx.try_send(udp.payload.to_vec());
        self.shared.udp_flows.insert(key, UdpFlowHandle { tx });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run_udp_flow(Arc::clone(&shared), key, rx).await;
            shared.udp_flows.remove(&key);
            debug!("UDP flow {} evicted", key);
        });
    }

    pub fn tcp_flow_count(&self) -> usize {
        self.shared.tcp_flows.len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.shared.udp_flows.len()
    }

    /// Current state of a TCP flow, if it is still tracked
    pub fn tcp_state(&self, key: &FlowKey) -> Option<TcpState> {
        self.shared
            .tcp_flows
            .get(key)
            .map(|h| *h.state.lock().expect("flow state lock poisoned"))
    }
}

fn random_isn() -> u32 {
    let mut bytes = [0u8; 4];
    // rand_bytes only fails when the CSPRNG is unseeded, which openssl
    // treats as a broken installation
    if openssl::rand::rand_bytes(&mut bytes).is_err() {
        warn!("CSPRNG unavailable, using fixed initial sequence number");
    }
    u32::from_be_bytes(bytes)
}

async fn send_to_tun(shared: &Shared, packet: Vec<u8>) {
    if shared.tun_tx.send(packet).await.is_err() {
        trace!("tun writer gone, response packet dropped");
    }
}

/// Dial the intercept listener on behalf of a TLS-port flow, recording the
/// original destination under our source port first so the listener can
/// recover it. Loopback dialing needs no protection.
async fn connect_redirect(
    listener: SocketAddr,
    original: SocketAddr,
    redirects: &RedirectMap,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let socket = match listener {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(listener.ip(), 0))?;
    let local = socket.local_addr()?;
    redirects.register(local.port(), original);

    match timeout(connect_timeout, socket.connect(listener)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            redirects.take(local.port());
            Err(ProxyError::FlowEstablish(format!(
                "redirect connect to {}: {}", listener, e
            )))
        }
        Err(_) => {
            redirects.take(local.port());
            Err(ProxyError::FlowEstablish(format!(
                "redirect connect to {} timed out", listener
            )))
        }
    }
}

async fn run_tcp_flow(
    shared: Arc<Shared>,
    key: FlowKey,
    client_isn: u32,
    state: Arc<Mutex<TcpState>>,
    mut rx: mpsc::Receiver<TcpEvent>,
) {
    let set_state = |s: TcpState| {
        *state.lock().expect("flow state lock poisoned") = s;
    };
    let get_state = || *state.lock().expect("flow state lock poisoned");

    // Outbound connect; TLS ports detour through the intercept listener
    let redirect_to = shared
        .intercept_addr
        .filter(|_| shared.cfg.intercept_ports.contains(&key.dst.1));
    let connected = match redirect_to {
        Some(listener) => {
            connect_redirect(
                listener,
                key.dst_addr(),
                &shared.redirects,
                shared.cfg.connect_timeout,
            )
            .await
        }
        None => {
            connect_tcp_protected(
                key.dst_addr(),
                shared.protector.as_ref(),
                shared.cfg.connect_timeout,
            )
            .await
        }
    };

    let upstream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            // This flow is dropped; nothing else is affected
            warn!("flow {}: {}", key, e);
            set_state(TcpState::Closed);
            return;
        }
    };

    // Reply endpoints: responses travel dst -> src of the original flow
    let local = key.dst;
    let remote = key.src;

    let local_isn = random_isn();
    // Next byte we expect from the client / next byte we will send
    let client_next = Arc::new(AtomicU32::new(client_isn.wrapping_add(1)));
    let local_next = Arc::new(AtomicU32::new(local_isn.wrapping_add(1)));

    send_to_tun(
        &shared,
        build_tcp_packet(
            local,
            remote,
            local_isn,
            client_next.load(Ordering::SeqCst),
            tcp_flags::SYN | tcp_flags::ACK,
            TCP_WINDOW,
            &[],
        ),
    )
    .await;
    set_state(TcpState::Established);

    let (read_half, mut write_half) = upstream.into_split();
    let upstream_done = Arc::new(AtomicBool::new(false));
    let reader = tokio::spawn(run_upstream_reader(
        Arc::clone(&shared),
        key,
        read_half,
        Arc::clone(&local_next),
        Arc::clone(&client_next),
        Arc::clone(&upstream_done),
    ));

    let mut client_fin = false;
    loop {
        let idle = if get_state() == TcpState::Closing {
            TCP_CLOSING_TIMEOUT
        } else {
            TCP_IDLE_TIMEOUT
        };

        let event = match timeout(idle, rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                debug!("flow {} idle, closing", key);
                break;
            }
        };

        if event.flags & tcp_flags::RST != 0 {
            debug!("flow {} reset by client", key);
            break;
        }

        let payload_len = event.payload.len() as u32;
        let expected = client_next.load(Ordering::SeqCst);

        if payload_len > 0 {
            if event.seq == expected {
                if write_half.write_all(&event.payload).await.is_err() {
                    break;
                }
                client_next.store(expected.wrapping_add(payload_len), Ordering::SeqCst);
            } else {
                // Retransmission or out-of-order data: no reassembly, just
                // restate the acknowledgment
                trace!(
                    "flow {}: unexpected seq {} (expected {})",
                    key, event.seq, expected
                );
            }
            send_to_tun(
                &shared,
                build_tcp_packet(
                    local,
                    remote,
                    local_next.load(Ordering::SeqCst),
                    client_next.load(Ordering::SeqCst),
                    tcp_flags::ACK,
                    TCP_WINDOW,
                    &[],
                ),
            )
            .await;
        }

        if event.flags & tcp_flags::FIN != 0 {
            let fin_seq = event.seq.wrapping_add(payload_len);
            if fin_seq == client_next.load(Ordering::SeqCst) {
                client_next.store(fin_seq.wrapping_add(1), Ordering::SeqCst);
            }
            send_to_tun(
                &shared,
                build_tcp_packet(
                    local,
                    remote,
                    local_next.load(Ordering::SeqCst),
                    client_next.load(Ordering::SeqCst),
                    tcp_flags::ACK,
                    TCP_WINDOW,
                    &[],
                ),
            )
            .await;
            let _ = write_half.shutdown().await;
            set_state(TcpState::Closing);
            client_fin = true;
        }

        if client_fin && (upstream_done.load(Ordering::SeqCst) || reader.is_finished()) {
            break;
        }
    }

    set_state(TcpState::Closed);
    reader.abort();
}

/// Read the true upstream byte stream and emit it as in-order data
/// segments; a clean EOF becomes a FIN towards the client.
async fn run_upstream_reader(
    shared: Arc<Shared>,
    key: FlowKey,
    mut read_half: OwnedReadHalf,
    local_next: Arc<AtomicU32>,
    client_next: Arc<AtomicU32>,
    done: Arc<AtomicBool>,
) {
    let local = key.dst;
    let remote = key.src;
    let mut buf = vec![0u8; TCP_MSS];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                done.store(true, Ordering::SeqCst);
                let seq = local_next.fetch_add(1, Ordering::SeqCst);
                send_to_tun(
                    &shared,
                    build_tcp_packet(
                        local,
                        remote,
                        seq,
                        client_next.load(Ordering::SeqCst),
                        tcp_flags::FIN | tcp_flags::ACK,
                        TCP_WINDOW,
                        &[],
                    ),
                )
                .await;
                break;
            }
            Ok(n) => {
                let seq = local_next.fetch_add(n as u32, Ordering::SeqCst);
                send_to_tun(
                    &shared,
                    build_tcp_packet(
                        local,
                        remote,
                        seq,
                        client_next.load(Ordering::SeqCst),
                        tcp_flags::PSH | tcp_flags::ACK,
                        TCP_WINDOW,
                        &buf[..n],
                    ),
                )
                .await;
            }
            Err(e) => {
                trace!("flow {}: upstream read ended: {}", key, e);
                done.store(true, Ordering::SeqCst);
                send_to_tun(
                    &shared,
                    build_tcp_packet(
                        local,
                        remote,
                        local_next.load(Ordering::SeqCst),
                        client_next.load(Ordering::SeqCst),
                        tcp_flags::RST | tcp_flags::ACK,
                        TCP_WINDOW,
                        &[],
                    ),
                )
                .await;
                break;
            }
        }
    }
}

async fn run_udp_flow(shared: Arc<Shared>, key: FlowKey, mut rx: mpsc::Receiver<Vec<u8>>) {
    let socket = match bind_udp_protected(shared.protector.as_ref()).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("flow {}: {}", key, e);
            return;
        }
    };
    if let Err(e) = socket.connect(key.dst_addr()).await {
        warn!("flow {}: connect: {}", key, e);
        return;
    }

    let idle = shared.cfg.udp_idle_timeout;
    let mut last_activity = Instant::now();
    let mut buf = vec![0u8; 65535];

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(payload) => {
                    if socket.send(&payload).await.is_err() {
                        break;
                    }
                    last_activity = Instant::now();
                }
                None => break,
            },
            inbound = socket.recv(&mut buf) => match inbound {
                Ok(n) => {
                    last_activity = Instant::now();
                    send_to_tun(
                        &shared,
                        build_udp_packet(key.dst, key.src, &buf[..n]),
                    )
                    .await;
                }
                Err(e) => {
                    trace!("flow {}: recv: {}", key, e);
                    break;
                }
            },
            _ = tokio::time::sleep_until(last_activity + idle) => {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NullProtector;

    fn test_tracker(intercept: Option<SocketAddr>) -> (ConnectionTracker, mpsc::Receiver<Vec<u8>>) {
        let (tun_tx, tun_rx) = mpsc::channel(64);
        let tracker = ConnectionTracker::new(
            TrackerConfig {
                udp_idle_timeout: Duration::from_millis(200),
                connect_timeout: Duration::from_secs(1),
                intercept_ports: vec![443],
            },
            Arc::new(NullProtector),
            Arc::new(RedirectMap::new()),
            intercept,
            tun_tx,
        );
        (tracker, tun_rx)
    }

    #[tokio::test]
    async fn test_non_flow_packet_is_ignored() {
        let (tracker, _rx) = test_tracker(None);

        // ICMP-ish packet: protocol 1, no ports
        let mut bytes = vec![0u8; 28];
        bytes[0] = 0x45;
        bytes[2..4].copy_from_slice(&28u16.to_be_bytes());
        bytes[9] = 1;
        let packet = crate::packet::parse(&bytes).unwrap();

        tracker.handle_packet(&packet);
        assert_eq!(tracker.tcp_flow_count(), 0);
        assert_eq!(tracker.udp_flow_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_redirect_connect_unregisters() {
        let redirects = RedirectMap::new();
        // Nothing listens on this port
        let listener: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let original: SocketAddr = "93.184.216.34:443".parse().unwrap();

        let result =
            connect_redirect(listener, original, &redirects, Duration::from_secs(1)).await;
        assert!(result.is_err());

        // No stale entry may survive a failed dial
        assert!(redirects.is_empty());
    }

    #[tokio::test]
    async fn test_successful_redirect_registers_origin() {
        let accept = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = accept.local_addr().unwrap();
        let original: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let redirects = RedirectMap::new();

        let stream =
            connect_redirect(listener, original, &redirects, Duration::from_secs(1))
                .await
                .unwrap();
        let (_, peer) = accept.accept().await.unwrap();

        assert_eq!(peer.port(), stream.local_addr().unwrap().port());
        assert_eq!(redirects.take(peer.port()), Some(original));
    }
}
