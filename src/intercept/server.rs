//! TLS intercept engine
//!
//! A loopback listener that terminates TLS with an on-the-fly leaf
//! certificate and re-encrypts towards the genuine destination. Entry is
//! either an explicit `CONNECT host:port` request or a transparently
//! redirected flow whose original destination is recovered from the
//! redirect table.
//!
//! Per-connection lifecycle: await ClientHello → resolve SNI → server
//! handshake / upstream connect+handshake (in parallel) → first-transaction
//! sniffing → opaque relay. Every handshake phase is timeout-bounded, and a
//! failure on either side tears the whole connection down; a half-open
//! client socket is never left behind.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use log::{debug, error, info, warn};
use openssl::ssl::{
    select_next_proto, AlpnError, Ssl, SslAcceptor, SslConnector, SslMethod,
    SslVerifyMode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::common::{
    connect_tcp_protected, ArcProtector, BufferPool, ProxyError, Result,
};
use crate::config::Config;
use crate::event::{Event, EventSender};
use crate::tls::ca::{CaCredentials, CaManager, LeafCertificate};
use crate::tls::sniffer::{looks_like_tls, peek_client_hello, ClientHelloInfo};

use super::http::HttpSniffer;

/// ALPN protocol list offered/selected: only HTTP/1.1, since that is the
/// only protocol whose first transaction we can parse
const ALPN_HTTP1: &[u8] = b"\x08http/1.1";
/// Upper bound on a CONNECT request head
const MAX_CONNECT_HEAD: usize = 8192;
/// Peek polling interval while waiting for more bytes
const PEEK_INTERVAL: Duration = Duration::from_millis(10);

/// Shared interception context, constructed once and passed to consumers.
pub struct MitmContext {
    pub ca: Arc<CaManager>,
    pub events: EventSender,
    pub protector: ArcProtector,
    pub buffers: BufferPool,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Verify upstream certificates; off by default for interception
    pub verify_upstream: bool,
}

impl MitmContext {
    pub fn new(
        config: &Config,
        ca: Arc<CaManager>,
        events: EventSender,
        protector: ArcProtector,
    ) -> Self {
        Self {
            ca,
            events,
            protector,
            buffers: BufferPool::new(config.max_buffers, config.buffer_size),
            handshake_timeout: config.handshake_timeout(),
            connect_timeout: config.connect_timeout(),
            verify_upstream: config.verify_upstream,
        }
    }

    /// Deliver an event; a gone consumer is not an error.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, hostname: Option<String>, message: String) {
        self.emit(Event::Error {
            timestamp: SystemTime::now(),
            hostname,
            message,
        });
    }
}

/// Original destinations of transparently redirected flows, keyed by the
/// redirect connection's source port.
pub struct RedirectMap {
    inner: DashMap<u16, SocketAddr>,
}

impl RedirectMap {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Record that the loopback connection from `source_port` stands in for
    /// a flow originally destined to `original_dst`.
    pub fn register(&self, source_port: u16, original_dst: SocketAddr) {
        self.inner.insert(source_port, original_dst);
    }

    /// Claim the original destination for an accepted connection.
    pub fn take(&self, source_port: u16) -> Option<SocketAddr> {
        self.inner.remove(&source_port).map(|(_, dst)| dst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for RedirectMap {
    fn default() -> Self {
        Self::new()
    }
}

/// The destination a connection is really headed for
#[derive(Debug, Clone)]
struct Origin {
    host: String,
    port: u16,
}

/// Loopback intercept listener
pub struct InterceptProxy {
    listener: TcpListener,
    ctx: Arc<MitmContext>,
    redirects: Arc<RedirectMap>,
}

impl InterceptProxy {
    /// Bind the listener. The bound address (`local_addr`) is what the NAT
    /// tracker redirects TLS-port flows to.
    pub async fn bind(
        addr: SocketAddr,
        ctx: Arc<MitmContext>,
        redirects: Arc<RedirectMap>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::Io)?;
        Ok(Self {
            listener,
            ctx,
            redirects,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the listener fails (or the task is dropped
    /// at shutdown, which closes the socket).
    pub async fn run(self) -> Result<()> {
        info!(
            "intercept listener started on {}",
            self.listener.local_addr()?
        );

        let mut tasks = JoinSet::new();

        loop {
            // Reap finished connection tasks and log their errors
            while let Some(result) = tasks.try_join_next() {
                match result {
                    Ok(Err(e)) => debug!("intercepted connection ended: {}", e),
                    Err(e) => error!("connection task panicked: {}", e),
                    Ok(Ok(())) => {}
                }
            }

            match self.listener.accept().await {
                Ok((client_stream, client_addr)) => {
                    debug!("accepted intercept connection from {}", client_addr);
                    let ctx = Arc::clone(&self.ctx);
                    let redirects = Arc::clone(&self.redirects);
                    tasks.spawn(async move {
                        handle_client(client_stream, client_addr, ctx, redirects).await
                    });
                }
                Err(e) => {
                    error!("error accepting intercept connection: {}", e);
                }
            }
        }
    }
}

/// Heuristic classification of certificate-pinning rejections.
///
/// A pinning client aborts the handshake after seeing the forged leaf; the
/// failure surfaces as an alert or verification error mentioning the
/// certificate or trust chain.
pub fn is_pinning_rejection(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    if msg.contains("certificate") && (msg.contains("pin") || msg.contains("trust")) {
        return true;
    }
    if msg.contains("alert")
        && (msg.contains("bad certificate")
            || msg.contains("unknown ca")
            || msg.contains("certificate unknown")
            || msg.contains("certificate revoked"))
    {
        return true;
    }
    msg.contains("path building failed") || msg.contains("trust anchor")
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<MitmContext>,
    redirects: Arc<RedirectMap>,
) -> Result<()> {
    // Entry phase: explicit CONNECT, or a transparent redirect whose origin
    // the tracker registered before dialing us.
    let origin = match read_connect_head(&mut stream, ctx.handshake_timeout).await? {
        Some(origin) => {
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            origin
        }
        None => match redirects.take(peer.port()) {
            Some(dst) => Origin {
                host: dst.ip().to_string(),
                port: dst.port(),
            },
            None => {
                let message = format!("no origin recorded for flow from {}", peer);
                ctx.emit_error(None, message.clone());
                return Err(ProxyError::Other(message));
            }
        },
    };

    // AWAIT_CLIENT_HELLO: peek without consuming; the same bytes feed the
    // real handshake below.
    let hello = peek_tls_client_hello(&stream, ctx.handshake_timeout).await?;
    if !hello.is_tls {
        let message = format!("non-TLS bytes on intercepted flow to {}", origin.host);
        ctx.emit_error(Some(origin.host.clone()), message.clone());
        return Err(ProxyError::TlsHandshake(message));
    }

    // SNI_RESOLVED: missing SNI degrades to the original destination host.
    let hostname = hello.sni.clone().unwrap_or_else(|| origin.host.clone());
    debug!(
        "intercepting {} (sni={:?}, alpn={:?})",
        hostname, hello.sni, hello.alpn
    );

    let root = match ctx.ca.ensure_root().await {
        Ok(root) => root,
        Err(e) => {
            ctx.emit_error(Some(hostname.clone()), e.to_string());
            return Err(e);
        }
    };
    let leaf = match ctx.ca.issue_leaf(&hostname).await {
        Ok(leaf) => leaf,
        Err(e) => {
            ctx.emit_error(Some(hostname.clone()), e.to_string());
            return Err(e);
        }
    };

    // SERVER_HANDSHAKE and UPSTREAM_CONNECTING/UPSTREAM_HANDSHAKE proceed in
    // parallel; either failure aborts both sides.
    let handshakes = futures::future::try_join(
        accept_client_tls(stream, &leaf, &root, ctx.handshake_timeout),
        connect_upstream_tls(&origin, &hostname, &ctx),
    )
    .await;

    let (client_tls, upstream_tls) = match handshakes {
        Ok(pair) => pair,
        Err(e) => {
            let message = e.to_string();
            if is_pinning_rejection(&message) {
                ctx.emit(Event::PinningDetected {
                    timestamp: SystemTime::now(),
                    hostname: hostname.clone(),
                    detail: message,
                });
            } else {
                ctx.emit_error(Some(hostname.clone()), message);
            }
            return Err(e);
        }
    };

    if let Some(proto) = client_tls.ssl().selected_alpn_protocol() {
        ctx.emit(Event::ProtocolDetected {
            timestamp: SystemTime::now(),
            hostname: hostname.clone(),
            protocol: String::from_utf8_lossy(proto).into_owned(),
        });
    }

    // RELAYING: parse the first transaction in each direction, then shuttle
    // bytes verbatim.
    relay(client_tls, upstream_tls, hostname, ctx).await
}

/// Read a CONNECT request head if one is present, consuming exactly the
/// head. Returns `None` (consuming nothing) for transparent flows, which
/// begin with a TLS record instead.
async fn read_connect_head(
    stream: &mut TcpStream,
    deadline: Duration,
) -> Result<Option<Origin>> {
    let mut buf = vec![0u8; MAX_CONNECT_HEAD];
    let started = tokio::time::Instant::now();

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before any request bytes",
            )));
        }

        let prefix = b"CONNECT ";
        let check = n.min(prefix.len());
        if buf[..check] != prefix[..check] {
            return Ok(None);
        }

        if let Some(head_end) = buf[..n].windows(4).position(|w| w == b"\r\n\r\n") {
            let head_len = head_end + 4;
            stream.read_exact(&mut buf[..head_len]).await?;
            let head = String::from_utf8_lossy(&buf[..head_len]);
            let origin = parse_connect_line(head.lines().next().unwrap_or(""))?;
            return Ok(Some(origin));
        }

        if n == buf.len() {
            return Err(ProxyError::Other("CONNECT request head too large".to_string()));
        }
        if started.elapsed() > deadline {
            return Err(ProxyError::TlsHandshake(
                "timed out waiting for CONNECT head".to_string(),
            ));
        }
        tokio::time::sleep(PEEK_INTERVAL).await;
    }
}

fn parse_connect_line(line: &str) -> Result<Origin> {
    let host_port = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ProxyError::Other(format!("malformed CONNECT line: {}", line)))?;

    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| {
                ProxyError::Other(format!("bad CONNECT port in {}", host_port))
            })?;
            Ok(Origin {
                host: host.to_string(),
                port,
            })
        }
        None => Ok(Origin {
            host: host_port.to_string(),
            port: 443,
        }),
    }
}

/// Wait for a complete ClientHello record to become peekable, then sniff
/// it. On deadline, returns whatever partial result the bytes allow.
async fn peek_tls_client_hello(
    stream: &TcpStream,
    deadline: Duration,
) -> Result<ClientHelloInfo> {
    let mut buf = vec![0u8; 5 + 16384];
    let started = tokio::time::Instant::now();

    loop {
        let n = stream.peek(&mut buf).await?;

        if n >= 5 {
            if !looks_like_tls(&buf[..n]) {
                return Ok(peek_client_hello(&buf[..n]));
            }
            let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
            if n >= 5 + record_len {
                return Ok(peek_client_hello(&buf[..n]));
            }
        }

        if started.elapsed() > deadline {
            // Sniffing failure must not block the connection
            return Ok(peek_client_hello(&buf[..n]));
        }
        tokio::time::sleep(PEEK_INTERVAL).await;
    }
}

fn build_acceptor(leaf: &LeafCertificate, root: &CaCredentials) -> Result<SslAcceptor> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    acceptor.set_private_key(&leaf.key)?;
    acceptor.set_certificate(&leaf.cert)?;
    acceptor.add_extra_chain_cert(root.cert.clone())?;
    acceptor.check_private_key()?;
    acceptor.set_alpn_select_callback(|_, client| {
        select_next_proto(ALPN_HTTP1, client).ok_or(AlpnError::NOACK)
    });
    Ok(acceptor.build())
}

async fn accept_client_tls(
    stream: TcpStream,
    leaf: &LeafCertificate,
    root: &CaCredentials,
    handshake_timeout: Duration,
) -> Result<SslStream<TcpStream>> {
    let acceptor = build_acceptor(leaf, root)?;
    let ssl = Ssl::new(acceptor.context())?;
    let mut tls = SslStream::new(ssl, stream)?;

    timeout(handshake_timeout, Pin::new(&mut tls).accept())
        .await
        .map_err(|_| ProxyError::TlsHandshake("client handshake timed out".to_string()))?
        .map_err(|e| ProxyError::TlsHandshake(format!("client handshake: {}", e)))?;

    Ok(tls)
}

async fn connect_upstream_tls(
    origin: &Origin,
    hostname: &str,
    ctx: &MitmContext,
) -> Result<SslStream<TcpStream>> {
    let mut addrs = tokio::net::lookup_host((origin.host.as_str(), origin.port))
        .await
        .map_err(|e| {
            ProxyError::FlowEstablish(format!("resolve {}: {}", origin.host, e))
        })?;
    let addr = addrs.next().ok_or_else(|| {
        ProxyError::FlowEstablish(format!("no address for {}", origin.host))
    })?;

    let tcp = connect_tcp_protected(addr, ctx.protector.as_ref(), ctx.connect_timeout)
        .await?;

    let mut builder = SslConnector::builder(SslMethod::tls())?;
    if !ctx.verify_upstream {
        // Deliberate: interception, not trust enforcement. Controlled by
        // the verify_upstream config field.
        builder.set_verify(SslVerifyMode::NONE);
    }
    builder.set_alpn_protos(ALPN_HTTP1)?;
    let connector = builder.build();

    let ssl_config = connector.configure()?.verify_hostname(ctx.verify_upstream);
    let ssl = ssl_config.into_ssl(hostname)?;
    let mut tls = SslStream::new(ssl, tcp)?;

    timeout(ctx.handshake_timeout, Pin::new(&mut tls).connect())
        .await
        .map_err(|_| {
            ProxyError::TlsHandshake("upstream handshake timed out".to_string())
        })?
        .map_err(|e| ProxyError::TlsHandshake(format!("upstream handshake: {}", e)))?;

    Ok(tls)
}

/// Relay both directions, sniffing the first HTTP message in each.
async fn relay(
    client: SslStream<TcpStream>,
    upstream: SslStream<TcpStream>,
    hostname: String,
    ctx: Arc<MitmContext>,
) -> Result<()> {
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let request_side = tokio::spawn(copy_direction(
        client_read,
        upstream_write,
        hostname.clone(),
        Arc::clone(&ctx),
    ));
    let response_side = tokio::spawn(copy_direction(
        upstream_read,
        client_write,
        hostname.clone(),
        Arc::clone(&ctx),
    ));

    // Either direction ending tears the connection down; dropping the other
    // task's half closes its socket.
    tokio::select! {
        _ = request_side => debug!("client-to-upstream relay for {} closed", hostname),
        _ = response_side => debug!("upstream-to-client relay for {} closed", hostname),
    }

    Ok(())
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    hostname: String,
    ctx: Arc<MitmContext>,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut sniffer = HttpSniffer::new();
    let mut pooled = ctx.buffers.get_buffer().await;
    let buf: &mut [u8] = &mut pooled.buffer;
    let mut total = 0usize;

    loop {
        let n = match reader.read(buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        total += n;

        if sniffer.active() {
            if let Some(transaction) = sniffer.observe(&buf[..n]) {
                emit_transaction(&ctx, &hostname, transaction);
            }
        }

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }

    if let Some(transaction) = sniffer.finish_eof() {
        emit_transaction(&ctx, &hostname, transaction);
    }
    let _ = writer.shutdown().await;

    debug!("relay for {} transferred {} bytes", hostname, total);
    Ok(())
}

fn emit_transaction(
    ctx: &MitmContext,
    hostname: &str,
    transaction: super::http::ParsedTransaction,
) {
    let message = transaction.message;
    let timestamp = SystemTime::now();

    if let Some(status) = message.status {
        ctx.emit(Event::Response {
            timestamp,
            hostname: hostname.to_string(),
            status,
            headers: message.headers,
            body_preview: transaction.body_preview,
        });
    } else if let (Some(method), Some(url)) = (message.method, message.url) {
        ctx.emit(Event::Request {
            timestamp,
            hostname: hostname.to_string(),
            method,
            url,
            headers: message.headers,
            body_preview: transaction.body_preview,
        });
    } else {
        warn!("first message on {} was neither request nor response", hostname);
    }
}
