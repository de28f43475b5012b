//! Network utility functions
//!
//! This module provides address parsing helpers and the socket protection
//! seam. Every outbound socket the proxy opens must be protected (excluded
//! from the tun device's own routing) before it connects, or traffic loops
//! straight back into the tunnel.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;

use super::error::{ProxyError, Result};

/// Parse a socket address
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match addr.to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                Ok(addr)
            } else {
                Err(ProxyError::Config(format!("Cannot resolve address: {}", addr)))
            }
        }
        Err(e) => Err(ProxyError::Config(format!(
            "Invalid address {}: {}", addr, e
        ))),
    }
}

/// Excludes a socket from the tun device's routing before it connects.
///
/// Implementations apply whatever mechanism the host platform offers
/// (SO_BINDTODEVICE towards the real uplink, firewall marks, policy
/// routing). The NAT tracker and the intercept engine call this for every
/// outbound socket they open.
pub trait SocketProtector: Send + Sync {
    /// Apply protection to the socket behind `sock`.
    fn protect(&self, sock: &SockRef<'_>) -> io::Result<()>;
}

/// Shared protector handle
pub type ArcProtector = Arc<dyn SocketProtector>;

/// Protector for setups where routing already excludes this process
/// (e.g. the tun routes only cover foreign traffic). Also used in tests.
pub struct NullProtector;

impl SocketProtector for NullProtector {
    fn protect(&self, _sock: &SockRef<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Binds outbound sockets to a named uplink interface so the kernel routes
/// them past the tun device.
pub struct DeviceProtector {
    device: String,
}

impl DeviceProtector {
    pub fn new(device: impl Into<String>) -> Self {
        Self { device: device.into() }
    }
}

impl SocketProtector for DeviceProtector {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn protect(&self, sock: &SockRef<'_>) -> io::Result<()> {
        sock.bind_device(Some(self.device.as_bytes()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn protect(&self, _sock: &SockRef<'_>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot bind to device {} on this platform", self.device),
        ))
    }
}

/// Open a protected TCP connection to `addr`, bounded by `connect_timeout`.
pub async fn connect_tcp_protected(
    addr: SocketAddr,
    protector: &dyn SocketProtector,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    protector.protect(&SockRef::from(&socket))?;

    let stream = timeout(connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            ProxyError::FlowEstablish(format!("connect to {} timed out", addr))
        })?
        .map_err(|e| ProxyError::FlowEstablish(format!("connect to {}: {}", addr, e)))?;

    Ok(stream)
}

/// Bind a protected UDP socket on an ephemeral local port.
pub async fn bind_udp_protected(protector: &dyn SocketProtector) -> Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    protector.protect(&SockRef::from(&socket))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_socket_addr() {
        let addr = parse_socket_addr("127.0.0.1:8443").unwrap();
        assert_eq!(addr.port(), 8443);

        assert!(parse_socket_addr("not an address").is_err());
    }

    #[tokio::test]
    async fn test_protected_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream =
            connect_tcp_protected(addr, &NullProtector, Duration::from_secs(1)).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_flow_error() {
        // Port 1 on loopback is almost certainly closed.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result =
            connect_tcp_protected(addr, &NullProtector, Duration::from_secs(1)).await;
        match result {
            Err(ProxyError::FlowEstablish(_)) => {}
            other => panic!("expected FlowEstablish, got {:?}", other.map(|_| ())),
        }
    }
}
