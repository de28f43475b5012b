//! Flow identification and lifecycle types

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::packet::{ParsedPacket, Transport};

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProto {
    Tcp,
    Udp,
}

/// 5-tuple identifying one logical connection. At most one live flow exists
/// per key at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub proto: FlowProto,
    pub src: (Ipv4Addr, u16),
    pub dst: (Ipv4Addr, u16),
}

impl FlowKey {
    /// Derive the key from a parsed packet, when it carries a port-bearing
    /// transport.
    pub fn from_packet(packet: &ParsedPacket<'_>) -> Option<Self> {
        let (proto, src_port, dst_port) = match packet.transport {
            Transport::Tcp(ref tcp) => (FlowProto::Tcp, tcp.src_port, tcp.dst_port),
            Transport::Udp(ref udp) => (FlowProto::Udp, udp.src_port, udp.dst_port),
            Transport::Other => return None,
        };
        Some(Self {
            proto,
            src: (packet.src_ip, src_port),
            dst: (packet.dst_ip, dst_port),
        })
    }

    /// The flow's destination as a socket address
    pub fn dst_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.dst.0, self.dst.1))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            FlowProto::Tcp => "tcp",
            FlowProto::Udp => "udp",
        };
        write!(
            f,
            "{} {}:{} -> {}:{}",
            proto, self.src.0, self.src.1, self.dst.0, self.dst.1
        )
    }
}

/// TCP flow lifecycle
///
/// `SynSent` covers the window between the client's SYN and the upstream
/// connect completing; a RST in any state short-circuits to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    Established,
    Closing,
    Closed,
}
