//! IPv4/TCP/UDP packet parsing
//!
//! Stateless header parsing over a raw datagram read from the tun device.
//! `parse` returns `None` for anything malformed or unsupported; the read
//! loop drops such packets without treating them as failures.

use std::net::Ipv4Addr;

/// IP protocol numbers handled by the tracker
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// TCP flag bits
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// Parsed TCP segment view
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Parsed UDP datagram view
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Transport-layer view of a parsed packet
#[derive(Debug, Clone, Copy)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    /// Some other IP protocol; the IP fields are still available
    Other,
}

/// A parsed IPv4 packet borrowing the original buffer
#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket<'a> {
    pub header_len: usize,
    pub total_len: usize,
    pub protocol: u8,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub transport: Transport<'a>,
}

impl ParsedPacket<'_> {
    /// Source port, where the transport carries one
    pub fn src_port(&self) -> Option<u16> {
        match self.transport {
            Transport::Tcp(ref t) => Some(t.src_port),
            Transport::Udp(ref u) => Some(u.src_port),
            Transport::Other => None,
        }
    }

    /// Destination port, where the transport carries one
    pub fn dst_port(&self) -> Option<u16> {
        match self.transport {
            Transport::Tcp(ref t) => Some(t.dst_port),
            Transport::Udp(ref u) => Some(u.dst_port),
            Transport::Other => None,
        }
    }
}

fn u16_at(bytes: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([bytes[off], bytes[off + 1]])
}

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

/// Parse one raw IPv4 datagram.
///
/// Returns `None` when the buffer is shorter than a minimal IPv4 header,
/// the version is not 4, or any declared length exceeds the buffer.
pub fn parse(bytes: &[u8]) -> Option<ParsedPacket<'_>> {
    if bytes.len() < 20 {
        return None;
    }

    let version = bytes[0] >> 4;
    if version != 4 {
        return None;
    }

    let header_len = usize::from(bytes[0] & 0x0F) * 4;
    let total_len = usize::from(u16_at(bytes, 2));
    if header_len < 20 || total_len < header_len || total_len > bytes.len() {
        return None;
    }

    let protocol = bytes[9];
    let src_ip = Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]);
    let dst_ip = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);

    let transport_bytes = &bytes[header_len..total_len];
    let transport = match protocol {
        IPPROTO_TCP => {
            if transport_bytes.len() < 20 {
                return None;
            }
            let data_offset = usize::from(transport_bytes[12] >> 4) * 4;
            if data_offset < 20 || data_offset > transport_bytes.len() {
                return None;
            }
            Transport::Tcp(TcpSegment {
                src_port: u16_at(transport_bytes, 0),
                dst_port: u16_at(transport_bytes, 2),
                seq: u32_at(transport_bytes, 4),
                ack: u32_at(transport_bytes, 8),
                flags: transport_bytes[13],
                window: u16_at(transport_bytes, 14),
                payload: &transport_bytes[data_offset..],
            })
        }
        IPPROTO_UDP => {
            if transport_bytes.len() < 8 {
                return None;
            }
            Transport::Udp(UdpDatagram {
                src_port: u16_at(transport_bytes, 0),
                dst_port: u16_at(transport_bytes, 2),
                payload: &transport_bytes[8..],
            })
        }
        _ => Transport::Other,
    };

    Some(ParsedPacket {
        header_len,
        total_len,
        protocol,
        src_ip,
        dst_ip,
        transport,
    })
}
