//! Packet codec module
//!
//! Stateless parse/build functions for IPv4 with TCP/UDP transports, plus
//! the checksum arithmetic both directions share.

pub mod checksum;
pub mod codec;
pub mod builder;

pub use checksum::{internet_checksum, transport_checksum};
pub use codec::{parse, tcp_flags, ParsedPacket, TcpSegment, Transport, UdpDatagram,
    IPPROTO_TCP, IPPROTO_UDP};
pub use builder::{build_tcp_packet, build_udp_packet, build_udp_response};
